use crate::{
    config::{self, ConfigIndex},
    controller::{self, Context},
    prober::Prober,
    store::KubeWriter,
};
use anyhow::{bail, Result};
use clap::Parser;
use istio_ingress_controller_core::HashProbeInjector;
use istio_ingress_controller_k8s_api::{
    istio::{DestinationRule, Gateway, VirtualService},
    ConfigMap, Endpoints, Secret, Service,
};
use istio_ingress_controller_k8s_reconciler::{
    Clients, ReconcileMetrics, Reconciler, Store, Stores,
};
use kube::{runtime::watcher, Api};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "istio-ingress",
    about = "Programs Istio gateways for Knative Ingresses"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "istio_ingress=info,warn",
        env = "ISTIO_INGRESS_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "cluster.local")]
    cluster_domain: String,

    /// The namespace that holds the controller's ConfigMaps.
    #[clap(long, default_value = "knative-serving")]
    system_namespace: String,

    #[clap(long, default_value = "config-istio")]
    istio_config_map: String,

    #[clap(long, default_value = "config-network")]
    network_config_map: String,

    /// Bounds each probe request sent to a gateway pod.
    #[clap(long, default_value = "5000")]
    probe_timeout_ms: u64,

    #[clap(long, default_value = "5")]
    not_ready_requeue_secs: u64,

    #[clap(long, default_value = "30")]
    error_requeue_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            cluster_domain,
            system_namespace,
            istio_config_map,
            network_config_map,
            probe_timeout_ms,
            not_ready_requeue_secs,
            error_requeue_secs,
        } = self;

        let mut prom = <Registry>::default();
        let metrics = ReconcileMetrics::register(prom.sub_registry_with_prefix("ingress"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Spawn the ConfigMap watches. Every reconcile pass reads the latest
        // snapshot, and each change re-enqueues all Ingresses.
        let (config_index, config_rx) =
            ConfigIndex::new(cluster_domain.clone(), istio_config_map, network_config_map);
        let config_api = Api::<ConfigMap>::namespaced(runtime.client(), &system_namespace);
        let config_maps = runtime.watch(config_api, watcher::Config::default());
        tokio::spawn(
            config::run(config_index, config_maps).instrument(info_span!("configmaps")),
        );

        // Spawn resource watches.

        let gateways = Store::<Gateway>::shared();
        let gateway_events = runtime.watch_all::<Gateway>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(gateways.clone(), gateway_events)
                .instrument(info_span!("gateways")),
        );

        let virtual_services = Store::<VirtualService>::shared();
        let virtual_service_events =
            runtime.watch_all::<VirtualService>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(virtual_services.clone(), virtual_service_events)
                .instrument(info_span!("virtualservices")),
        );

        let destination_rules = Store::<DestinationRule>::shared();
        let destination_rule_events =
            runtime.watch_all::<DestinationRule>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(destination_rules.clone(), destination_rule_events)
                .instrument(info_span!("destinationrules")),
        );

        let secrets = Store::<Secret>::shared();
        let secret_events = runtime.watch_all::<Secret>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(secrets.clone(), secret_events)
                .instrument(info_span!("secrets")),
        );

        let services = Store::<Service>::shared();
        let service_events = runtime.watch_all::<Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(services.clone(), service_events)
                .instrument(info_span!("services")),
        );

        let endpoints = Store::<Endpoints>::shared();
        let endpoints_events = runtime.watch_all::<Endpoints>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(endpoints.clone(), endpoints_events)
                .instrument(info_span!("endpoints")),
        );

        let stores = Stores {
            gateways,
            virtual_services,
            destination_rules,
            secrets,
            services,
            endpoints,
        };

        let k8s = runtime.client();
        let clients = Clients {
            gateways: Arc::new(KubeWriter::<Gateway>::new(k8s.clone())),
            virtual_services: Arc::new(KubeWriter::<VirtualService>::new(k8s.clone())),
            destination_rules: Arc::new(KubeWriter::<DestinationRule>::new(k8s.clone())),
            secrets: Arc::new(KubeWriter::<Secret>::new(k8s.clone())),
        };

        let injector = Arc::new(HashProbeInjector);
        let prober = Prober::new(
            &stores,
            cluster_domain,
            injector.clone(),
            Duration::from_millis(probe_timeout_ms),
        );
        let reconciler = Reconciler::new(stores, clients, Arc::new(prober), injector);

        let ctx = Context::new(
            k8s,
            reconciler,
            config_rx,
            metrics,
            Duration::from_secs(not_ready_requeue_secs),
            Duration::from_secs(error_requeue_secs),
        );
        tokio::spawn(controller::run(ctx).instrument(info_span!("ingresses")));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
