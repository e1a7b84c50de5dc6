use crate::{
    accessor::{self, Converge},
    store::{ClientError, Lister, Writer},
    tracker::{ResourceId, SecretTracker},
    Error,
};
use istio_ingress_controller_core::{ConfigSnapshot, GatewaysByVisibility, HttpProtocol, ProbeInjector};
use istio_ingress_controller_k8s_api::{
    ingress::{
        HttpOption, IngressTls, LoadBalancerIngressStatus, INGRESS_CLASS_ANNOTATION,
        ISTIO_INGRESS_CLASS,
    },
    istio::{DestinationRule, Gateway, VirtualService},
    labels::{INGRESS_LABEL, ROUTE_LABEL, ROUTE_NAMESPACE_LABEL},
    Endpoints, Ingress, Owned, Owner, Resource, ResourceExt, Secret, Selector, Service, Visibility,
};
use istio_ingress_controller_k8s_resources::{
    destination_rule, gateway, secret, virtual_service,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// Cached reads of every kind the engine looks at.
#[derive(Clone)]
pub struct Stores {
    pub gateways: Arc<dyn Lister<Gateway>>,
    pub virtual_services: Arc<dyn Lister<VirtualService>>,
    pub destination_rules: Arc<dyn Lister<DestinationRule>>,
    pub secrets: Arc<dyn Lister<Secret>>,
    pub services: Arc<dyn Lister<Service>>,
    pub endpoints: Arc<dyn Lister<Endpoints>>,
}

/// Writes for every kind the engine manages.
#[derive(Clone)]
pub struct Clients {
    pub gateways: Arc<dyn Writer<Gateway>>,
    pub virtual_services: Arc<dyn Writer<VirtualService>>,
    pub destination_rules: Arc<dyn Writer<DestinationRule>>,
    pub secrets: Arc<dyn Writer<Secret>>,
}

/// Decides whether the gateways serve the current generation of an Ingress.
#[async_trait::async_trait]
pub trait StatusManager: Send + Sync {
    async fn is_ready(&self, ing: &Ingress, gateways: &GatewaysByVisibility)
        -> anyhow::Result<bool>;

    /// Drops any state kept for an Ingress that is being deleted.
    fn forget(&self, _ingress: &ResourceId) {}
}

/// The Ingress convergence engine.
///
/// Each pass runs its phases in order and stops at the first error; the
/// caller is expected to retry the whole pass.
pub struct Reconciler {
    stores: Stores,
    clients: Clients,
    status: Arc<dyn StatusManager>,
    probe: Arc<dyn ProbeInjector>,
    secrets: Arc<SecretTracker>,
}

const NOT_RECONCILED_REASON: &str = "ReconcileIngressFailed";
const NOT_RECONCILED_MESSAGE: &str = "Ingress reconciliation failed";

// === impl Reconciler ===

impl Reconciler {
    pub fn new(
        stores: Stores,
        clients: Clients,
        status: Arc<dyn StatusManager>,
        probe: Arc<dyn ProbeInjector>,
    ) -> Self {
        Self {
            stores,
            clients,
            status,
            probe,
            secrets: Arc::default(),
        }
    }

    pub fn secret_tracker(&self) -> Arc<SecretTracker> {
        self.secrets.clone()
    }

    /// Converges the cluster toward `ing` and updates its status in place.
    pub async fn reconcile_kind(
        &self,
        ing: &mut Ingress,
        config: &ConfigSnapshot,
    ) -> Result<(), Error> {
        ing.set_defaults();
        ing.reset_stale_status();
        let generation = ing.metadata.generation;
        let status = ing.status_mut();
        status.initialize_conditions();
        status.observed_generation = generation;

        if let Err(error) = self.reconcile_ingress(ing, config).await {
            ing.status_mut()
                .mark_ingress_not_ready(NOT_RECONCILED_REASON, NOT_RECONCILED_MESSAGE);
            return Err(error);
        }
        Ok(())
    }

    async fn reconcile_ingress(
        &self,
        ing: &mut Ingress,
        config: &ConfigSnapshot,
    ) -> Result<(), Error> {
        let defaults = config.qualified_gateway_names();
        let mut gateway_names = GatewaysByVisibility {
            external: BTreeSet::new(),
            cluster_local: defaults.cluster_local.clone(),
        };

        let mut external_gateways = Vec::new();
        let external_tls = ing.tls_for_visibility(Visibility::ExternalIp);
        if ing.is_public() && !external_tls.is_empty() {
            let (gateways, wildcards) = self
                .reconcile_tls(ing, &external_tls, Visibility::ExternalIp, config)
                .await?;
            external_gateways = gateways;
            gateway_names.external.extend(wildcards);
        }

        let mut local_gateways = Vec::new();
        let local_tls = ing.tls_for_visibility(Visibility::ClusterLocal);
        if config.network.cluster_local_domain_tls && !local_tls.is_empty() {
            let (gateways, wildcards) = self
                .reconcile_tls(ing, &local_tls, Visibility::ClusterLocal, config)
                .await?;
            local_gateways = gateways;
            gateway_names.cluster_local.extend(wildcards);
        }

        let protocol = http_protocol(ing, config);
        let http_required = ing.is_public()
            && (protocol == HttpProtocol::Redirected || !external_tls.is_empty());
        if http_required {
            if let Some(server) = gateway::make_http_server(protocol, vec!["*".to_string()]) {
                if external_gateways.is_empty() {
                    let services = self.gateway_services(config, Visibility::ExternalIp)?;
                    external_gateways = gateway::make_ingress_gateways(ing, &[server], &services);
                } else {
                    for gw in external_gateways.iter_mut() {
                        gw.resource.spec.servers.push(server.clone());
                        gateway::sort_servers(&mut gw.resource.spec.servers);
                    }
                }
            }
        }
        if external_gateways.is_empty() {
            // Without Ingress-specific gateways, traffic flows through the
            // shared default gateways.
            gateway_names.external.extend(defaults.external);
        }

        gateway_names.external.extend(gateway::qualified_gateway_names(
            external_gateways.iter().map(|gw| &gw.resource),
        ));
        gateway_names.cluster_local.extend(gateway::qualified_gateway_names(
            local_gateways.iter().map(|gw| &gw.resource),
        ));
        for desired in external_gateways.into_iter().chain(local_gateways) {
            reconcile_owned(
                ing,
                self.stores.gateways.as_ref(),
                self.clients.gateways.as_ref(),
                desired,
            )
            .await?;
        }

        let virtual_services = virtual_service::make_virtual_services(
            ing,
            &gateway_names,
            self.probe.as_ref(),
            &config.cluster_domain,
        )?;
        self.reconcile_virtual_services(ing, virtual_services)
            .await?;

        if config.network.system_internal_tls {
            let destination_rules = destination_rule::make_internal_encryption_destination_rules(
                ing,
                |namespace, name| self.stores.services.get(namespace, name).map(|svc| (*svc).clone()),
                &config.cluster_domain,
            )?;
            for desired in destination_rules {
                reconcile_owned(
                    ing,
                    self.stores.destination_rules.as_ref(),
                    self.clients.destination_rules.as_ref(),
                    desired,
                )
                .await?;
            }
        }

        ing.status_mut().mark_network_configured();

        if ing.is_ready() {
            return Ok(());
        }
        let ready = self
            .status
            .is_ready(ing, &gateway_names)
            .await
            .map_err(Error::Probe)?;
        let status = ing.status_mut();
        if ready {
            status.mark_load_balancer_ready(
                load_balancer_status(config.gateway_service_url(Visibility::ExternalIp)),
                load_balancer_status(config.gateway_service_url(Visibility::ClusterLocal)),
            );
        } else {
            status.mark_load_balancer_not_ready();
        }
        Ok(())
    }

    /// Replicates the TLS Secrets for one visibility, reconciles the shared
    /// wildcard gateways and returns the Ingress's own TLS gateways along
    /// with the names of the wildcard gateways it may use.
    async fn reconcile_tls(
        &self,
        ing: &mut Ingress,
        tls: &[IngressTls],
        visibility: Visibility,
        config: &ConfigSnapshot,
    ) -> Result<(Vec<Owned<Gateway>>, BTreeSet<String>), Error> {
        let id = ResourceId::of(&*ing);
        for entry in tls {
            self.secrets.track(
                ResourceId::new(&entry.secret_namespace, &entry.secret_name),
                id.clone(),
            );
        }

        let origins = secret::get_secrets(tls, |namespace, name| {
            self.stores
                .secrets
                .get(namespace, name)
                .map(|secret| (*secret).clone())
        })?;
        let (non_wildcard, wildcard) = secret::categorize_secrets(&origins)?;

        let services = self.gateway_services(config, visibility)?;
        let namespaces = services
            .iter()
            .filter_map(|svc| svc.namespace())
            .collect::<BTreeSet<_>>();

        for desired in secret::make_secrets(ing, &non_wildcard, &namespaces) {
            reconcile_owned(
                ing,
                self.stores.secrets.as_ref(),
                self.clients.secrets.as_ref(),
                desired,
            )
            .await?;
        }
        let gateways = gateway::make_ingress_tls_gateways(
            ing,
            &secret::non_wildcard_tls(tls, &non_wildcard),
            &non_wildcard,
            &services,
        )?;

        for desired in secret::make_wildcard_secrets(&wildcard, &namespaces) {
            reconcile_owned(
                ing,
                self.stores.secrets.as_ref(),
                self.clients.secrets.as_ref(),
                desired,
            )
            .await?;
        }
        let wildcard_gateways = gateway::make_wildcard_tls_gateways(&wildcard, &services)?;
        let wildcard_names =
            gateway::qualified_gateway_names(wildcard_gateways.iter().map(|gw| &gw.resource));
        for desired in wildcard_gateways {
            reconcile_owned(
                ing,
                self.stores.gateways.as_ref(),
                self.clients.gateways.as_ref(),
                desired,
            )
            .await?;
        }

        Ok((gateways, wildcard_names))
    }

    async fn reconcile_virtual_services(
        &self,
        ing: &mut Ingress,
        desired: Vec<Owned<VirtualService>>,
    ) -> Result<(), Error> {
        let namespace = ing.namespace().unwrap_or_default();
        let mut kept = BTreeSet::new();
        for vs in desired {
            let class = vs.resource.annotations().get(INGRESS_CLASS_ANNOTATION);
            if class.map(String::as_str) != Some(ISTIO_INGRESS_CLASS) {
                tracing::info!(name = %vs.resource.name_any(), "Skipping VirtualService of another ingress class");
                continue;
            }
            let name = vs.resource.name_any();
            reconcile_owned(
                ing,
                self.stores.virtual_services.as_ref(),
                self.clients.virtual_services.as_ref(),
                vs,
            )
            .await?;
            kept.insert(name);
        }

        let name = ing.name_any();
        let selectors = [
            Selector::from_iter(Some((INGRESS_LABEL.to_string(), name.clone()))),
            Selector::from_iter([
                (ROUTE_LABEL.to_string(), name.clone()),
                (ROUTE_NAMESPACE_LABEL.to_string(), namespace.clone()),
            ]),
        ];
        let existing = selectors
            .iter()
            .flat_map(|selector| self.stores.virtual_services.list(Some(&namespace), selector))
            .map(|vs| (vs.name_any(), vs))
            .collect::<BTreeMap<_, _>>();

        let owner = Owner::ingress(ing);
        for (vs_name, vs) in existing {
            if kept.contains(&vs_name) || !owner.controls(vs.as_ref()) {
                continue;
            }
            match self
                .clients
                .virtual_services
                .delete(&namespace, &vs_name)
                .await
            {
                Ok(()) => tracing::info!(%namespace, name = %vs_name, "Deleted stale VirtualService"),
                Err(ClientError::NotFound) => {}
                Err(source) => {
                    return Err(Error::client(
                        "delete",
                        VirtualService::kind(&()),
                        &namespace,
                        &vs_name,
                        source,
                    ))
                }
            }
        }
        Ok(())
    }

    /// Removes everything an Ingress added to shared resources.
    pub async fn finalize_kind(&self, ing: &Ingress, config: &ConfigSnapshot) -> Result<(), Error> {
        for gw in config
            .istio
            .ingress_gateways
            .iter()
            .chain(config.istio.local_gateways.iter())
        {
            let gateway = self.stores.gateways.get(&gw.namespace, &gw.name).ok_or_else(|| {
                Error::GatewayNotFound {
                    namespace: gw.namespace.clone(),
                    name: gw.name.clone(),
                }
            })?;
            let existing = gateway::get_servers(&gateway, ing);
            if existing.is_empty() {
                continue;
            }
            let updated = gateway::update_gateway((*gateway).clone(), Vec::new(), &existing);
            self.clients
                .gateways
                .update(updated)
                .await
                .map_err(|source| {
                    Error::client("update", Gateway::kind(&()), &gw.namespace, &gw.name, source)
                })?;
            tracing::info!(gateway = %gw.qualified_name(), servers = existing.len(), "Removed servers from gateway");
        }

        self.delete_secret_copies(ing, config).await?;

        let id = ResourceId::of(ing);
        self.secrets.forget(&id);
        self.status.forget(&id);
        Ok(())
    }

    /// Deletes the copies of the Ingress's TLS Secrets that it controls.
    /// Every copy is attempted; the first failure is returned.
    async fn delete_secret_copies(&self, ing: &Ingress, config: &ConfigSnapshot) -> Result<(), Error> {
        let namespaces = config
            .istio
            .ingress_gateways
            .iter()
            .chain(config.istio.local_gateways.iter())
            .filter_map(|gw| gw.service().ok().map(|(namespace, _)| namespace.to_string()))
            .collect::<BTreeSet<_>>();
        let owner = Owner::ingress(ing);

        let mut first_error = None;
        for tls in ing.spec.tls.iter() {
            let selector = Selector::from_map(secret::make_target_secret_labels(
                &tls.secret_name,
                &tls.secret_namespace,
            ));
            for namespace in namespaces.iter() {
                for copy in self.stores.secrets.list(Some(namespace), &selector) {
                    if !owner.controls(copy.as_ref()) {
                        continue;
                    }
                    let name = copy.name_any();
                    match self.clients.secrets.delete(namespace, &name).await {
                        Ok(()) => tracing::info!(%namespace, %name, "Deleted Secret copy"),
                        Err(ClientError::NotFound) => {}
                        Err(source) => {
                            tracing::warn!(%namespace, %name, error = %source, "Failed to delete Secret copy");
                            if first_error.is_none() {
                                first_error = Some(Error::client(
                                    "delete",
                                    Secret::kind(&()),
                                    namespace,
                                    &name,
                                    source,
                                ));
                            }
                        }
                    }
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Resolves the Services behind the configured gateways of a visibility.
    fn gateway_services(
        &self,
        config: &ConfigSnapshot,
        visibility: Visibility,
    ) -> Result<Vec<Service>, Error> {
        config
            .gateways(visibility)
            .iter()
            .map(|gw| {
                let unresolved = || Error::GatewayService {
                    gateway: gw.qualified_name(),
                    service: gw.service_url.clone(),
                };
                let (namespace, name) = gw.service().map_err(|_| unresolved())?;
                self.stores
                    .services
                    .get(namespace, name)
                    .map(|svc| (*svc).clone())
                    .ok_or_else(unresolved)
            })
            .collect()
    }
}

/// Reconciles one resource and records an ownership conflict on the
/// Ingress status.
async fn reconcile_owned<K: Converge>(
    ing: &mut Ingress,
    lister: &dyn Lister<K>,
    writer: &dyn Writer<K>,
    desired: Owned<K>,
) -> Result<K, Error> {
    let name = desired.resource.name_any();
    accessor::reconcile(lister, writer, desired)
        .await
        .map_err(|error| {
            if error.is_not_owned() {
                ing.status_mut()
                    .mark_resource_not_owned(&K::kind(&()), &name);
            }
            error
        })
}

fn http_protocol(ing: &Ingress, config: &ConfigSnapshot) -> HttpProtocol {
    match ing.spec.http_option {
        Some(HttpOption::Enabled) => HttpProtocol::Enabled,
        Some(HttpOption::Redirected) => HttpProtocol::Redirected,
        None => config.network.http_protocol,
    }
}

fn load_balancer_status(service_url: &str) -> Vec<LoadBalancerIngressStatus> {
    if service_url.is_empty() {
        return vec![LoadBalancerIngressStatus {
            mesh_only: true,
            ..Default::default()
        }];
    }
    vec![LoadBalancerIngressStatus {
        domain_internal: Some(service_url.to_string()),
        ..Default::default()
    }]
}
