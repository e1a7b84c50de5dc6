use futures::prelude::*;
use istio_ingress_controller_core::ConfigSnapshot;
use istio_ingress_controller_k8s_api::{
    istio::{Gateway, VirtualService},
    Ingress, ResourceExt, Secret,
};
use istio_ingress_controller_k8s_reconciler::{
    self as reconciler,
    metrics::Outcome,
    ReconcileMetrics, Reconciler, FINALIZER,
};
use kube::{
    api::{Patch, PatchParams},
    runtime::{
        controller::{Action, Controller},
        finalizer::{self, finalizer},
        reflector::ObjectRef,
        watcher,
    },
    Api, Client,
};
use std::sync::Arc;
use tokio::{
    sync::watch,
    time::{Duration, Instant},
};
use tokio_stream::wrappers::WatchStream;
use tracing::{info_span, Instrument};

const FIELD_MANAGER: &str = "istio-ingress-controller";

/// Everything a reconcile pass needs, shared across passes.
pub struct Context {
    client: Client,
    reconciler: Reconciler,
    config: watch::Receiver<ConfigSnapshot>,
    metrics: ReconcileMetrics,
    not_ready_requeue: Duration,
    error_requeue: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Reconcile(#[from] reconciler::Error),

    #[error("failed to patch Ingress status: {0}")]
    Status(#[source] kube::Error),
}

/// Runs the Ingress controller until its watches end.
///
/// Ingresses are re-enqueued when a Gateway or VirtualService they own
/// changes, when a Secret they replicate changes, and whenever the
/// configuration changes.
pub async fn run(ctx: Context) {
    let ingresses = Api::<Ingress>::all(ctx.client.clone());
    let gateways = Api::<Gateway>::all(ctx.client.clone());
    let virtual_services = Api::<VirtualService>::all(ctx.client.clone());
    let secrets = Api::<Secret>::all(ctx.client.clone());

    let tracker = ctx.reconciler.secret_tracker();
    let config_changes = WatchStream::from_changes(ctx.config.clone()).map(|_| ());

    Controller::new(ingresses, watcher::Config::default())
        .owns(gateways, watcher::Config::default())
        .owns(virtual_services, watcher::Config::default())
        .watches(secrets, watcher::Config::default(), move |secret| {
            tracker
                .ingresses_for(&secret)
                .into_iter()
                .map(|id| ObjectRef::<Ingress>::new(&id.name).within(&id.namespace))
                .collect::<Vec<_>>()
        })
        .reconcile_all_on(config_changes)
        .run(reconcile, error_policy, Arc::new(ctx))
        .for_each(|result| async move {
            match result {
                Ok((ing, _)) => tracing::trace!(ingress = %ing, "Reconciled"),
                Err(error) => tracing::debug!(%error, "Controller error"),
            }
        })
        .await;
}

async fn reconcile(
    ing: Arc<Ingress>,
    ctx: Arc<Context>,
) -> Result<Action, finalizer::Error<Error>> {
    if !is_managed(&ing) {
        return Ok(Action::await_change());
    }

    let namespace = ing.namespace().unwrap_or_default();
    let span = info_span!("ingress", %namespace, name = %ing.name_any());
    let api = Api::<Ingress>::namespaced(ctx.client.clone(), &namespace);
    finalizer(&api, FINALIZER, ing, |event| async {
        match event {
            finalizer::Event::Apply(ing) => ctx.apply(&api, ing).await,
            finalizer::Event::Cleanup(ing) => ctx.cleanup(ing).await,
        }
    })
    .instrument(span)
    .await
}

fn error_policy(ing: Arc<Ingress>, error: &finalizer::Error<Error>, ctx: Arc<Context>) -> Action {
    tracing::warn!(
        namespace = %ing.namespace().unwrap_or_default(),
        name = %ing.name_any(),
        %error,
        "Failed to reconcile Ingress",
    );
    Action::requeue(ctx.error_requeue)
}

/// Ingresses of another class are left alone, unless they still carry this
/// controller's finalizer and are being deleted.
fn is_managed(ing: &Ingress) -> bool {
    if ing.is_istio_class() {
        return true;
    }
    ing.metadata.deletion_timestamp.is_some() && ing.finalizers().iter().any(|f| f == FINALIZER)
}

fn outcome(result: &Result<(), reconciler::Error>, ing: &Ingress) -> Outcome {
    match result {
        Ok(()) if ing.is_ready() => Outcome::Ready,
        Ok(()) => Outcome::NotReady,
        Err(error) if error.is_not_owned() => Outcome::NotOwned,
        Err(_) => Outcome::Error,
    }
}

// === impl Context ===

impl Context {
    pub fn new(
        client: Client,
        reconciler: Reconciler,
        config: watch::Receiver<ConfigSnapshot>,
        metrics: ReconcileMetrics,
        not_ready_requeue: Duration,
        error_requeue: Duration,
    ) -> Self {
        Self {
            client,
            reconciler,
            config,
            metrics,
            not_ready_requeue,
            error_requeue,
        }
    }

    fn config(&self) -> ConfigSnapshot {
        self.config.borrow().clone()
    }

    /// Runs a reconcile pass and writes back the status it computed, even
    /// when the pass failed.
    async fn apply(&self, api: &Api<Ingress>, ing: Arc<Ingress>) -> Result<Action, Error> {
        let started = Instant::now();
        let config = self.config();
        let mut updated = (*ing).clone();
        let result = self.reconciler.reconcile_kind(&mut updated, &config).await;
        let outcome = outcome(&result, &updated);
        self.metrics.reconciled(outcome, started.elapsed());

        let patched = if updated.status != ing.status {
            self.patch_status(api, &updated).await
        } else {
            Ok(())
        };

        result?;
        patched?;
        tracing::debug!(?outcome, "Reconciled Ingress");
        match outcome {
            Outcome::Ready => Ok(Action::await_change()),
            _ => Ok(Action::requeue(self.not_ready_requeue)),
        }
    }

    async fn cleanup(&self, ing: Arc<Ingress>) -> Result<Action, Error> {
        let started = Instant::now();
        let config = self.config();
        let result = self.reconciler.finalize_kind(&ing, &config).await;
        let outcome = match &result {
            Ok(()) => Outcome::Ready,
            Err(error) if error.is_not_owned() => Outcome::NotOwned,
            Err(_) => Outcome::Error,
        };
        self.metrics.finalized(outcome, started.elapsed());

        result?;
        tracing::info!("Finalized Ingress");
        Ok(Action::await_change())
    }

    async fn patch_status(&self, api: &Api<Ingress>, ing: &Ingress) -> Result<(), Error> {
        let patch = serde_json::json!({ "status": ing.status });
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.patch_status(&ing.name_any(), &params, &Patch::Merge(&patch))
            .await
            .map_err(Error::Status)?;
        Ok(())
    }
}
