use crate::{
    store::{Lister, Writer},
    Error,
};
use istio_ingress_controller_k8s_api::{
    istio::{DestinationRule, Gateway, VirtualService},
    Owned, Resource, ResourceExt, Secret,
};

/// Compares and copies the fields of a resource that this controller
/// manages. Everything else (status, owner references, fields set by other
/// controllers) is left as found.
pub trait Converge: Resource<DynamicType = ()> + Clone + Send + Sync + 'static {
    fn converged(&self, desired: &Self) -> bool;

    fn converge(&mut self, desired: Self);
}

/// Creates `desired` if it does not exist, or updates the existing resource
/// when it has drifted. An existing resource that is not controlled by the
/// desired owner is left untouched and reported as [`Error::NotOwned`].
pub(crate) async fn reconcile<K: Converge>(
    lister: &dyn Lister<K>,
    writer: &dyn Writer<K>,
    desired: Owned<K>,
) -> Result<K, Error> {
    let namespace = desired.resource.namespace().unwrap_or_default();
    let name = desired.resource.name_any();
    let kind = K::kind(&());

    let Some(existing) = lister.get(&namespace, &name) else {
        let created = writer
            .create(desired.into_resource())
            .await
            .map_err(|source| Error::client("create", &kind, &namespace, &name, source))?;
        tracing::info!(%kind, %namespace, %name, "Created");
        return Ok(created);
    };

    if !desired.owner.controls(existing.as_ref()) {
        return Err(Error::NotOwned {
            kind: kind.to_string(),
            namespace,
            name,
        });
    }

    if existing.converged(&desired.resource) {
        return Ok((*existing).clone());
    }

    let mut resource = (*existing).clone();
    resource.converge(desired.resource);
    let updated = writer
        .update(resource)
        .await
        .map_err(|source| Error::client("update", &kind, &namespace, &name, source))?;
    tracing::info!(%kind, %namespace, %name, "Updated");
    Ok(updated)
}

// === impl Converge ===

impl Converge for Gateway {
    fn converged(&self, desired: &Self) -> bool {
        self.spec == desired.spec
    }

    fn converge(&mut self, desired: Self) {
        self.spec = desired.spec;
    }
}

impl Converge for VirtualService {
    fn converged(&self, desired: &Self) -> bool {
        self.spec == desired.spec
            && self.metadata.labels == desired.metadata.labels
            && self.metadata.annotations == desired.metadata.annotations
    }

    fn converge(&mut self, desired: Self) {
        self.spec = desired.spec;
        self.metadata.labels = desired.metadata.labels;
        self.metadata.annotations = desired.metadata.annotations;
    }
}

impl Converge for DestinationRule {
    fn converged(&self, desired: &Self) -> bool {
        self.spec == desired.spec
            && self.metadata.labels == desired.metadata.labels
            && self.metadata.annotations == desired.metadata.annotations
    }

    fn converge(&mut self, desired: Self) {
        self.spec = desired.spec;
        self.metadata.labels = desired.metadata.labels;
        self.metadata.annotations = desired.metadata.annotations;
    }
}

impl Converge for Secret {
    fn converged(&self, desired: &Self) -> bool {
        self.data == desired.data
            && self.type_ == desired.type_
            && self.metadata.labels == desired.metadata.labels
            && self.metadata.annotations == desired.metadata.annotations
    }

    fn converge(&mut self, desired: Self) {
        self.data = desired.data;
        self.type_ = desired.type_;
        self.metadata.labels = desired.metadata.labels;
        self.metadata.annotations = desired.metadata.annotations;
    }
}
