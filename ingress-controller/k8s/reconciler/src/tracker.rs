use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use istio_ingress_controller_k8s_api::{ResourceExt, Secret};
use istio_ingress_controller_k8s_resources::secret;
use parking_lot::Mutex;

#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

/// Remembers which Ingresses refer to which origin Secrets, so that a change
/// to a Secret (or to one of its copies) re-triggers those Ingresses.
#[derive(Debug, Default)]
pub struct SecretTracker {
    by_secret: Mutex<HashMap<ResourceId, HashSet<ResourceId>>>,
}

// === impl ResourceId ===

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of<K: ResourceExt>(resource: &K) -> Self {
        Self::new(resource.namespace().unwrap_or_default(), resource.name_any())
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl SecretTracker ===

impl SecretTracker {
    pub fn track(&self, secret: ResourceId, ingress: ResourceId) {
        self.by_secret.lock().entry(secret).or_default().insert(ingress);
    }

    /// Drops every reference held by `ingress`.
    pub fn forget(&self, ingress: &ResourceId) {
        let mut by_secret = self.by_secret.lock();
        by_secret.retain(|_, ingresses| {
            ingresses.remove(ingress);
            !ingresses.is_empty()
        });
    }

    /// Returns the Ingresses affected by a change to `secret`. Copies are
    /// resolved to the origin Secret they were made from.
    pub fn ingresses_for(&self, secret: &Secret) -> Vec<ResourceId> {
        let id = match secret::extract_origin_secret_ref(secret) {
            Some((namespace, name)) => ResourceId::new(namespace, name),
            None => ResourceId::of(secret),
        };
        let mut ingresses = self
            .by_secret
            .lock()
            .get(&id)
            .map(|ingresses| ingresses.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        ingresses.sort();
        ingresses
    }
}
