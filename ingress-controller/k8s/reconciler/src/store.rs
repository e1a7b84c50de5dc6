use ahash::AHashMap as HashMap;
use istio_ingress_controller_k8s_api::{labels::Selector, Labels, Resource, ResourceExt};
use parking_lot::RwLock;
use std::sync::Arc;

/// Reads cached resources of one kind.
pub trait Lister<K>: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>>;

    /// Lists the resources whose labels match `selector`, in all namespaces
    /// when `namespace` is `None`. Results are ordered by namespace and name.
    fn list(&self, namespace: Option<&str>, selector: &Selector) -> Vec<Arc<K>>;
}

/// Writes resources of one kind to the API server.
#[async_trait::async_trait]
pub trait Writer<K>: Send + Sync {
    async fn create(&self, resource: K) -> Result<K, ClientError>;

    async fn update(&self, resource: K) -> Result<K, ClientError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClientError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A namespaced index of one resource kind, fed by a watch.
#[derive(Debug)]
pub struct Store<K> {
    namespaces: HashMap<String, HashMap<String, Arc<K>>>,
}

pub type SharedStore<K> = Arc<RwLock<Store<K>>>;

// === impl Store ===

impl<K> Store<K> {
    pub fn shared() -> SharedStore<K> {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn len(&self) -> usize {
        self.namespaces.values().map(|ns| ns.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            namespaces: HashMap::default(),
        }
    }
}

impl<K: Resource> kubert::index::IndexNamespacedResource<K> for Store<K> {
    fn apply(&mut self, resource: K) {
        let Some(namespace) = resource.namespace() else {
            tracing::warn!(name = %resource.name_any(), "Ignoring resource without a namespace");
            return;
        };
        let name = resource.name_any();
        self.namespaces
            .entry(namespace)
            .or_default()
            .insert(name, Arc::new(resource));
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(resources) = self.namespaces.get_mut(&namespace) {
            resources.remove(&name);
            if resources.is_empty() {
                self.namespaces.remove(&namespace);
            }
        }
    }
}

impl<K: Resource + Send + Sync> Lister<K> for RwLock<Store<K>> {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.read()
            .namespaces
            .get(namespace)
            .and_then(|resources| resources.get(name))
            .cloned()
    }

    fn list(&self, namespace: Option<&str>, selector: &Selector) -> Vec<Arc<K>> {
        let store = self.read();
        let mut matches = store
            .namespaces
            .iter()
            .filter(|(ns, _)| namespace.map_or(true, |namespace| namespace == ns.as_str()))
            .flat_map(|(_, resources)| resources.values())
            .filter(|resource| selector.matches(&Labels::from(resource.meta().labels.as_ref())))
            .cloned()
            .collect::<Vec<_>>();
        matches.sort_by(|a, b| {
            (a.meta().namespace.as_ref(), a.meta().name.as_ref())
                .cmp(&(b.meta().namespace.as_ref(), b.meta().name.as_ref()))
        });
        matches
    }
}
