use std::{collections::BTreeMap, sync::Arc};

/// Names the Ingress that a generated resource belongs to.
pub const INGRESS_LABEL: &str = "networking.internal.knative.dev/ingress";

/// Older VirtualServices were labeled with the owning route instead.
pub const ROUTE_LABEL: &str = "serving.knative.dev/route";
pub const ROUTE_NAMESPACE_LABEL: &str = "serving.knative.dev/routeNamespace";

pub const ORIGIN_SECRET_NAME_LABEL: &str = "networking.internal.knative.dev/originSecretName";
pub const ORIGIN_SECRET_NAMESPACE_LABEL: &str =
    "networking.internal.knative.dev/originSecretNamespace";

/// Kubernetes caps label values at this length.
pub const MAX_LABEL_VALUE_LEN: usize = 63;

#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

/// An equality-based label selector: every pair must be present.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector {
    match_labels: Map,
}

// === Selector ===

impl Selector {
    pub fn from_map(match_labels: Map) -> Self {
        Self { match_labels }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.0.get(k) == Some(v))
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

// === Labels ===

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<&Map>> for Labels {
    #[inline]
    fn from(labels: Option<&Map>) -> Self {
        labels.cloned().unwrap_or_default().into()
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<Map>()
            .into()
    }
}
