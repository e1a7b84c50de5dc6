use crate::Ingress;
use k8s_openapi::{
    api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{Resource, ResourceExt};

/// The object that controls a generated resource.
///
/// Per-Ingress resources are controlled by their Ingress. Copies of wildcard
/// certificates, and the Gateways that serve them, are shared across Ingresses
/// and are controlled by the origin Secret instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Owner {
    Ingress(OwnerRef),
    Secret(OwnerRef),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// A desired resource along with the object that should control it. The
/// owner reference is only written onto the resource when it is created.
#[derive(Clone, Debug, PartialEq)]
pub struct Owned<K> {
    pub owner: Owner,
    pub resource: K,
}

// === impl Owner ===

impl Owner {
    pub fn ingress(ing: &Ingress) -> Self {
        Self::Ingress(OwnerRef::of(ing))
    }

    pub fn secret(secret: &Secret) -> Self {
        Self::Secret(OwnerRef::of(secret))
    }

    fn owner_ref(&self) -> &OwnerRef {
        match self {
            Self::Ingress(r) | Self::Secret(r) => r,
        }
    }

    pub fn name(&self) -> &str {
        &self.owner_ref().name
    }

    /// Builds the controller reference stamped onto owned resources.
    pub fn controller_reference(&self) -> OwnerReference {
        let (api_version, kind) = match self {
            Self::Ingress(_) => (Ingress::api_version(&()), Ingress::kind(&())),
            Self::Secret(_) => (Secret::api_version(&()), Secret::kind(&())),
        };
        let OwnerRef { name, uid, .. } = self.owner_ref().clone();
        OwnerReference {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name,
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Returns true when `resource` names this owner as its controller.
    pub fn controls<K: Resource>(&self, resource: &K) -> bool {
        let uid = &self.owner_ref().uid;
        resource
            .meta()
            .owner_references
            .iter()
            .flatten()
            .any(|r| r.controller == Some(true) && &r.uid == uid)
    }
}

// === impl OwnerRef ===

impl OwnerRef {
    fn of<K: Resource>(resource: &K) -> Self {
        Self {
            namespace: resource.namespace().unwrap_or_default(),
            name: resource.name_any(),
            uid: resource.uid().unwrap_or_default(),
        }
    }
}

// === impl Owned ===

impl<K: Resource> Owned<K> {
    pub fn new(owner: Owner, resource: K) -> Self {
        Self { owner, resource }
    }

    /// Returns the resource with its controller reference set.
    pub fn into_resource(self) -> K {
        let Self {
            owner,
            mut resource,
        } = self;
        resource
            .meta_mut()
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(owner.controller_reference());
        resource
    }
}
