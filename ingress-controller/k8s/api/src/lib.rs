#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ingress;
pub mod istio;
pub mod labels;
pub mod owner;

pub use self::{
    ingress::{Ingress, IngressSpec, IngressStatus, Visibility},
    labels::{Labels, Selector},
    owner::{Owned, Owner},
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            ConfigMap, EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Secret, Service,
            ServicePort, ServiceSpec,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::OwnerReference, util::intstr::IntOrString,
    },
    ByteString,
};
pub use kube::{
    api::{ObjectMeta, Resource, ResourceExt},
    CustomResourceExt,
};
