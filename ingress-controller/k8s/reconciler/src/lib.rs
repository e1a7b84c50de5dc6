#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Converges the cluster toward the Istio resources an Ingress calls for.
//!
//! The engine only talks to the cluster through the narrow [`Lister`] and
//! [`Writer`] capabilities, so it can be driven by kube-backed stores at
//! runtime and by in-memory fakes in tests.

mod accessor;
mod error;
mod ingress;
mod lister;
pub mod metrics;
mod store;
mod tracker;

#[cfg(test)]
mod tests;

pub use self::{
    accessor::Converge,
    error::Error,
    ingress::{Clients, Reconciler, StatusManager, Stores},
    lister::ProbeTargetLister,
    metrics::ReconcileMetrics,
    store::{ClientError, Lister, SharedStore, Store, Writer},
    tracker::{ResourceId, SecretTracker},
};

/// The finalizer placed on every Ingress this controller reconciles.
pub const FINALIZER: &str = "ingresses.networking.internal.knative.dev";
