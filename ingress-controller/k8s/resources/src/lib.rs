#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Computes the Istio resources and Secret copies that realize an Ingress.
//!
//! Everything here is a pure function of its inputs: callers resolve the
//! gateway Services and origin Secrets and pass them in.

pub mod destination_rule;
pub mod gateway;
pub mod names;
pub mod secret;
pub mod virtual_service;


pub use self::secret::{CertificateError, SecretMap};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("secret {namespace}/{name} is referenced by the Ingress but does not exist")]
    MissingSecret { namespace: String, name: String },

    #[error("service {namespace}/{name} is referenced by the Ingress but does not exist")]
    MissingService { namespace: String, name: String },

    #[error("invalid certificate in Secret {namespace}/{name}: {source}")]
    Certificate {
        namespace: String,
        name: String,
        #[source]
        source: CertificateError,
    },

    #[error("failed to insert probe routes: {0}")]
    Probe(#[from] istio_ingress_controller_core::probe::ProbeError),
}
