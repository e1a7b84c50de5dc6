use crate::store::ClientError;
use istio_ingress_controller_k8s_resources::{self as resources, CertificateError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{kind} {namespace}/{name} exists but is not controlled by this controller")]
    NotOwned {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("secret {namespace}/{name} is referenced by the Ingress but does not exist")]
    MissingSecret { namespace: String, name: String },

    #[error("invalid certificate in Secret {namespace}/{name}: {source}")]
    Certificate {
        namespace: String,
        name: String,
        #[source]
        source: CertificateError,
    },

    #[error("gateway {gateway} refers to Service {service:?}, which cannot be resolved")]
    GatewayService { gateway: String, service: String },

    #[error("gateway name {0:?} is not of the form <namespace>/<name>")]
    UnqualifiedGateway(String),

    #[error("gateway {namespace}/{name} does not exist")]
    GatewayNotFound { namespace: String, name: String },

    #[error("endpoints {namespace}/{name} do not exist")]
    EndpointsNotFound { namespace: String, name: String },

    #[error("cannot list Services for gateway {gateway}: {reason}")]
    ServiceList { gateway: String, reason: String },

    #[error("failed to {op} {kind} {namespace}/{name}: {source}")]
    Client {
        op: &'static str,
        kind: String,
        namespace: String,
        name: String,
        #[source]
        source: ClientError,
    },

    #[error("failed to probe Ingress: {0}")]
    Probe(#[source] anyhow::Error),

    #[error(transparent)]
    Resources(resources::Error),
}

// === impl Error ===

impl Error {
    pub fn is_not_owned(&self) -> bool {
        matches!(self, Self::NotOwned { .. })
    }

    pub(crate) fn client(
        op: &'static str,
        kind: impl ToString,
        namespace: &str,
        name: &str,
        source: ClientError,
    ) -> Self {
        Self::Client {
            op,
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            source,
        }
    }
}

impl From<resources::Error> for Error {
    fn from(error: resources::Error) -> Self {
        match error {
            resources::Error::MissingSecret { namespace, name } => {
                Self::MissingSecret { namespace, name }
            }
            resources::Error::Certificate {
                namespace,
                name,
                source,
            } => Self::Certificate {
                namespace,
                name,
                source,
            },
            error => Self::Resources(error),
        }
    }
}
