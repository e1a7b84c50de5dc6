use istio_ingress_controller_k8s_api::Visibility;
use std::collections::BTreeSet;

pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

pub const KNATIVE_INGRESS_GATEWAY: &str = "knative-ingress-gateway";
pub const KNATIVE_LOCAL_GATEWAY: &str = "knative-local-gateway";
pub const KNATIVE_SERVING_NAMESPACE: &str = "knative-serving";

/// A point-in-time view of controller configuration. Each reconcile pass
/// works against its own snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub istio: IstioConfig,
    pub network: NetworkConfig,
    pub cluster_domain: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IstioConfig {
    pub ingress_gateways: Vec<GatewayConfig>,
    pub local_gateways: Vec<GatewayConfig>,
}

/// A shared gateway and the Service that fronts its pods.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayConfig {
    pub namespace: String,
    pub name: String,
    pub service_url: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkConfig {
    pub http_protocol: HttpProtocol,
    pub auto_tls: bool,
    pub cluster_local_domain_tls: bool,
    pub system_internal_tls: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum HttpProtocol {
    #[default]
    Enabled,
    Redirected,
    Disabled,
}

/// Qualified (`namespace/name`) gateway names keyed by visibility.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GatewaysByVisibility {
    pub external: BTreeSet<String>,
    pub cluster_local: BTreeSet<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid gateway key {0:?}: expected <prefix>.<namespace>.<name>")]
    InvalidGatewayKey(String),

    #[error("invalid gateway service URL {0:?}: expected <name>.<namespace>[.svc.<domain>]")]
    InvalidServiceUrl(String),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

// === impl ConfigSnapshot ===

impl ConfigSnapshot {
    pub fn new(cluster_domain: impl Into<String>) -> Self {
        let cluster_domain = cluster_domain.into();
        Self {
            istio: IstioConfig::defaults(&cluster_domain),
            network: NetworkConfig::default(),
            cluster_domain,
        }
    }

    pub fn gateways(&self, visibility: Visibility) -> &[GatewayConfig] {
        match visibility {
            Visibility::ExternalIp => &self.istio.ingress_gateways,
            Visibility::ClusterLocal => &self.istio.local_gateways,
        }
    }

    pub fn qualified_gateway_names(&self) -> GatewaysByVisibility {
        GatewaysByVisibility {
            external: self
                .istio
                .ingress_gateways
                .iter()
                .map(GatewayConfig::qualified_name)
                .collect(),
            cluster_local: self
                .istio
                .local_gateways
                .iter()
                .map(GatewayConfig::qualified_name)
                .collect(),
        }
    }

    /// The service URL of the first gateway with the given visibility, if
    /// one is configured.
    pub fn gateway_service_url(&self, visibility: Visibility) -> &str {
        self.gateways(visibility)
            .first()
            .map(|gw| gw.service_url.as_str())
            .unwrap_or_default()
    }
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self::new(DEFAULT_CLUSTER_DOMAIN)
    }
}

// === impl IstioConfig ===

impl IstioConfig {
    pub fn defaults(cluster_domain: &str) -> Self {
        Self {
            ingress_gateways: vec![GatewayConfig {
                namespace: KNATIVE_SERVING_NAMESPACE.to_string(),
                name: KNATIVE_INGRESS_GATEWAY.to_string(),
                service_url: format!("istio-ingressgateway.istio-system.svc.{cluster_domain}"),
            }],
            local_gateways: vec![GatewayConfig {
                namespace: KNATIVE_SERVING_NAMESPACE.to_string(),
                name: KNATIVE_LOCAL_GATEWAY.to_string(),
                service_url: format!("knative-local-gateway.istio-system.svc.{cluster_domain}"),
            }],
        }
    }
}

// === impl GatewayConfig ===

impl GatewayConfig {
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Returns the `(namespace, name)` of the Service named by the service URL.
    pub fn service(&self) -> Result<(&str, &str), ConfigError> {
        let mut parts = self.service_url.split('.');
        match (parts.next(), parts.next()) {
            (Some(name), Some(namespace)) if !name.is_empty() && !namespace.is_empty() => {
                Ok((namespace, name))
            }
            _ => Err(ConfigError::InvalidServiceUrl(self.service_url.clone())),
        }
    }
}

// === impl GatewaysByVisibility ===

impl GatewaysByVisibility {
    pub fn get(&self, visibility: Visibility) -> &BTreeSet<String> {
        match visibility {
            Visibility::ExternalIp => &self.external,
            Visibility::ClusterLocal => &self.cluster_local,
        }
    }

    pub fn get_mut(&mut self, visibility: Visibility) -> &mut BTreeSet<String> {
        match visibility {
            Visibility::ExternalIp => &mut self.external,
            Visibility::ClusterLocal => &mut self.cluster_local,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Visibility, &BTreeSet<String>)> {
        [
            (Visibility::ExternalIp, &self.external),
            (Visibility::ClusterLocal, &self.cluster_local),
        ]
        .into_iter()
    }
}

// === impl HttpProtocol ===

impl std::str::FromStr for HttpProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "enabled" => Ok(Self::Enabled),
            "redirected" => Ok(Self::Redirected),
            "disabled" => Ok(Self::Disabled),
            _ => Err(ConfigError::InvalidValue {
                key: "http-protocol".to_string(),
                value: s.to_string(),
            }),
        }
    }
}
