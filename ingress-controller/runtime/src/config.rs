use ahash::AHashSet;
use futures::prelude::*;
use istio_ingress_controller_core::{
    config::ConfigError, ConfigSnapshot, GatewayConfig, IstioConfig, NetworkConfig,
};
use istio_ingress_controller_k8s_api::{ConfigMap, ResourceExt};
use kube::runtime::watcher;
use std::collections::BTreeMap;
use tokio::sync::watch;

const GATEWAY_PREFIX: &str = "gateway.";
const LOCAL_GATEWAY_PREFIX: &str = "local-gateway.";

const HTTP_PROTOCOL_KEY: &str = "http-protocol";
const EXTERNAL_DOMAIN_TLS_KEY: &str = "external-domain-tls";
const AUTO_TLS_KEY: &str = "auto-tls";
const CLUSTER_LOCAL_DOMAIN_TLS_KEY: &str = "cluster-local-domain-tls";
const SYSTEM_INTERNAL_TLS_KEY: &str = "system-internal-tls";

/// Holds the parsed contents of the controller's ConfigMaps and publishes a
/// new [`ConfigSnapshot`] whenever they change.
///
/// A ConfigMap that fails to parse is logged and ignored, so the last good
/// configuration stays in effect. A deleted ConfigMap reverts to defaults.
#[derive(Debug)]
pub struct ConfigIndex {
    istio_name: String,
    network_name: String,
    current: ConfigSnapshot,
    tx: watch::Sender<ConfigSnapshot>,

    /// Names seen since the watch last restarted.
    resync: Option<AHashSet<String>>,
}

/// Drives a [`ConfigIndex`] from a ConfigMap watch.
pub async fn run(mut index: ConfigIndex, events: impl Stream<Item = watcher::Event<ConfigMap>>) {
    tokio::pin!(events);
    while let Some(event) = events.next().await {
        match event {
            watcher::Event::Init => index.begin_resync(),
            watcher::Event::InitApply(cm) | watcher::Event::Apply(cm) => index.apply(&cm),
            watcher::Event::InitDone => index.end_resync(),
            watcher::Event::Delete(cm) => index.delete(&cm.name_any()),
        }
    }
    tracing::debug!("ConfigMap watch ended");
}

// === impl ConfigIndex ===

impl ConfigIndex {
    pub fn new(
        cluster_domain: String,
        istio_name: String,
        network_name: String,
    ) -> (Self, watch::Receiver<ConfigSnapshot>) {
        let current = ConfigSnapshot::new(cluster_domain);
        let (tx, rx) = watch::channel(current.clone());
        let index = Self {
            istio_name,
            network_name,
            current,
            tx,
            resync: None,
        };
        (index, rx)
    }

    pub fn apply(&mut self, cm: &ConfigMap) {
        let name = cm.name_any();
        if let Some(seen) = self.resync.as_mut() {
            seen.insert(name.clone());
        }

        let empty = BTreeMap::new();
        let data = cm.data.as_ref().unwrap_or(&empty);
        let parsed = if name == self.istio_name {
            parse_istio(data, &self.current.cluster_domain).map(|istio| self.current.istio = istio)
        } else if name == self.network_name {
            parse_network(data).map(|network| self.current.network = network)
        } else {
            return;
        };

        if let Err(error) = parsed {
            tracing::warn!(configmap = %name, %error, "Ignoring invalid configuration");
            return;
        }
        self.publish();
    }

    pub fn delete(&mut self, name: &str) {
        if name == self.istio_name {
            self.current.istio = IstioConfig::defaults(&self.current.cluster_domain);
        } else if name == self.network_name {
            self.current.network = NetworkConfig::default();
        } else {
            return;
        }
        tracing::info!(configmap = %name, "ConfigMap deleted; using defaults");
        self.publish();
    }

    fn begin_resync(&mut self) {
        self.resync = Some(AHashSet::new());
    }

    /// Reverts any ConfigMap that disappeared while the watch was down.
    fn end_resync(&mut self) {
        let Some(seen) = self.resync.take() else {
            return;
        };
        for name in [self.istio_name.clone(), self.network_name.clone()] {
            if !seen.contains(&name) {
                self.delete(&name);
            }
        }
    }

    fn publish(&self) {
        let snapshot = self.current.clone();
        self.tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            tracing::info!(?snapshot, "Configuration updated");
            *current = snapshot;
            true
        });
    }
}

/// Parses `gateway.<namespace>.<name>` and `local-gateway.<namespace>.<name>`
/// keys, each mapped to the URL of the Service fronting the gateway. Other
/// keys are ignored. A visibility without gateways falls back to the default.
pub fn parse_istio(
    data: &BTreeMap<String, String>,
    cluster_domain: &str,
) -> Result<IstioConfig, ConfigError> {
    let mut ingress_gateways = Vec::new();
    let mut local_gateways = Vec::new();
    for (key, value) in data {
        let (gateways, qualified) = if let Some(rest) = key.strip_prefix(GATEWAY_PREFIX) {
            (&mut ingress_gateways, rest)
        } else if let Some(rest) = key.strip_prefix(LOCAL_GATEWAY_PREFIX) {
            (&mut local_gateways, rest)
        } else {
            continue;
        };

        let (namespace, name) = qualified
            .split_once('.')
            .filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
            .ok_or_else(|| ConfigError::InvalidGatewayKey(key.clone()))?;
        let gateway = GatewayConfig {
            namespace: namespace.to_string(),
            name: name.to_string(),
            service_url: value.trim().to_string(),
        };
        gateway.service()?;
        gateways.push(gateway);
    }

    let defaults = IstioConfig::defaults(cluster_domain);
    if ingress_gateways.is_empty() {
        ingress_gateways = defaults.ingress_gateways;
    }
    if local_gateways.is_empty() {
        local_gateways = defaults.local_gateways;
    }
    Ok(IstioConfig {
        ingress_gateways,
        local_gateways,
    })
}

pub fn parse_network(data: &BTreeMap<String, String>) -> Result<NetworkConfig, ConfigError> {
    let http_protocol = match data.get(HTTP_PROTOCOL_KEY) {
        Some(value) => value.trim().parse()?,
        None => Default::default(),
    };

    // The external-domain key supersedes the older auto-tls key.
    let auto_tls = match is_enabled(data, EXTERNAL_DOMAIN_TLS_KEY)? {
        Some(enabled) => enabled,
        None => is_enabled(data, AUTO_TLS_KEY)?.unwrap_or(false),
    };

    Ok(NetworkConfig {
        http_protocol,
        auto_tls,
        cluster_local_domain_tls: is_enabled(data, CLUSTER_LOCAL_DOMAIN_TLS_KEY)?
            .unwrap_or(false),
        system_internal_tls: is_enabled(data, SYSTEM_INTERNAL_TLS_KEY)?.unwrap_or(false),
    })
}

fn is_enabled(data: &BTreeMap<String, String>, key: &str) -> Result<Option<bool>, ConfigError> {
    let Some(value) = data.get(key) else {
        return Ok(None);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "enabled" => Ok(Some(true)),
        "disabled" | "" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use istio_ingress_controller_core::HttpProtocol;
    use istio_ingress_controller_k8s_api::ObjectMeta;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const DOMAIN: &str = "cluster.local";

    fn config_map(name: &str, data: BTreeMap<String, String>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                namespace: Some("knative-serving".to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    fn index() -> (ConfigIndex, watch::Receiver<ConfigSnapshot>) {
        ConfigIndex::new(
            DOMAIN.to_string(),
            "config-istio".to_string(),
            "config-network".to_string(),
        )
    }

    #[test]
    fn parses_gateways() {
        let istio = parse_istio(
            &btreemap! {
                "gateway.knative-serving.knative-ingress-gateway".to_string() =>
                    "istio-ingressgateway.istio-system.svc.cluster.local".to_string(),
                "gateway.other-ns.public.gw".to_string() => " public.istio-system ".to_string(),
                "_example".to_string() => "ignored".to_string(),
            },
            DOMAIN,
        )
        .expect("config must parse");

        assert_eq!(
            istio.ingress_gateways,
            vec![
                GatewayConfig {
                    namespace: "knative-serving".to_string(),
                    name: "knative-ingress-gateway".to_string(),
                    service_url: "istio-ingressgateway.istio-system.svc.cluster.local"
                        .to_string(),
                },
                GatewayConfig {
                    namespace: "other-ns".to_string(),
                    name: "public.gw".to_string(),
                    service_url: "public.istio-system".to_string(),
                },
            ]
        );
        assert_eq!(
            istio.local_gateways,
            IstioConfig::defaults(DOMAIN).local_gateways
        );
    }

    #[rstest]
    #[case("gateway.knative-serving", "svc.ns")]
    #[case("local-gateway..name", "svc.ns")]
    #[case("gateway.knative-serving.gw", "svc")]
    fn rejects_invalid_gateways(#[case] key: &str, #[case] value: &str) {
        let data = btreemap! {key.to_string() => value.to_string()};
        assert!(parse_istio(&data, DOMAIN).is_err());
    }

    #[rstest]
    #[case(btreemap! {}, NetworkConfig::default())]
    #[case(
        btreemap! {
            "http-protocol" => "Redirected",
            "auto-tls" => "Enabled",
            "cluster-local-domain-tls" => "enabled",
            "system-internal-tls" => "Disabled",
        },
        NetworkConfig {
            http_protocol: HttpProtocol::Redirected,
            auto_tls: true,
            cluster_local_domain_tls: true,
            system_internal_tls: false,
        }
    )]
    #[case(
        btreemap! {
            "external-domain-tls" => "Disabled",
            "auto-tls" => "Enabled",
            "system-internal-tls" => "Enabled",
        },
        NetworkConfig {
            system_internal_tls: true,
            ..Default::default()
        }
    )]
    fn parses_network(#[case] data: BTreeMap<&str, &str>, #[case] expected: NetworkConfig) {
        let data = data
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(parse_network(&data).expect("config must parse"), expected);
    }

    #[rstest]
    #[case("http-protocol", "sometimes")]
    #[case("auto-tls", "yes")]
    #[case("system-internal-tls", "true")]
    fn rejects_invalid_network(#[case] key: &str, #[case] value: &str) {
        let data = btreemap! {key.to_string() => value.to_string()};
        assert!(parse_network(&data).is_err());
    }

    #[test]
    fn keeps_last_good_config() {
        let (mut index, rx) = index();
        index.apply(&config_map(
            "config-network",
            btreemap! {"http-protocol".to_string() => "Redirected".to_string()},
        ));
        assert_eq!(rx.borrow().network.http_protocol, HttpProtocol::Redirected);

        index.apply(&config_map(
            "config-network",
            btreemap! {"http-protocol".to_string() => "bogus".to_string()},
        ));
        assert_eq!(rx.borrow().network.http_protocol, HttpProtocol::Redirected);

        index.delete("config-network");
        assert_eq!(rx.borrow().network, NetworkConfig::default());
    }

    #[test]
    fn ignores_unrelated_config_maps() {
        let (mut index, rx) = index();
        index.apply(&config_map(
            "config-logging",
            btreemap! {"http-protocol".to_string() => "Disabled".to_string()},
        ));
        assert!(!rx.has_changed().expect("sender must be alive"));
        assert_eq!(*rx.borrow(), ConfigSnapshot::new(DOMAIN));
    }

    #[test]
    fn resync_reverts_missing_config_maps() {
        let (mut index, rx) = index();
        index.apply(&config_map(
            "config-network",
            btreemap! {"auto-tls".to_string() => "Enabled".to_string()},
        ));
        index.apply(&config_map(
            "config-istio",
            btreemap! {
                "gateway.custom.gw".to_string() => "gw.istio-system".to_string(),
            },
        ));
        assert!(rx.borrow().network.auto_tls);

        index.begin_resync();
        index.apply(&config_map(
            "config-istio",
            btreemap! {
                "gateway.custom.gw".to_string() => "gw.istio-system".to_string(),
            },
        ));
        index.end_resync();

        let snapshot = rx.borrow().clone();
        assert!(!snapshot.network.auto_tls);
        assert_eq!(
            snapshot.qualified_gateway_names().external.into_iter().collect::<Vec<_>>(),
            vec!["custom/gw".to_string()]
        );
    }
}
