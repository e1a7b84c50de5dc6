use crate::{store::Lister, Error, Stores};
use istio_ingress_controller_core::{
    network, probe::PROBE_PATH, GatewaysByVisibility, ProbeTarget,
};
use istio_ingress_controller_k8s_api::{
    istio::{
        gateway::{Server, TlsMode},
        Gateway,
    },
    Endpoints, Ingress, ResourceExt, Selector, Service,
};
use std::{collections::BTreeSet, sync::Arc};

/// Finds the gateway pods that must serve an Ingress before it is ready.
#[derive(Clone)]
pub struct ProbeTargetLister {
    gateways: Arc<dyn Lister<Gateway>>,
    services: Arc<dyn Lister<Service>>,
    endpoints: Arc<dyn Lister<Endpoints>>,
    cluster_domain: String,
}

/// A gateway port resolved to the pods behind it, before a host is chosen.
struct GatewayTarget {
    scheme: &'static str,
    target: ProbeTarget,
}

// === impl ProbeTargetLister ===

impl ProbeTargetLister {
    pub fn new(stores: &Stores, cluster_domain: impl Into<String>) -> Self {
        Self {
            gateways: stores.gateways.clone(),
            services: stores.services.clone(),
            endpoints: stores.endpoints.clone(),
            cluster_domain: cluster_domain.into(),
        }
    }

    /// Lists one target per probeable gateway port and endpoint subset.
    ///
    /// Each target carries a single URL: a gateway applies all of an
    /// Ingress's hosts at once, so the first host stands in for the rest.
    pub fn list_probe_targets(
        &self,
        ing: &Ingress,
        gateways: &GatewaysByVisibility,
    ) -> Result<Vec<ProbeTarget>, Error> {
        let hosts_by_gateway = network::hosts_per_visibility(ing, gateways, &self.cluster_domain);

        let mut targets = Vec::new();
        for (gateway_name, hosts) in hosts_by_gateway.iter() {
            let Some(host) = hosts.iter().next() else {
                continue;
            };
            let gateway = self.get_gateway(gateway_name)?;
            for GatewayTarget { scheme, mut target } in self.list_gateway_targets(gateway_name, &gateway)? {
                let url = format!("{scheme}://{host}:{}{PROBE_PATH}", target.port);
                match url.parse::<http::Uri>() {
                    Ok(url) => {
                        target.urls = vec![url];
                        targets.push(target);
                    }
                    Err(error) => {
                        tracing::info!(gateway = %gateway_name, %host, %error, "Skipping host that is not a valid URL authority");
                    }
                }
            }
        }
        Ok(targets)
    }

    fn get_gateway(&self, qualified_name: &str) -> Result<Arc<Gateway>, Error> {
        let (namespace, name) = qualified_name
            .split_once('/')
            .filter(|(ns, name)| !ns.is_empty() && !name.is_empty() && !name.contains('/'))
            .ok_or_else(|| Error::UnqualifiedGateway(qualified_name.to_string()))?;
        self.gateways
            .get(namespace, name)
            .ok_or_else(|| Error::GatewayNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    fn list_gateway_targets(
        &self,
        gateway_name: &str,
        gateway: &Gateway,
    ) -> Result<Vec<GatewayTarget>, Error> {
        if gateway.spec.selector.is_empty() {
            return Err(Error::ServiceList {
                gateway: gateway_name.to_string(),
                reason: "the gateway has no pod selector".to_string(),
            });
        }
        let selector = Selector::from_map(gateway.spec.selector.clone());
        let Some(service) = self.services.list(None, &selector).into_iter().next() else {
            tracing::info!(gateway = %gateway_name, "Skipping gateway without a corresponding Service");
            return Ok(Vec::new());
        };
        let svc_namespace = service.namespace().unwrap_or_default();
        let svc_name = service.name_any();
        let endpoints = self
            .endpoints
            .get(&svc_namespace, &svc_name)
            .ok_or_else(|| Error::EndpointsNotFound {
                namespace: svc_namespace.clone(),
                name: svc_name.clone(),
            })?;

        let mut seen = BTreeSet::new();
        let mut targets = Vec::new();
        for server in gateway.spec.servers.iter() {
            let Some(scheme) = probe_scheme(server) else {
                continue;
            };
            if !seen.insert((scheme, server.port.number)) {
                continue;
            }
            let port_name = match network::name_for_port_number(&service, server.port.number as i32) {
                Ok(name) => name,
                Err(error) => {
                    tracing::info!(server = %server.port.name, %error, "Skipping server");
                    continue;
                }
            };
            for subset in endpoints.subsets.iter().flatten() {
                let pod_port = match network::port_number_for_name(subset, &port_name) {
                    Ok(port) => port,
                    Err(error) => {
                        tracing::info!(server = %server.port.name, %error, "Skipping endpoint subset");
                        continue;
                    }
                };
                let pod_ips = subset
                    .addresses
                    .iter()
                    .flatten()
                    .map(|addr| addr.ip.clone())
                    .collect();
                targets.push(GatewayTarget {
                    scheme,
                    target: ProbeTarget {
                        pod_ips,
                        pod_port: pod_port.to_string(),
                        port: server.port.number.to_string(),
                        urls: Vec::new(),
                    },
                });
            }
        }
        Ok(targets)
    }
}

/// Returns the scheme to probe a server with, if it can be probed at all.
fn probe_scheme(server: &Server) -> Option<&'static str> {
    match server.port.protocol.to_ascii_lowercase().as_str() {
        "http" | "http2" => {
            if server.tls.as_ref().map_or(false, |tls| tls.https_redirect) {
                return None;
            }
            Some("http")
        }
        "https" => {
            if server
                .tls
                .as_ref()
                .map_or(false, |tls| tls.mode == TlsMode::Mutual)
            {
                tracing::info!(server = %server.port.name, "Skipping HTTPS server with mutual TLS");
                return None;
            }
            Some("https")
        }
        protocol => {
            tracing::info!(server = %server.port.name, %protocol, "Skipping server with unsupported protocol");
            None
        }
    }
}
