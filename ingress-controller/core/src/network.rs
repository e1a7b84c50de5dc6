//! Host and port naming rules shared by the synthesizers and the probe lister.

use crate::GatewaysByVisibility;
use istio_ingress_controller_k8s_api::{EndpointSubset, Ingress, Service};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("no port {port} in Service {namespace}/{name}")]
    NoServicePort {
        namespace: String,
        name: String,
        port: i32,
    },

    #[error("no port named {0:?} in endpoint subset")]
    NoEndpointPort(String),
}

/// The fully qualified in-cluster hostname of a Service.
pub fn service_hostname(name: &str, namespace: &str, cluster_domain: &str) -> String {
    format!("{name}.{namespace}.svc.{cluster_domain}")
}

/// The suffix shared by all in-cluster Service hostnames.
pub fn local_host_suffix(cluster_domain: &str) -> String {
    format!(".svc.{cluster_domain}")
}

pub fn is_cluster_local_host(host: &str, cluster_domain: &str) -> bool {
    host.ends_with(&local_host_suffix(cluster_domain))
}

/// Strips the in-cluster Service suffix, if any, so that a single prefix
/// matches every short form of the host.
pub fn host_prefix<'h>(host: &'h str, cluster_domain: &str) -> &'h str {
    host.strip_suffix(local_host_suffix(cluster_domain).as_str())
        .unwrap_or(host)
}

/// Expands each host into the short forms clients may use to reach it.
///
/// `a.ns.svc.cluster.local` also yields `a.ns.svc` and `a.ns`. Forms without
/// a dot are dropped.
pub fn expanded_hosts<'h>(
    hosts: impl IntoIterator<Item = &'h String>,
    cluster_domain: &str,
) -> BTreeSet<String> {
    let suffixes = [
        String::new(),
        format!(".{cluster_domain}"),
        local_host_suffix(cluster_domain),
    ];
    let mut expanded = BTreeSet::new();
    for host in hosts {
        for suffix in suffixes.iter() {
            let Some(short) = host.strip_suffix(suffix.as_str()) else {
                continue;
            };
            if short.contains('.') {
                expanded.insert(short.to_string());
            }
        }
    }
    expanded
}

/// Maps each gateway to the expanded hosts of the rules it serves.
pub fn hosts_per_visibility(
    ing: &Ingress,
    gateways: &GatewaysByVisibility,
    cluster_domain: &str,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut by_gateway = BTreeMap::<String, BTreeSet<String>>::new();
    for rule in ing.spec.rules.iter() {
        for host in expanded_hosts(rule.hosts.iter(), cluster_domain) {
            for gateway in gateways.get(rule.visibility) {
                by_gateway
                    .entry(gateway.clone())
                    .or_default()
                    .insert(host.clone());
            }
        }
    }
    by_gateway
}

/// Returns the name of the Service port with the given number. Unnamed
/// ports yield an empty name.
pub fn name_for_port_number(svc: &Service, port: i32) -> Result<String, PortError> {
    svc.spec
        .iter()
        .flat_map(|spec| spec.ports.iter().flatten())
        .find(|p| p.port == port)
        .map(|p| p.name.clone().unwrap_or_default())
        .ok_or_else(|| PortError::NoServicePort {
            namespace: svc.metadata.namespace.clone().unwrap_or_default(),
            name: svc.metadata.name.clone().unwrap_or_default(),
            port,
        })
}

/// Returns the number of the endpoint port with the given name.
pub fn port_number_for_name(subset: &EndpointSubset, name: &str) -> Result<i32, PortError> {
    subset
        .ports
        .iter()
        .flatten()
        .find(|p| p.name.as_deref().unwrap_or_default() == name)
        .map(|p| p.port)
        .ok_or_else(|| PortError::NoEndpointPort(name.to_string()))
}
