use crate::{names, Error};
use istio_ingress_controller_core::{
    network::{self, host_prefix},
    GatewaysByVisibility, ProbeInjector,
};
use istio_ingress_controller_k8s_api::{
    ingress::HttpIngressPath,
    istio::{
        virtual_service::{
            Destination, Headers, HttpMatchRequest, HttpRetry, HttpRewrite, HttpRoute,
            HttpRouteDestination, PortSelector, StringMatch, VirtualService, VirtualServiceSpec,
        },
        MESH_GATEWAY,
    },
    labels::{INGRESS_LABEL, ROUTE_LABEL, ROUTE_NAMESPACE_LABEL},
    IntOrString, Ingress, ObjectMeta, Owned, Owner, ResourceExt, Visibility,
};
use std::collections::{BTreeMap, BTreeSet};

/// Builds the VirtualServices that route an Ingress's traffic.
///
/// Probe routes are inserted into a copy of the Ingress first. A mesh
/// VirtualService is built when the Ingress has cluster-local hosts, and an
/// ingress VirtualService when some visibility with rules has gateways.
pub fn make_virtual_services(
    ing: &Ingress,
    gateways: &GatewaysByVisibility,
    probe: &dyn ProbeInjector,
    cluster_domain: &str,
) -> Result<Vec<Owned<VirtualService>>, Error> {
    let mut ing = ing.clone();
    probe.insert_probe(&mut ing)?;

    let mut vss = Vec::with_capacity(2);
    if let Some(vs) = make_mesh_virtual_service(&ing, gateways, cluster_domain) {
        vss.push(vs);
    }

    let has_gateways = [Visibility::ExternalIp, Visibility::ClusterLocal]
        .into_iter()
        .any(|v| ing.rules_for_visibility(v).next().is_some() && !gateways.get(v).is_empty());
    if has_gateways {
        vss.push(make_ingress_virtual_service(&ing, gateways, cluster_domain));
    }

    Ok(vss)
}

/// Builds the VirtualService bound to the `mesh` gateway for cluster-local
/// hosts, if there are any.
pub fn make_mesh_virtual_service(
    ing: &Ingress,
    gateways: &GatewaysByVisibility,
    cluster_domain: &str,
) -> Option<Owned<VirtualService>> {
    let mut hosts = ingress_hosts(ing)
        .into_iter()
        .filter(|host| network::is_cluster_local_host(host, cluster_domain))
        .collect::<BTreeSet<_>>();
    if !gateways.cluster_local.is_empty() {
        hosts = network::expanded_hosts(hosts.iter(), cluster_domain);
    }
    if hosts.is_empty() {
        return None;
    }

    let mesh = GatewaysByVisibility {
        external: Some(MESH_GATEWAY.to_string()).into_iter().collect(),
        cluster_local: Some(MESH_GATEWAY.to_string()).into_iter().collect(),
    };
    let spec = make_virtual_service_spec(ing, &mesh, &hosts, cluster_domain);
    Some(make_virtual_service(ing, names::mesh_virtual_service(ing), spec))
}

/// Builds the VirtualService bound to the ingress gateways.
pub fn make_ingress_virtual_service(
    ing: &Ingress,
    gateways: &GatewaysByVisibility,
    cluster_domain: &str,
) -> Owned<VirtualService> {
    let hosts = network::expanded_hosts(ingress_hosts(ing).iter(), cluster_domain);
    let spec = make_virtual_service_spec(ing, gateways, &hosts, cluster_domain);
    make_virtual_service(ing, names::ingress_virtual_service(ing), spec)
}

fn make_virtual_service(ing: &Ingress, name: String, spec: VirtualServiceSpec) -> Owned<VirtualService> {
    let mut labels = ing
        .labels()
        .iter()
        .filter(|(k, _)| *k != ROUTE_LABEL && *k != ROUTE_NAMESPACE_LABEL)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<BTreeMap<_, _>>();
    labels.insert(INGRESS_LABEL.to_string(), ing.name_any());

    let annotations = ing.annotations().clone();
    let vs = VirtualService {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: ing.namespace(),
            labels: Some(labels),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..Default::default()
        },
        spec,
    };
    Owned::new(Owner::ingress(ing), vs)
}

/// Builds one route per rule path whose hosts overlap `hosts`. The spec's
/// gateways are exactly those referenced by some route match.
pub fn make_virtual_service_spec(
    ing: &Ingress,
    gateways: &GatewaysByVisibility,
    hosts: &BTreeSet<String>,
    cluster_domain: &str,
) -> VirtualServiceSpec {
    let mut http = Vec::new();
    let mut used_gateways = BTreeSet::new();
    for rule in ing.spec.rules.iter() {
        let rule_hosts = hosts
            .iter()
            .filter(|host| rule.hosts.contains(host))
            .cloned()
            .collect::<BTreeSet<_>>();
        if rule_hosts.is_empty() {
            continue;
        }
        for path in rule.http.iter().flat_map(|http| http.paths.iter()) {
            let route = make_virtual_service_route(
                &rule_hosts,
                path,
                gateways.get(rule.visibility),
                cluster_domain,
            );
            for m in route.matches.iter() {
                used_gateways.extend(m.gateways.iter().cloned());
            }
            http.push(route);
        }
    }

    VirtualServiceSpec {
        hosts: hosts.iter().cloned().collect(),
        gateways: used_gateways.into_iter().collect(),
        http,
    }
}

fn make_virtual_service_route(
    hosts: &BTreeSet<String>,
    path: &HttpIngressPath,
    gateways: &BTreeSet<String>,
    cluster_domain: &str,
) -> HttpRoute {
    let matches = distinct_host_prefixes(hosts, cluster_domain)
        .into_iter()
        .map(|host| make_match(host, path, gateways))
        .collect();

    let route = path
        .splits
        .iter()
        .map(|split| HttpRouteDestination {
            destination: Destination {
                host: network::service_hostname(
                    &split.backend.service_name,
                    &split.backend.service_namespace,
                    cluster_domain,
                ),
                port: match split.backend.service_port {
                    IntOrString::Int(number) => {
                        u32::try_from(number).ok().map(|number| PortSelector { number })
                    }
                    IntOrString::String(_) => None,
                },
            },
            weight: split.percent,
            headers: Headers::set_request(split.append_headers.clone()),
        })
        .collect();

    HttpRoute {
        matches,
        route,
        rewrite: (!path.rewrite_host.is_empty()).then(|| HttpRewrite {
            authority: Some(path.rewrite_host.clone()),
            uri: None,
        }),
        // Istio retries twice by default; requests may not be idempotent.
        retries: Some(HttpRetry::default()),
        headers: Headers::set_request(path.append_headers.clone()),
    }
}

fn make_match(host: String, path: &HttpIngressPath, gateways: &BTreeSet<String>) -> HttpMatchRequest {
    HttpMatchRequest {
        authority: Some(StringMatch::Prefix(host)),
        uri: (!path.path.is_empty()).then(|| StringMatch::Prefix(path.path.clone())),
        headers: path
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), StringMatch::Exact(v.exact.clone())))
            .collect(),
        gateways: gateways.iter().cloned().collect(),
    }
}

/// Reduces hosts to a minimal set of authority prefixes: a host is dropped
/// when an already retained prefix is a prefix of it.
pub fn distinct_host_prefixes(hosts: &BTreeSet<String>, cluster_domain: &str) -> BTreeSet<String> {
    // Sorted after stripping so that a prefix is always seen before the
    // hosts it covers.
    let stripped = hosts
        .iter()
        .map(|host| host_prefix(host, cluster_domain))
        .collect::<BTreeSet<_>>();
    let mut prefixes = BTreeSet::<String>::new();
    for prefix in stripped {
        if !prefixes.iter().any(|p| prefix.starts_with(p.as_str())) {
            prefixes.insert(prefix.to_string());
        }
    }
    prefixes
}

fn ingress_hosts(ing: &Ingress) -> BTreeSet<String> {
    ing.spec
        .rules
        .iter()
        .flat_map(|rule| rule.hosts.iter().cloned())
        .collect()
}
