use crate::{
    names,
    secret::{self, SecretMap, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY},
    Error,
};
use istio_ingress_controller_core::HttpProtocol;
use istio_ingress_controller_k8s_api::{
    ingress::IngressTls,
    istio::gateway::{Gateway, GatewaySpec, Port, Server, ServerTlsSettings, TlsMode, TlsProtocol},
    labels::INGRESS_LABEL,
    Ingress, ObjectMeta, Owned, Owner, ResourceExt, Service,
};
use std::collections::{BTreeMap, BTreeSet};

pub const HTTP_PORT: u32 = 80;
pub const HTTPS_PORT: u32 = 443;

pub const HTTP_SERVER_PORT_NAME: &str = "http-server";
pub const WILDCARD_SERVER_PORT_NAME: &str = "https";

const PLACEHOLDER_HOST: &str = "place-holder.place-holder";
const PLACEHOLDER_PORT_NAME: &str = "place-holder";
const PLACEHOLDER_PORT: u32 = 9999;

/// Stands in for real servers so that a Gateway is never left empty.
pub fn placeholder_server() -> Server {
    Server {
        hosts: vec![PLACEHOLDER_HOST.to_string()],
        port: Port {
            number: PLACEHOLDER_PORT,
            protocol: "HTTP".to_string(),
            name: PLACEHOLDER_PORT_NAME.to_string(),
        },
        tls: None,
    }
}

/// Builds one HTTPS server per TLS entry, named `<namespace>/<name>:<index>`.
///
/// Servers refer to the origin Secret when it already lives alongside the
/// gateway Service, and to the Ingress's copy of it otherwise.
pub fn make_tls_servers(
    ing: &Ingress,
    tls: &[IngressTls],
    gateway_service_namespace: &str,
    origin_secrets: &SecretMap,
) -> Result<Vec<Server>, Error> {
    let prefix = server_port_name_prefix(ing);
    let mut servers = Vec::with_capacity(tls.len());
    for (i, entry) in tls.iter().enumerate() {
        let credential_name = if entry.secret_namespace == gateway_service_namespace {
            entry.secret_name.clone()
        } else {
            let origin = origin_secrets
                .get(&secret::secret_key(&entry.secret_namespace, &entry.secret_name))
                .ok_or_else(|| Error::MissingSecret {
                    namespace: entry.secret_namespace.clone(),
                    name: entry.secret_name.clone(),
                })?;
            names::target_secret(ing, origin)
        };
        servers.push(Server {
            hosts: entry.hosts.clone(),
            port: Port {
                number: HTTPS_PORT,
                protocol: "HTTPS".to_string(),
                name: format!("{prefix}:{i}"),
            },
            tls: Some(ServerTlsSettings {
                mode: TlsMode::Simple,
                server_certificate: TLS_CERT_KEY.to_string(),
                private_key: TLS_PRIVATE_KEY_KEY.to_string(),
                credential_name,
                min_protocol_version: TlsProtocol::V1_2,
                ..Default::default()
            }),
        });
    }
    sort_servers(&mut servers);
    Ok(servers)
}

/// Builds the plain-text server, if HTTP is served at all.
pub fn make_http_server(protocol: HttpProtocol, hosts: Vec<String>) -> Option<Server> {
    let tls = match protocol {
        HttpProtocol::Disabled => return None,
        HttpProtocol::Enabled => None,
        HttpProtocol::Redirected => Some(ServerTlsSettings {
            https_redirect: true,
            ..Default::default()
        }),
    };
    Some(Server {
        hosts,
        port: Port {
            number: HTTP_PORT,
            protocol: "HTTP".to_string(),
            name: HTTP_SERVER_PORT_NAME.to_string(),
        },
        tls,
    })
}

/// Builds one Ingress-owned Gateway per gateway Service, each carrying
/// `servers`.
pub fn make_ingress_gateways(
    ing: &Ingress,
    servers: &[Server],
    gateway_services: &[Service],
) -> Vec<Owned<Gateway>> {
    gateway_services
        .iter()
        .map(|svc| make_ingress_gateway(ing, svc, servers.to_vec()))
        .collect()
}

/// Builds one Ingress-owned Gateway per gateway Service with an HTTPS server
/// for each TLS entry.
pub fn make_ingress_tls_gateways(
    ing: &Ingress,
    tls: &[IngressTls],
    origin_secrets: &SecretMap,
    gateway_services: &[Service],
) -> Result<Vec<Owned<Gateway>>, Error> {
    if tls.is_empty() {
        return Ok(Vec::new());
    }
    gateway_services
        .iter()
        .map(|svc| {
            let ns = svc.namespace().unwrap_or_default();
            let servers = make_tls_servers(ing, tls, &ns, origin_secrets)?;
            Ok(make_ingress_gateway(ing, svc, servers))
        })
        .collect()
}

fn make_ingress_gateway(ing: &Ingress, svc: &Service, servers: Vec<Server>) -> Owned<Gateway> {
    let gateway = Gateway {
        metadata: ObjectMeta {
            name: Some(names::gateway_name(&ing.name_any(), svc)),
            namespace: ing.namespace(),
            labels: Some(
                Some((INGRESS_LABEL.to_string(), ing.name_any()))
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        spec: GatewaySpec {
            selector: service_selector(svc),
            servers,
        },
    };
    Owned::new(Owner::ingress(ing), gateway)
}

/// Builds one Gateway per (wildcard Secret, gateway Service) pair, serving
/// every host named by the certificate. These are shared by all Ingresses and
/// controlled by the origin Secret.
pub fn make_wildcard_tls_gateways(
    wildcard_secrets: &SecretMap,
    gateway_services: &[Service],
) -> Result<Vec<Owned<Gateway>>, Error> {
    let mut gateways = Vec::new();
    for origin in wildcard_secrets.values() {
        let origin_ns = origin.namespace().unwrap_or_default();
        let origin_name = origin.name_any();
        let hosts =
            secret::hosts_from_cert_secret(origin).map_err(|source| Error::Certificate {
                namespace: origin_ns.clone(),
                name: origin_name.clone(),
                source,
            })?;
        for svc in gateway_services {
            let credential_name = if svc.namespace().as_deref() == Some(origin_ns.as_str()) {
                origin_name.clone()
            } else {
                names::target_wildcard_secret(&origin_ns, &origin_name)
            };
            let gateway = Gateway {
                metadata: ObjectMeta {
                    name: Some(names::gateway_name(&origin_name, svc)),
                    namespace: Some(origin_ns.clone()),
                    ..Default::default()
                },
                spec: GatewaySpec {
                    selector: service_selector(svc),
                    servers: vec![Server {
                        hosts: hosts.clone(),
                        port: Port {
                            number: HTTPS_PORT,
                            protocol: "HTTPS".to_string(),
                            name: WILDCARD_SERVER_PORT_NAME.to_string(),
                        },
                        tls: Some(ServerTlsSettings {
                            mode: TlsMode::Simple,
                            server_certificate: TLS_CERT_KEY.to_string(),
                            private_key: TLS_PRIVATE_KEY_KEY.to_string(),
                            credential_name,
                            ..Default::default()
                        }),
                    }],
                },
            };
            gateways.push(Owned::new(Owner::secret(origin), gateway));
        }
    }
    Ok(gateways)
}

/// Returns `namespace/name` for each Gateway.
pub fn qualified_gateway_names<'g>(
    gateways: impl IntoIterator<Item = &'g Gateway>,
) -> BTreeSet<String> {
    gateways
        .into_iter()
        .map(|gw| format!("{}/{}", gw.namespace().unwrap_or_default(), gw.name_any()))
        .collect()
}

/// Returns the servers of `gateway` that were added for `ing`, sorted by
/// port name.
pub fn get_servers(gateway: &Gateway, ing: &Ingress) -> Vec<Server> {
    let prefix = server_port_name_prefix(ing);
    let mut servers = gateway
        .spec
        .servers
        .iter()
        .filter(|server| {
            let mut parts = server.port.name.split(':');
            matches!(
                (parts.next(), parts.next(), parts.next()),
                (Some(p), Some(_), None) if p == prefix
            )
        })
        .cloned()
        .collect::<Vec<_>>();
    sort_servers(&mut servers);
    servers
}

pub fn get_http_server(gateway: &Gateway) -> Option<&Server> {
    gateway
        .spec
        .servers
        .iter()
        .find(|server| server.port.name == HTTP_SERVER_PORT_NAME)
}

/// Replaces the `existing` servers of `gateway` with `want`, leaving every
/// other server in place. The placeholder is dropped once real servers are
/// present and restored when none remain.
pub fn update_gateway(mut gateway: Gateway, want: Vec<Server>, existing: &[Server]) -> Gateway {
    let existing = existing
        .iter()
        .map(|server| server.port.name.as_str())
        .collect::<BTreeSet<_>>();
    let placeholder = placeholder_server();
    let mut servers = gateway
        .spec
        .servers
        .drain(..)
        .filter(|server| !existing.contains(server.port.name.as_str()) && *server != placeholder)
        .collect::<Vec<_>>();
    servers.extend(want);
    if servers.is_empty() {
        servers.push(placeholder);
    }
    sort_servers(&mut servers);
    gateway.spec.servers = servers;
    gateway
}

pub fn sort_servers(servers: &mut [Server]) {
    servers.sort_by(|a, b| a.port.name.cmp(&b.port.name));
}

fn server_port_name_prefix(ing: &Ingress) -> String {
    format!("{}/{}", ing.namespace().unwrap_or_default(), ing.name_any())
}

fn service_selector(svc: &Service) -> BTreeMap<String, String> {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.selector.clone())
        .unwrap_or_default()
}
