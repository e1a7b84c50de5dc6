use crate::Error;
use istio_ingress_controller_core::network;
use istio_ingress_controller_k8s_api::{
    istio::destination_rule::{
        ClientTlsMode, ClientTlsSettings, ConnectionPoolSettings, DestinationRule,
        DestinationRuleSpec, H2UpgradePolicy, HttpSettings, TrafficPolicy,
    },
    labels::INGRESS_LABEL,
    Ingress, ObjectMeta, Owned, Owner, ResourceExt, Service,
};
use std::collections::BTreeSet;

/// The Secret holding the CA bundle for system-internal TLS.
pub const INTERNAL_CREDENTIAL_NAME: &str = "knative-serving-certs";

/// The SAN presented by data-plane components.
pub const DATA_PLANE_ROUTING_SAN: &str = "kn-routing";

const HTTP2_PORT_NAMES: [&str; 2] = ["http2", "h2c"];

/// Builds a DestinationRule that upgrades gateway-to-backend traffic to TLS.
pub fn make_internal_encryption_destination_rule(
    host: &str,
    ing: &Ingress,
    http2: bool,
) -> Owned<DestinationRule> {
    let annotations = ing.annotations().clone();
    let dr = DestinationRule {
        metadata: ObjectMeta {
            name: Some(host.to_string()),
            namespace: ing.namespace(),
            labels: Some(
                Some((INGRESS_LABEL.to_string(), ing.name_any()))
                    .into_iter()
                    .collect(),
            ),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..Default::default()
        },
        spec: DestinationRuleSpec {
            host: host.to_string(),
            traffic_policy: Some(TrafficPolicy {
                connection_pool: http2.then(|| ConnectionPoolSettings {
                    http: Some(HttpSettings {
                        h2_upgrade_policy: H2UpgradePolicy::Upgrade,
                    }),
                }),
                tls: Some(ClientTlsSettings {
                    mode: ClientTlsMode::Simple,
                    credential_name: INTERNAL_CREDENTIAL_NAME.to_string(),
                    subject_alt_names: vec![DATA_PLANE_ROUTING_SAN.to_string()],
                }),
            }),
        },
    };
    Owned::new(Owner::ingress(ing), dr)
}

/// Builds one DestinationRule per distinct backend Service of the Ingress.
///
/// Paths that rewrite the host are skipped: they target the local gateway,
/// which does not terminate internal TLS.
pub fn make_internal_encryption_destination_rules(
    ing: &Ingress,
    get_service: impl Fn(&str, &str) -> Option<Service>,
    cluster_domain: &str,
) -> Result<Vec<Owned<DestinationRule>>, Error> {
    let mut seen = BTreeSet::new();
    let mut drs = Vec::new();
    let paths = ing
        .spec
        .rules
        .iter()
        .flat_map(|rule| rule.http.iter().flat_map(|http| http.paths.iter()))
        .filter(|path| path.rewrite_host.is_empty());
    for path in paths {
        for split in path.splits.iter() {
            let backend = &split.backend;
            let host = network::service_hostname(
                &backend.service_name,
                &backend.service_namespace,
                cluster_domain,
            );
            if !seen.insert(host.clone()) {
                continue;
            }
            let svc = get_service(&backend.service_namespace, &backend.service_name).ok_or_else(
                || Error::MissingService {
                    namespace: backend.service_namespace.clone(),
                    name: backend.service_name.clone(),
                },
            )?;
            let http2 = svc
                .spec
                .iter()
                .flat_map(|spec| spec.ports.iter().flatten())
                .any(|port| {
                    port.name
                        .as_deref()
                        .map_or(false, |name| HTTP2_PORT_NAMES.contains(&name))
                });
            drs.push(make_internal_encryption_destination_rule(&host, ing, http2));
        }
    }
    Ok(drs)
}
