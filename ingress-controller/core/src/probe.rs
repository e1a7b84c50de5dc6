use istio_ingress_controller_k8s_api::{
    ingress::{HeaderMatch, IngressRule},
    Ingress,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Set by the prober on every probe request.
pub const PROBE_HEADER: &str = "K-Network-Probe";
pub const PROBE_HEADER_VALUE: &str = "probe";

/// Carries the hash of the Ingress generation that a route was built from.
pub const HASH_HEADER: &str = "K-Network-Hash";

pub const PROBE_PATH: &str = "/healthz";

/// The endpoints of one gateway port and the URLs to request through them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeTarget {
    pub pod_ips: BTreeSet<String>,
    pub pod_port: String,
    /// The logical port the gateway server declares.
    pub port: String,
    pub urls: Vec<http::Uri>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("rule is missing an HTTP block: {0:?}")]
    MissingHttp(Box<IngressRule>),

    #[error("failed to serialize Ingress spec: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Adds routes that let a prober tell which Ingress generation a gateway is
/// serving.
pub trait ProbeInjector: Send + Sync {
    /// Inserts probe routes and returns the hash they match on.
    fn insert_probe(&self, ing: &mut Ingress) -> Result<String, ProbeError>;
}

/// Hashes the Ingress spec and prepends, for every path, a copy that only
/// matches requests carrying that hash.
#[derive(Copy, Clone, Debug, Default)]
pub struct HashProbeInjector;

impl ProbeInjector for HashProbeInjector {
    fn insert_probe(&self, ing: &mut Ingress) -> Result<String, ProbeError> {
        let hash = spec_hash(ing)?;
        if let Some(rule) = ing.spec.rules.iter().find(|r| r.http.is_none()) {
            return Err(ProbeError::MissingHttp(Box::new(rule.clone())));
        }
        for http in ing.spec.rules.iter_mut().filter_map(|r| r.http.as_mut()) {
            let mut paths = http
                .paths
                .iter()
                .cloned()
                .map(|mut path| {
                    path.headers.insert(
                        HASH_HEADER.to_string(),
                        HeaderMatch {
                            exact: hash.clone(),
                        },
                    );
                    path.append_headers
                        .insert(HASH_HEADER.to_string(), hash.clone());
                    path
                })
                .collect::<Vec<_>>();
            paths.append(&mut http.paths);
            http.paths = paths;
        }
        Ok(hash)
    }
}

fn spec_hash(ing: &Ingress) -> Result<String, ProbeError> {
    let bytes = serde_json::to_vec(&ing.spec)?;
    Ok(Sha256::digest(&bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use istio_ingress_controller_k8s_api::{
        ingress::{HttpIngressPath, HttpIngressRuleValue},
        IngressSpec, Visibility,
    };
    use pretty_assertions::assert_eq;

    fn ingress(http: Option<HttpIngressRuleValue>) -> Ingress {
        Ingress::new(
            "hello",
            IngressSpec {
                rules: vec![IngressRule {
                    hosts: vec!["hello.example.com".to_string()],
                    visibility: Visibility::ExternalIp,
                    http,
                }],
                ..Default::default()
            },
        )
    }

    #[test]
    fn prepends_probe_paths() {
        let mut ing = ingress(Some(HttpIngressRuleValue {
            paths: vec![HttpIngressPath {
                path: "/api".to_string(),
                ..Default::default()
            }],
        }));
        let hash = HashProbeInjector.insert_probe(&mut ing).unwrap();
        assert_eq!(hash.len(), 64);

        let paths = &ing.spec.rules[0].http.as_ref().unwrap().paths;
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].path, "/api");
        assert_eq!(paths[0].headers[HASH_HEADER].exact, hash);
        assert_eq!(paths[0].append_headers[HASH_HEADER], hash);
        assert_eq!(paths[1], HttpIngressPath {
            path: "/api".to_string(),
            ..Default::default()
        });
    }

    #[test]
    fn hash_is_stable() {
        let http = HttpIngressRuleValue {
            paths: vec![HttpIngressPath::default()],
        };
        let a = HashProbeInjector
            .insert_probe(&mut ingress(Some(http.clone())))
            .unwrap();
        let b = HashProbeInjector
            .insert_probe(&mut ingress(Some(http)))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_rules_without_http() {
        assert!(matches!(
            HashProbeInjector.insert_probe(&mut ingress(None)),
            Err(ProbeError::MissingHttp(_))
        ));
    }
}
