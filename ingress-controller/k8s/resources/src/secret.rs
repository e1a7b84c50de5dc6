use crate::{
    names::{self, truncate},
    Error,
};
use istio_ingress_controller_k8s_api::{
    ingress::IngressTls,
    labels::{ORIGIN_SECRET_NAMESPACE_LABEL, ORIGIN_SECRET_NAME_LABEL, MAX_LABEL_VALUE_LEN},
    Ingress, ObjectMeta, Owned, Owner, ResourceExt, Secret,
};
use std::collections::{BTreeMap, BTreeSet};
use x509_parser::extensions::GeneralName;

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

/// Origin Secrets keyed by `namespace/name`.
pub type SecretMap = BTreeMap<String, Secret>;

#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("missing {0} data")]
    MissingData(&'static str),

    #[error("failed to decode PEM block: {0}")]
    Pem(String),

    #[error("failed to parse certificate: {0}")]
    X509(String),

    #[error("certificate has no DNS names")]
    NoDnsNames,
}

pub fn secret_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Looks up every origin Secret referenced by the TLS entries.
pub fn get_secrets(
    tls: &[IngressTls],
    get: impl Fn(&str, &str) -> Option<Secret>,
) -> Result<SecretMap, Error> {
    let mut secrets = SecretMap::new();
    for entry in tls {
        let secret = get(&entry.secret_namespace, &entry.secret_name).ok_or_else(|| {
            Error::MissingSecret {
                namespace: entry.secret_namespace.clone(),
                name: entry.secret_name.clone(),
            }
        })?;
        secrets.insert(secret_key(&entry.secret_namespace, &entry.secret_name), secret);
    }
    Ok(secrets)
}

/// Copies each origin Secret into every target namespace other than its own.
/// The copies are controlled by the Ingress.
pub fn make_secrets(
    ing: &Ingress,
    origin_secrets: &SecretMap,
    target_namespaces: &BTreeSet<String>,
) -> Vec<Owned<Secret>> {
    let owner = Owner::ingress(ing);
    let mut secrets = Vec::new();
    for origin in origin_secrets.values() {
        let origin_ns = origin.namespace().unwrap_or_default();
        for ns in target_namespaces.iter().filter(|ns| **ns != origin_ns) {
            secrets.push(make_secret(
                origin,
                names::target_secret(ing, origin),
                ns,
                owner.clone(),
            ));
        }
    }
    secrets
}

/// Copies each wildcard origin Secret into every target namespace other than
/// its own. The copies are shared by all Ingresses and are controlled by the
/// origin Secret.
pub fn make_wildcard_secrets(
    origin_secrets: &SecretMap,
    target_namespaces: &BTreeSet<String>,
) -> Vec<Owned<Secret>> {
    let mut secrets = Vec::new();
    for origin in origin_secrets.values() {
        let origin_ns = origin.namespace().unwrap_or_default();
        let name = names::target_wildcard_secret(&origin_ns, &origin.name_any());
        for ns in target_namespaces.iter().filter(|ns| **ns != origin_ns) {
            secrets.push(make_secret(origin, name.clone(), ns, Owner::secret(origin)));
        }
    }
    secrets
}

fn make_secret(origin: &Secret, name: String, namespace: &str, owner: Owner) -> Owned<Secret> {
    let origin_name = origin.name_any();
    let origin_ns = origin.namespace().unwrap_or_default();
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(make_target_secret_labels(&origin_name, &origin_ns)),
            annotations: make_target_secret_annotations(&origin_name, &origin_ns),
            ..Default::default()
        },
        data: origin.data.clone(),
        type_: origin.type_.clone(),
        ..Default::default()
    };
    Owned::new(owner, secret)
}

/// Labels a copy with its origin so it can be found again.
pub fn make_target_secret_labels(name: &str, namespace: &str) -> BTreeMap<String, String> {
    [
        (ORIGIN_SECRET_NAME_LABEL.to_string(), label_value(name)),
        (ORIGIN_SECRET_NAMESPACE_LABEL.to_string(), label_value(namespace)),
    ]
    .into_iter()
    .collect()
}

/// Keeps the full origin reference when it does not fit in a label value.
fn make_target_secret_annotations(name: &str, namespace: &str) -> Option<BTreeMap<String, String>> {
    if name.len() <= MAX_LABEL_VALUE_LEN && namespace.len() <= MAX_LABEL_VALUE_LEN {
        return None;
    }
    Some(
        [
            (ORIGIN_SECRET_NAME_LABEL.to_string(), name.to_string()),
            (ORIGIN_SECRET_NAMESPACE_LABEL.to_string(), namespace.to_string()),
        ]
        .into_iter()
        .collect(),
    )
}

fn label_value(value: &str) -> String {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value.to_string();
    }
    let hash = format!("{:08x}", adler::adler32_slice(value.as_bytes()));
    let head = truncate(value, MAX_LABEL_VALUE_LEN - hash.len() - 1)
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    format!("{head}-{hash}")
}

/// Recovers the `(namespace, name)` of the Secret a copy was made from.
pub fn extract_origin_secret_ref(secret: &Secret) -> Option<(String, String)> {
    let lookup = |key: &str| {
        secret
            .annotations()
            .get(key)
            .or_else(|| secret.labels().get(key))
            .cloned()
    };
    Some((
        lookup(ORIGIN_SECRET_NAMESPACE_LABEL)?,
        lookup(ORIGIN_SECRET_NAME_LABEL)?,
    ))
}

/// Reads the DNS names from the certificate stored in a TLS Secret.
pub fn hosts_from_cert_secret(secret: &Secret) -> Result<Vec<String>, CertificateError> {
    let data = secret
        .data
        .as_ref()
        .and_then(|data| data.get(TLS_CERT_KEY))
        .ok_or(CertificateError::MissingData(TLS_CERT_KEY))?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(&data.0)
        .map_err(|e| CertificateError::Pem(e.to_string()))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| CertificateError::X509(e.to_string()))?;
    let hosts = cert
        .subject_alternative_name()
        .map_err(|e| CertificateError::X509(e.to_string()))?
        .map(|san| {
            san.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if hosts.is_empty() {
        return Err(CertificateError::NoDnsNames);
    }
    Ok(hosts)
}

/// Splits Secrets into `(non_wildcard, wildcard)` by their certificate's
/// first DNS name. Any unreadable certificate fails the whole split.
pub fn categorize_secrets(secrets: &SecretMap) -> Result<(SecretMap, SecretMap), Error> {
    let mut non_wildcard = SecretMap::new();
    let mut wildcard = SecretMap::new();
    for (key, secret) in secrets {
        let hosts = hosts_from_cert_secret(secret).map_err(|source| Error::Certificate {
            namespace: secret.namespace().unwrap_or_default(),
            name: secret.name_any(),
            source,
        })?;
        if hosts[0].split('.').next() == Some("*") {
            wildcard.insert(key.clone(), secret.clone());
        } else {
            non_wildcard.insert(key.clone(), secret.clone());
        }
    }
    Ok((non_wildcard, wildcard))
}

/// Returns the TLS entries whose Secret is not a wildcard certificate.
pub fn non_wildcard_tls(tls: &[IngressTls], non_wildcard: &SecretMap) -> Vec<IngressTls> {
    tls.iter()
        .filter(|t| non_wildcard.contains_key(&secret_key(&t.secret_namespace, &t.secret_name)))
        .cloned()
        .collect()
}
