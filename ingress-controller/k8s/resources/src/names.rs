use istio_ingress_controller_k8s_api::{Ingress, ResourceExt, Secret, Service};

/// Kubernetes caps object names at this length.
pub const MAX_NAME_LEN: usize = 63;

/// Gateway name prefixes are cut to leave room for the hash suffix.
const MAX_GATEWAY_PREFIX_LEN: usize = 54;

/// Appends `suffix` to `parent`, hashing the parent when the result would be
/// too long to be a valid object name.
pub fn child_name(parent: &str, suffix: &str) -> String {
    let name = format!("{parent}{suffix}");
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let hash = format!("{:08x}", adler::adler32_slice(parent.as_bytes()));
    let keep = MAX_NAME_LEN.saturating_sub(hash.len() + suffix.len());
    format!("{}{hash}{suffix}", truncate(parent, keep))
}

/// Names the Gateway that `prefix` owns on the given gateway Service.
pub fn gateway_name(prefix: &str, gateway_service: &Service) -> String {
    let key = format!(
        "{}/{}",
        gateway_service.namespace().unwrap_or_default(),
        gateway_service.name_any()
    );
    format!(
        "{}-{:08x}",
        truncate(prefix, MAX_GATEWAY_PREFIX_LEN),
        adler::adler32_slice(key.as_bytes())
    )
}

pub fn ingress_virtual_service(ing: &Ingress) -> String {
    ing.name_any()
}

pub fn mesh_virtual_service(ing: &Ingress) -> String {
    child_name(&ing.name_any(), "-mesh")
}

/// Names the per-Ingress copy of an origin Secret.
pub fn target_secret(ing: &Ingress, origin: &Secret) -> String {
    format!("{}-{}", ing.name_any(), origin.uid().unwrap_or_default())
}

/// Names the shared copy of a wildcard certificate Secret.
pub fn target_wildcard_secret(namespace: &str, name: &str) -> String {
    format!("{namespace}--{name}-wildcard")
}

pub(crate) fn truncate(s: &str, len: usize) -> &str {
    match s.char_indices().nth(len) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
