use access_controller_k8s_api::Endpoint;
use ahash::AHashSet;

/// Appends `domain` to `host`, unless the domain is empty.
pub fn qualify(host: &str, domain: &str) -> String {
    if domain.is_empty() {
        host.to_string()
    } else {
        format!("{host}.{domain}")
    }
}

/// The first DNS label of a host.
pub fn prefix(host: &str) -> &str {
    host.split_once('.').map(|(first, _)| first).unwrap_or(host)
}

/// Appends `domain` to `host` unless it already ends with it.
pub fn qualify_once(host: &str, domain: &str) -> String {
    if domain.is_empty() || host.ends_with(&format!(".{domain}")) || host == domain {
        host.to_string()
    } else {
        qualify(host, domain)
    }
}

/// The hosts a server certificate for a SecuredAccess must cover: every
/// resolved endpoint host plus the in-cluster service names.
pub fn service_hosts(name: &str, namespace: &str, endpoints: &[Endpoint]) -> Vec<String> {
    let mut seen = AHashSet::new();
    endpoints
        .iter()
        .map(|e| e.host.clone())
        .filter(|h| !h.is_empty())
        .chain([name.to_string(), qualify(name, namespace)])
        .filter(|h| seen.insert(h.clone()))
        .collect()
}
