use kube::api::ObjectMeta;
use std::collections::BTreeMap;

pub type Map = BTreeMap<String, String>;

/// Annotation marking a resource as created and managed by this controller.
pub const CONTROLLED: &str = "internal.skupper.io/controlled";

/// Label carried by every backend resource created for a SecuredAccess.
pub const SECURED_ACCESS: &str = "internal.skupper.io/secured-access";

/// Marks Certificates (label) and Secrets (annotation) managed here.
pub const CERTIFICATE: &str = "internal.skupper.io/certificate";

/// Annotation on a Secret listing the hosts its certificate was issued for.
pub const HOSTS: &str = "internal.skupper.io/hosts";

/// Prefix of the per-owner host annotations on a Certificate.
pub const OWNER_HOSTS_PREFIX: &str = "internal.skupper.io/hosts-";

/// Returns true if the resource carries the controlled annotation.
pub fn is_controlled(meta: &ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .map(|a| a.contains_key(CONTROLLED))
        .unwrap_or(false)
}

pub fn has_secured_access_label(meta: &ObjectMeta) -> bool {
    meta.labels
        .as_ref()
        .map(|l| l.contains_key(SECURED_ACCESS))
        .unwrap_or(false)
}

/// A backend resource may only be removed if it carries both markers.
pub fn can_delete(meta: &ObjectMeta) -> bool {
    is_controlled(meta) && has_secured_access_label(meta)
}

/// The labels placed on every backend resource of a SecuredAccess.
pub fn secured_access_labels() -> Map {
    Some((SECURED_ACCESS.to_string(), "true".to_string()))
        .into_iter()
        .collect()
}

/// The annotations placed on every resource this controller creates.
pub fn controlled_annotations() -> Map {
    Some((CONTROLLED.to_string(), "true".to_string()))
        .into_iter()
        .collect()
}
