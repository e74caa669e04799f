use access_controller_k8s_api::{Resource, ResourceExt};
use std::{fmt, str::FromStr};

/// Identifies a namespaced resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid resource key {0:?}: expected namespace/name")]
pub struct InvalidKey(String);

// === impl ResourceKey ===

impl ResourceKey {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// The key of a resource, or `None` if it is missing a name or namespace.
    pub fn of<K: Resource>(resource: &K) -> Option<Self> {
        Some(Self {
            namespace: resource.namespace()?,
            name: resource.meta().name.clone()?,
        })
    }

    /// A key for another resource in the same namespace.
    pub fn sibling(&self, name: impl ToString) -> Self {
        Self::new(&self.namespace, name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ResourceKey {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(InvalidKey(s.to_string())),
        }
    }
}

/// The name of a backend resource created for one port of a SecuredAccess.
pub fn port_qualified_name(name: &str, port: &str) -> String {
    format!("{name}-{port}")
}

/// Enumerates every way a port-qualified resource name could have been
/// formed, splitting at each hyphen from left to right.
///
/// Both the SecuredAccess name and the port name may contain hyphens, so no
/// single split is authoritative.
pub fn port_qualified_splits(key: &ResourceKey) -> impl Iterator<Item = (ResourceKey, &str)> + '_ {
    key.name
        .match_indices('-')
        .map(move |(i, _)| (key.sibling(&key.name[..i]), &key.name[i + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_and_displays() {
        let key = "test/my-service".parse::<ResourceKey>().unwrap();
        assert_eq!(key, ResourceKey::new("test", "my-service"));
        assert_eq!(key.to_string(), "test/my-service");

        for bad in ["", "noslash", "/name", "ns/", "a/b/c"] {
            assert!(bad.parse::<ResourceKey>().is_err(), "{bad:?}");
        }
    }

    #[test]
    fn enumerates_every_split() {
        let key = ResourceKey::new("test", "my-app-tls-port");
        let splits = port_qualified_splits(&key)
            .map(|(k, port)| (k.to_string(), port.to_string()))
            .collect::<Vec<_>>();
        assert_eq!(
            splits,
            vec![
                ("test/my".to_string(), "app-tls-port".to_string()),
                ("test/my-app".to_string(), "tls-port".to_string()),
                ("test/my-app-tls".to_string(), "port".to_string()),
            ]
        );
    }

    #[test]
    fn no_splits_without_hyphens() {
        let key = ResourceKey::new("test", "plain");
        assert_eq!(port_qualified_splits(&key).count(), 0);
    }

    #[test]
    fn qualified_names_round_trip_through_splits() {
        let name = port_qualified_name("my-app", "tls-port");
        let key = ResourceKey::new("test", name);
        assert!(port_qualified_splits(&key)
            .any(|(k, port)| k.name == "my-app" && port == "tls-port"));
    }
}
