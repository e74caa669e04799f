use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A contour `HTTPProxy`.
///
/// Only a handful of nested fields are managed here, so the spec is kept as
/// an open JSON object and accessed through [`HttpProxySpec::target`] and
/// [`HttpProxySpec::set_target`].
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "projectcontour.io",
    version = "v1",
    kind = "HTTPProxy",
    plural = "httpproxies",
    root = "HttpProxy",
    namespaced,
    schema = "disabled"
)]
pub struct HttpProxySpec {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// The passthrough target of an HTTPProxy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpProxyTarget {
    pub host: String,
    pub service_name: String,
    pub service_port: i32,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Unexpected structure for HTTPProxy")]
pub struct UnexpectedStructure;

// === impl HttpProxySpec ===

impl HttpProxySpec {
    pub fn new(target: &HttpProxyTarget) -> Self {
        let mut spec = Self::default();
        // An empty object always has the expected shape.
        let _ = spec.set_target(target);
        spec
    }

    /// Reads `virtualhost.fqdn` and the first `tcpproxy.services` entry.
    pub fn target(&self) -> Result<HttpProxyTarget, UnexpectedStructure> {
        let mut target = HttpProxyTarget::default();
        if let Some(vhost) = optional_object(&self.fields, "virtualhost")? {
            if let Some(fqdn) = vhost.get("fqdn") {
                target.host = fqdn.as_str().ok_or(UnexpectedStructure)?.to_string();
            }
        }
        if let Some(tcp) = optional_object(&self.fields, "tcpproxy")? {
            if let Some(services) = tcp.get("services") {
                let services = services.as_array().ok_or(UnexpectedStructure)?;
                if let Some(service) = services.first() {
                    let service = service.as_object().ok_or(UnexpectedStructure)?;
                    if let Some(name) = service.get("name") {
                        target.service_name =
                            name.as_str().ok_or(UnexpectedStructure)?.to_string();
                    }
                    if let Some(port) = service.get("port") {
                        target.service_port = port
                            .as_i64()
                            .and_then(|p| i32::try_from(p).ok())
                            .ok_or(UnexpectedStructure)?;
                    }
                }
            }
        }
        Ok(target)
    }

    /// Writes the target, returning true if the spec changed.
    pub fn set_target(&mut self, desired: &HttpProxyTarget) -> Result<bool, UnexpectedStructure> {
        let actual = self.target()?;
        let tls_ok = self.passthrough_enabled();
        if actual == *desired && tls_ok {
            return Ok(false);
        }

        let vhost = object_entry(&mut self.fields, "virtualhost")?;
        vhost.insert("fqdn".to_string(), Value::String(desired.host.clone()));
        let tls = object_entry(vhost, "tls")?;
        tls.insert("passthrough".to_string(), Value::Bool(true));

        let tcp = object_entry(&mut self.fields, "tcpproxy")?;
        let mut service = Map::new();
        service.insert(
            "name".to_string(),
            Value::String(desired.service_name.clone()),
        );
        service.insert("port".to_string(), Value::from(desired.service_port));
        tcp.insert(
            "services".to_string(),
            Value::Array(vec![Value::Object(service)]),
        );
        Ok(true)
    }

    fn passthrough_enabled(&self) -> bool {
        self.fields
            .get("virtualhost")
            .and_then(|v| v.get("tls"))
            .and_then(|t| t.get("passthrough"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

fn optional_object<'m>(
    map: &'m Map<String, Value>,
    key: &str,
) -> Result<Option<&'m Map<String, Value>>, UnexpectedStructure> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(obj)) => Ok(Some(obj)),
        Some(_) => Err(UnexpectedStructure),
    }
}

fn object_entry<'m>(
    map: &'m mut Map<String, Value>,
    key: &str,
) -> Result<&'m mut Map<String, Value>, UnexpectedStructure> {
    let value = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut().ok_or(UnexpectedStructure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target() -> HttpProxyTarget {
        HttpProxyTarget {
            host: "mysvc-http.test.example.com".to_string(),
            service_name: "mysvc".to_string(),
            service_port: 8080,
        }
    }

    #[test]
    fn new_spec_has_passthrough_shape() {
        let spec = HttpProxySpec::new(&target());
        assert_eq!(
            serde_json::to_value(&spec).unwrap(),
            json!({
                "virtualhost": {
                    "fqdn": "mysvc-http.test.example.com",
                    "tls": { "passthrough": true }
                },
                "tcpproxy": {
                    "services": [{ "name": "mysvc", "port": 8080 }]
                }
            })
        );
        assert_eq!(spec.target().unwrap(), target());
    }

    #[test]
    fn set_target_preserves_unrelated_fields() {
        let mut spec: HttpProxySpec = serde_json::from_value(json!({
            "ingressClassName": "contour",
            "virtualhost": { "fqdn": "old.example.com" },
        }))
        .unwrap();
        assert!(spec.set_target(&target()).unwrap());
        assert!(!spec.set_target(&target()).unwrap());
        assert_eq!(spec.fields["ingressClassName"], json!("contour"));
        assert_eq!(spec.fields["virtualhost"]["tls"]["passthrough"], json!(true));
    }

    #[test]
    fn malformed_spec_is_rejected() {
        let mut spec: HttpProxySpec = serde_json::from_value(json!({
            "virtualhost": "not-an-object",
        }))
        .unwrap();
        assert_eq!(spec.target(), Err(UnexpectedStructure));
        assert_eq!(spec.set_target(&target()), Err(UnexpectedStructure));

        let spec: HttpProxySpec = serde_json::from_value(json!({
            "tcpproxy": { "services": [{ "name": "mysvc", "port": "http" }] },
        }))
        .unwrap();
        assert_eq!(spec.target(), Err(UnexpectedStructure));
    }
}
