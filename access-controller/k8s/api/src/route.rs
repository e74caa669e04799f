use crate::IntOrString;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

pub const TERMINATION_PASSTHROUGH: &str = "passthrough";
pub const INSECURE_POLICY_NONE: &str = "None";

/// A minimal mirror of the OpenShift `Route` resource, covering only the
/// fields written and read by the route access type.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "route.openshift.io",
    version = "v1",
    kind = "Route",
    status = "RouteStatus",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<RoutePort>,
    pub to: RouteTargetReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePort {
    pub target_port: IntOrString,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTargetReference {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub termination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure_edge_termination_policy: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    #[serde(default)]
    pub ingress: Vec<RouteIngress>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteIngress {
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_name: Option<String>,
}

// === impl RouteSpec ===

impl RouteSpec {
    /// A passthrough route to the named port of a service.
    pub fn passthrough(service: &str, port: &str, host: Option<String>) -> Self {
        Self {
            host,
            path: None,
            port: Some(RoutePort {
                target_port: IntOrString::String(port.to_string()),
            }),
            to: RouteTargetReference {
                kind: "Service".to_string(),
                name: service.to_string(),
                weight: None,
            },
            tls: Some(TlsConfig {
                termination: TERMINATION_PASSTHROUGH.to_string(),
                insecure_edge_termination_policy: Some(INSECURE_POLICY_NONE.to_string()),
            }),
        }
    }

    /// Compares the fields this controller manages.
    ///
    /// An empty desired host leaves the host chosen by the router in place.
    pub fn satisfies(&self, desired: &RouteSpec) -> bool {
        let host_matches = match desired.host.as_deref() {
            None | Some("") => true,
            Some(host) => self.host.as_deref() == Some(host),
        };
        host_matches
            && self.port == desired.port
            && self.to.kind == desired.to.kind
            && self.to.name == desired.to.name
            && self.tls == desired.tls
    }
}

// === impl Route ===

impl Route {
    /// The host admitted by the router, if any.
    pub fn admitted_host(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.ingress.first())
            .map(|i| i.host.as_str())
            .filter(|h| !h.is_empty())
    }
}
