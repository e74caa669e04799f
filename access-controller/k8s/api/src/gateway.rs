use kube::CustomResource;
use serde::{Deserialize, Serialize};

pub use gateway_api::apis::experimental::tlsroutes::{
    TLSRoute as TlsRoute, TLSRouteParentRefs, TLSRouteRules, TLSRouteRulesBackendRefs,
    TLSRouteSpec,
};

pub const ADDRESS_TYPE_HOSTNAME: &str = "Hostname";
pub const ADDRESS_TYPE_IP: &str = "IPAddress";

/// The parts of a Gateway API `Gateway` that the gateway access type
/// manages. The object is written with server-side apply, so fields left
/// out here are never clobbered.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "gateway.networking.k8s.io",
    version = "v1",
    kind = "Gateway",
    status = "GatewayStatus",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    pub gateway_class_name: String,
    #[serde(default)]
    pub listeners: Vec<GatewayListener>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayListener {
    pub name: String,
    pub port: i32,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<GatewayListenerTls>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_routes: Option<AllowedRoutes>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayListenerTls {
    pub mode: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedRoutes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<RouteNamespaces>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteNamespaces {
    pub from: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    #[serde(default)]
    pub addresses: Vec<GatewayAddress>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAddress {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    pub value: String,
}

// === impl GatewaySpec ===

impl GatewaySpec {
    /// A gateway with one TLS passthrough listener accepting routes from
    /// every namespace.
    pub fn passthrough(class: &str, port: i32) -> Self {
        Self {
            gateway_class_name: class.to_string(),
            listeners: vec![GatewayListener {
                name: "tls".to_string(),
                port,
                protocol: "TLS".to_string(),
                tls: Some(GatewayListenerTls {
                    mode: "Passthrough".to_string(),
                }),
                allowed_routes: Some(AllowedRoutes {
                    namespaces: Some(RouteNamespaces {
                        from: "All".to_string(),
                    }),
                }),
            }],
        }
    }
}

// === impl Gateway ===

impl Gateway {
    /// Returns the base domain under which routed hosts are published.
    ///
    /// A hostname address is preferred; an IP address is turned into a
    /// wildcard DNS name.
    pub fn base_domain(&self) -> Option<String> {
        let addresses = &self.status.as_ref()?.addresses;
        let hostname = addresses.iter().find(|a| {
            a.type_.as_deref() == Some(ADDRESS_TYPE_HOSTNAME) && !a.value.is_empty()
        });
        if let Some(a) = hostname {
            return Some(a.value.clone());
        }
        addresses
            .iter()
            .find(|a| {
                matches!(a.type_.as_deref(), None | Some(ADDRESS_TYPE_IP)) && !a.value.is_empty()
            })
            .map(|a| format!("{}.nip.io", a.value))
    }
}

/// A TLSRoute attaching `hostname` to the gateway and forwarding to
/// `service:port`.
pub fn tls_route_spec(
    gateway_namespace: &str,
    gateway_name: &str,
    hostname: &str,
    service: &str,
    port: i32,
) -> TLSRouteSpec {
    TLSRouteSpec {
        parent_refs: Some(vec![TLSRouteParentRefs {
            group: None,
            kind: None,
            namespace: Some(gateway_namespace.to_string()),
            name: gateway_name.to_string(),
            section_name: None,
            port: None,
        }]),
        hostnames: Some(vec![hostname.to_string()]),
        rules: vec![TLSRouteRules {
            name: None,
            backend_refs: Some(vec![TLSRouteRulesBackendRefs {
                weight: None,
                group: None,
                kind: None,
                name: service.to_string(),
                namespace: None,
                port: Some(port),
            }]),
        }],
    }
}
