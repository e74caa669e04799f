//! The ways a SecuredAccess can be exposed outside the cluster.
//!
//! Each access type realises the backend resources it needs for a
//! SecuredAccess and resolves the endpoints at which it can be reached.

mod gateway;
mod http_proxy;
mod ingress;
mod route;
mod service;

pub use self::{
    gateway::{GatewayAccess, GATEWAY_NAME},
    http_proxy::HttpProxyAccess,
    ingress::IngressAccess,
    route::RouteAccess,
    service::NodePortAccess,
};

use super::backends::Backends;
use crate::{
    core::service::{TYPE_LOAD_BALANCER, TYPE_NODE_PORT},
    k8s::{Endpoint, SecuredAccess, Service},
    Error,
};
use ahash::AHashMap;
use tracing::warn;

pub const ROUTE: &str = "route";
pub const LOADBALANCER: &str = "loadbalancer";
pub const NODEPORT: &str = "nodeport";
pub const INGRESS_NGINX: &str = "ingress-nginx";
pub const CONTOUR_HTTP_PROXY: &str = "contour-http-proxy";
pub const GATEWAY: &str = "gateway";
pub const LOCAL: &str = "local";

/// Every access type this controller knows how to realise.
pub const ALL: [&str; 7] = [
    ROUTE,
    LOADBALANCER,
    NODEPORT,
    INGRESS_NGINX,
    CONTOUR_HTTP_PROXY,
    GATEWAY,
    LOCAL,
];

/// Settings for the enabled access types.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    pub enabled_access_types: Vec<String>,
    pub default_access_type: Option<String>,
    pub ingress_domain: String,
    pub http_proxy_domain: String,
    pub gateway_class: String,
    pub gateway_domain: String,
    pub gateway_port: i32,
    pub cluster_host: String,
    /// The namespace holding the shared Gateway.
    pub namespace: String,
}

#[derive(Clone, Debug)]
pub enum AccessType {
    Route(RouteAccess),
    Ingress(IngressAccess),
    HttpProxy(HttpProxyAccess),
    LoadBalancer,
    NodePort(NodePortAccess),
    Local,
    Gateway(GatewayAccess),
    Unsupported,
}

pub(crate) static UNSUPPORTED: AccessType = AccessType::Unsupported;

// === impl Config ===

impl Config {
    /// The access type used when a SecuredAccess does not name one.
    pub fn default_access_type(&self, routes_available: bool) -> String {
        match self.default_access_type.as_deref().filter(|t| !t.is_empty()) {
            Some(t) => t.to_string(),
            None if routes_available => ROUTE.to_string(),
            None => LOADBALANCER.to_string(),
        }
    }
}

// === impl AccessType ===

impl AccessType {
    /// Builds the enabled access types, keyed by name.
    pub fn enabled(config: &Config) -> AHashMap<String, AccessType> {
        let mut types = AHashMap::default();
        for name in &config.enabled_access_types {
            let access_type = match name.as_str() {
                ROUTE => Self::Route(RouteAccess::default()),
                LOADBALANCER => Self::LoadBalancer,
                NODEPORT => Self::NodePort(NodePortAccess::new(&config.cluster_host)),
                INGRESS_NGINX => Self::Ingress(IngressAccess::nginx(&config.ingress_domain)),
                CONTOUR_HTTP_PROXY => Self::HttpProxy(HttpProxyAccess::new(&config.http_proxy_domain)),
                LOCAL => Self::Local,
                GATEWAY => match GatewayAccess::new(config) {
                    Some(gateway) => Self::Gateway(gateway),
                    None => {
                        warn!("No gateway class configured, gateway access type will not be enabled");
                        continue;
                    }
                },
                other => {
                    warn!(access_type = %other, "Ignoring unknown access type");
                    continue;
                }
            };
            types.insert(name.clone(), access_type);
        }
        types
    }

    /// Creates or updates the backend resources for `sa` and returns the
    /// endpoints resolved so far.
    pub(crate) async fn realise_and_resolve(
        &self,
        backends: &mut Backends,
        sa: &SecuredAccess,
        svc: &Service,
    ) -> Result<Vec<Endpoint>, Error> {
        match self {
            Self::Route(route) => route.realise_and_resolve(backends, sa).await,
            Self::Ingress(ingress) => ingress.realise_and_resolve(backends, sa).await,
            Self::HttpProxy(proxy) => proxy.realise_and_resolve(backends, sa).await,
            Self::LoadBalancer => Ok(service::load_balancer(sa, svc)),
            Self::NodePort(nodeport) => Ok(nodeport.resolve(sa, svc)),
            Self::Local => Ok(service::local(sa)),
            Self::Gateway(gateway) => gateway.realise_and_resolve(backends, sa).await,
            Self::Unsupported => Err(Error::UnsupportedAccessType),
        }
    }
}

/// The Service type required by an access type. `None` is a cluster IP
/// service.
pub fn service_type(access_type: &str) -> Option<&'static str> {
    match access_type {
        LOADBALANCER => Some(TYPE_LOAD_BALANCER),
        NODEPORT => Some(TYPE_NODE_PORT),
        _ => None,
    }
}

fn endpoint(name: &str, host: impl ToString, port: impl ToString) -> Endpoint {
    Endpoint {
        name: name.to_string(),
        host: host.to_string(),
        port: port.to_string(),
        group: String::new(),
    }
}
