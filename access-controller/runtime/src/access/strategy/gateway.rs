use super::{
    super::backends::{backend_meta, remove_stale, upsert, Backends},
    endpoint, Config,
};
use crate::{
    context::apply_metadata,
    core::{endpoints::qualify, port_qualified_name, ResourceKey},
    k8s::{
        gateway::{tls_route_spec, GatewaySpec},
        labels, Endpoint, Gateway, ResourceExt, SecuredAccess, TlsRoute,
    },
    Error,
};
use ahash::AHashSet;
use tracing::info;

/// The shared Gateway that every TLSRoute attaches to.
pub const GATEWAY_NAME: &str = "skupper";

/// Exposes each port through a TLSRoute attached to a shared Gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayAccess {
    class: String,
    domain: String,
    port: i32,
    namespace: String,
}

// === impl GatewayAccess ===

impl GatewayAccess {
    /// Returns `None` if no gateway class is configured.
    pub fn new(config: &Config) -> Option<Self> {
        if config.gateway_class.is_empty() {
            return None;
        }
        Some(Self {
            class: config.gateway_class.clone(),
            domain: config.gateway_domain.clone(),
            port: config.gateway_port,
            namespace: config.namespace.clone(),
        })
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.namespace, GATEWAY_NAME)
    }

    /// The domain under which routes are published: the configured domain,
    /// else the address the Gateway was assigned.
    pub(crate) fn base_domain(&self, backends: &Backends) -> Option<String> {
        if !self.domain.is_empty() {
            return Some(self.domain.clone());
        }
        backends.gateway.as_ref()?.base_domain()
    }

    /// Applies the shared Gateway if it is missing or differs.
    pub(crate) async fn ensure_gateway(&self, backends: &mut Backends) -> Result<(), Error> {
        let spec = GatewaySpec::passthrough(&self.class, self.port);
        if backends.gateway.as_ref().map(|gw| gw.spec == spec).unwrap_or(false) {
            return Ok(());
        }

        let mut gateway = Gateway::new(GATEWAY_NAME, spec);
        gateway.metadata.namespace = Some(self.namespace.clone());
        gateway.metadata.annotations = Some(labels::controlled_annotations());
        apply_metadata(&*backends.context, &mut gateway.metadata, "Gateway");

        let applied = backends
            .clients
            .gateways
            .apply(&self.namespace, &gateway)
            .await?;
        info!(key = %self.key(), class = %self.class, "Applied Gateway");
        backends.gateway = Some(applied);
        Ok(())
    }

    pub(super) async fn realise_and_resolve(
        &self,
        backends: &mut Backends,
        sa: &SecuredAccess,
    ) -> Result<Vec<Endpoint>, Error> {
        let Some(domain) = self.base_domain(backends) else {
            return Err(Error::GatewayUnresolved);
        };
        let name = sa.name_any();
        let namespace = sa.namespace().unwrap_or_default();

        let mut desired_keys = AHashSet::new();
        let mut endpoints = Vec::new();
        for port in &sa.spec.ports {
            let route_name = port_qualified_name(&name, &port.name);
            let key = ResourceKey::new(&namespace, &route_name);
            let hostname = qualify(&route_name, &qualify(&namespace, &domain));
            let spec = tls_route_spec(&self.namespace, GATEWAY_NAME, &hostname, &name, port.port);

            let mut desired = TlsRoute::new(&route_name, spec.clone());
            desired.metadata = backend_meta(sa, &route_name);
            upsert(
                &backends.clients.tls_routes,
                &mut backends.tls_routes,
                &*backends.context,
                &key,
                desired,
                |current| {
                    if serde_json::to_value(&current.spec).ok() == serde_json::to_value(&spec).ok() {
                        return Ok(false);
                    }
                    current.spec = spec.clone();
                    Ok(true)
                },
            )
            .await?;

            endpoints.push(endpoint(&port.name, hostname, self.port));
            desired_keys.insert(key);
        }

        remove_stale(
            &backends.clients.tls_routes,
            &mut backends.tls_routes,
            sa,
            &desired_keys,
        )
        .await?;
        Ok(endpoints)
    }
}
