use super::{
    super::backends::{backend_meta, remove_stale, upsert, Backends},
    endpoint,
};
use crate::{
    core::{endpoints::qualify, port_qualified_name, ResourceKey},
    k8s::{
        route::RouteSpec, secured_access::SETTING_DOMAIN, Endpoint, ResourceExt, Route,
        SecuredAccess,
    },
    Error,
};
use ahash::AHashSet;

/// Exposes each port through an OpenShift Route with TLS passthrough.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteAccess(());

// === impl RouteAccess ===

impl RouteAccess {
    pub(super) async fn realise_and_resolve(
        &self,
        backends: &mut Backends,
        sa: &SecuredAccess,
    ) -> Result<Vec<Endpoint>, Error> {
        let name = sa.name_any();
        let namespace = sa.namespace().unwrap_or_default();
        let domain = sa
            .spec
            .settings
            .get(SETTING_DOMAIN)
            .filter(|d| !d.is_empty());

        let mut desired_keys = AHashSet::new();
        let mut endpoints = Vec::new();
        for port in &sa.spec.ports {
            let route_name = port_qualified_name(&name, &port.name);
            let key = ResourceKey::new(&namespace, &route_name);
            let host = domain.map(|d| qualify(&route_name, &qualify(&namespace, d)));
            let spec = RouteSpec::passthrough(&name, &port.name, host);

            let mut desired = Route::new(&route_name, spec.clone());
            desired.metadata = backend_meta(sa, &route_name);
            let route = upsert(
                &backends.clients.routes,
                &mut backends.routes,
                &*backends.context,
                &key,
                desired,
                |current| {
                    if current.spec.satisfies(&spec) {
                        return Ok(false);
                    }
                    current.spec = spec.clone();
                    Ok(true)
                },
            )
            .await?;

            if let Some(host) = route.admitted_host() {
                endpoints.push(endpoint(&port.name, host, "443"));
            }
            desired_keys.insert(key);
        }

        remove_stale(
            &backends.clients.routes,
            &mut backends.routes,
            sa,
            &desired_keys,
        )
        .await?;
        Ok(endpoints)
    }
}
