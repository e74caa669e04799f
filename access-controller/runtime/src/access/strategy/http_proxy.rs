use super::{
    super::backends::{backend_meta, remove_stale, upsert, Backends},
    endpoint,
};
use crate::{
    core::{endpoints::qualify, port_qualified_name, ResourceKey},
    k8s::{
        http_proxy::{HttpProxySpec, HttpProxyTarget},
        Endpoint, HttpProxy, ResourceExt, SecuredAccess,
    },
    Error,
};
use ahash::AHashSet;

/// Exposes each port through a Contour HTTPProxy in TLS passthrough mode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpProxyAccess {
    domain: String,
}

// === impl HttpProxyAccess ===

impl HttpProxyAccess {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
        }
    }

    pub(super) async fn realise_and_resolve(
        &self,
        backends: &mut Backends,
        sa: &SecuredAccess,
    ) -> Result<Vec<Endpoint>, Error> {
        let name = sa.name_any();
        let namespace = sa.namespace().unwrap_or_default();

        let mut desired_keys = AHashSet::new();
        let mut endpoints = Vec::new();
        for port in &sa.spec.ports {
            let proxy_name = port_qualified_name(&name, &port.name);
            let key = ResourceKey::new(&namespace, &proxy_name);
            let target = HttpProxyTarget {
                host: qualify(&proxy_name, &qualify(&namespace, &self.domain)),
                service_name: name.clone(),
                service_port: port.port,
            };

            let mut desired = HttpProxy::new(&proxy_name, HttpProxySpec::new(&target));
            desired.metadata = backend_meta(sa, &proxy_name);
            let proxy = upsert(
                &backends.clients.http_proxies,
                &mut backends.http_proxies,
                &*backends.context,
                &key,
                desired,
                |current| Ok(current.spec.set_target(&target)?),
            )
            .await?;

            let resolved = proxy.spec.target()?;
            if !resolved.host.is_empty() {
                endpoints.push(endpoint(&port.name, resolved.host, "443"));
            }
            desired_keys.insert(key);
        }

        remove_stale(
            &backends.clients.http_proxies,
            &mut backends.http_proxies,
            sa,
            &desired_keys,
        )
        .await?;
        Ok(endpoints)
    }
}
