use crate::{
    access::{BackendCaches, SecuredAccessManager},
    core::ResourceKey,
    k8s::{Certificate, Secret, SecuredAccess},
    processor::{Handler, Kind, ResourceChange},
    watch::Cache,
    Error,
};

/// Dispatches each change to the manager responsible for its kind, passing
/// the current state of the resource read from the watch cache.
#[derive(Debug)]
pub struct Controller {
    access: SecuredAccessManager,
    caches: Caches,
}

#[derive(Clone)]
pub struct Caches {
    pub certificates: Cache<Certificate>,
    pub secrets: Cache<Secret>,
    pub secured_accesses: Cache<SecuredAccess>,
    pub backends: BackendCaches,
}

// === impl Controller ===

impl Controller {
    pub fn new(access: SecuredAccessManager, caches: Caches) -> Self {
        Self { access, caches }
    }

    /// Loads everything that already exists before any change is handled.
    ///
    /// Secrets are loaded before Certificates, and backend resources before
    /// SecuredAccesses, so that the first reconciliation of a definition
    /// compares against the actual state of the cluster.
    pub async fn recover(&mut self) {
        self.access
            .certificates()
            .recover(&self.caches.secrets, &self.caches.certificates)
            .await;
        self.access.recover_backends(&self.caches.backends);
        self.access.recover(&self.caches.secured_accesses).await;
        tracing::info!("Recovered existing resources");
    }
}

#[async_trait::async_trait]
impl Handler for Controller {
    async fn handle(&mut self, change: &ResourceChange) -> Result<(), Error> {
        let key = &change.key;
        let backends = &self.caches.backends;
        match change.kind {
            Kind::Certificate => {
                let cert = self.caches.certificates.get(key);
                self.access
                    .certificates()
                    .certificate_changed(key, cert)
                    .await
            }
            Kind::Secret => {
                let secret = self.caches.secrets.get(key);
                self.access.certificates().secret_changed(key, secret).await
            }
            Kind::SecuredAccess => {
                let sa = self.caches.secured_accesses.get(key);
                self.access.secured_access_changed(key, sa).await
            }
            Kind::Service => {
                let svc = backends.services.get(key);
                self.access.service_changed(key, svc).await
            }
            Kind::Ingress => {
                let ingress = backends.ingresses.get(key);
                self.access.ingress_changed(key, ingress).await
            }
            Kind::Route => {
                let route = optional(backends.routes.as_ref(), key);
                self.access.route_changed(key, route).await
            }
            Kind::HttpProxy => {
                let proxy = optional(backends.http_proxies.as_ref(), key);
                self.access.http_proxy_changed(key, proxy).await
            }
            Kind::TlsRoute => {
                let route = optional(backends.tls_routes.as_ref(), key);
                self.access.tls_route_changed(key, route).await
            }
            Kind::Gateway => {
                let gateway = optional(backends.gateways.as_ref(), key);
                self.access.gateway_changed(key, gateway).await
            }
        }
    }
}

fn optional<K: Clone>(cache: Option<&Cache<K>>, key: &ResourceKey) -> Option<K> {
    cache.and_then(|c| c.get(key))
}

impl std::fmt::Debug for Caches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caches").finish_non_exhaustive()
    }
}
