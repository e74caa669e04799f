//! Reconciles SecuredAccess resources into a Service plus the backend
//! resources of the chosen access type.

mod backends;
pub mod strategy;

pub use self::strategy::{AccessType, Config};

use self::{
    backends::Backends,
    strategy::{GATEWAY, INGRESS_NGINX},
};
use crate::{
    certificates::{CertificateManager, LeafRequest},
    client::Clients,
    context::{apply_metadata, ControllerContext},
    core::{
        endpoints::service_hosts,
        port_qualified_splits,
        service::{update_ports, update_selector, update_type},
        ResourceKey,
    },
    k8s::{
        certificate::SETTING_CERTIFICATE_CONTROLLER,
        labels::{self, Map},
        owner_reference, Gateway, HttpProxy, Ingress, ObjectMeta, OwnerReference, ResourceExt,
        Route, SecuredAccess, SecuredAccessSpec, Service, ServiceSpec, TlsRoute,
    },
    watch::Cache,
    Error,
};
use ahash::{AHashMap, AHashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SecuredAccessManager {
    definitions: AHashMap<ResourceKey, SecuredAccess>,
    backends: Backends,
    certificates: CertificateManager,
    access_types: AHashMap<String, AccessType>,
    default_access_type: String,
    /// SecuredAccesses waiting for the Gateway address to be known.
    unresolved: AHashSet<ResourceKey>,
}

// === impl SecuredAccessManager ===

impl SecuredAccessManager {
    pub fn new(
        clients: Clients,
        context: Arc<dyn ControllerContext>,
        certificates: CertificateManager,
        config: &Config,
        default_access_type: String,
    ) -> Self {
        Self {
            definitions: AHashMap::default(),
            backends: Backends::new(clients, context),
            certificates,
            access_types: AccessType::enabled(config),
            default_access_type,
            unresolved: AHashSet::default(),
        }
    }

    pub fn certificates(&mut self) -> &mut CertificateManager {
        &mut self.certificates
    }

    pub fn definition(&self, key: &ResourceKey) -> Option<&SecuredAccess> {
        self.definitions.get(key)
    }

    pub fn is_valid_access_type(&self, access_type: &str) -> bool {
        self.access_types.contains_key(access_type)
    }

    /// Creates or updates a SecuredAccess on behalf of another resource.
    pub async fn ensure(
        &mut self,
        key: &ResourceKey,
        spec: SecuredAccessSpec,
        annotations: Map,
        owners: Vec<OwnerReference>,
    ) -> Result<(), Error> {
        let context = self.backends.context.clone();

        let Some(mut current) = self.definitions.get(key).cloned() else {
            let mut sa = SecuredAccess::new(&key.name, spec);
            sa.metadata = ObjectMeta {
                name: Some(key.name.clone()),
                namespace: Some(key.namespace.clone()),
                owner_references: Some(owners).filter(|o| !o.is_empty()),
                annotations: Some(annotations).filter(|a| !a.is_empty()),
                ..Default::default()
            };
            apply_metadata(&*context, &mut sa.metadata, "SecuredAccess");

            let api = &self.backends.clients.secured_accesses;
            let created = match api.create(&key.namespace, &sa).await {
                Ok(created) => created,
                Err(Error::AlreadyExists { .. }) => {
                    info!(%key, "SecuredAccess already exists, loading latest");
                    match api.get(&key.namespace, &key.name).await? {
                        Some(latest) => latest,
                        None => return Ok(()),
                    }
                }
                Err(error) => {
                    warn!(%key, %error, "Failed to create SecuredAccess");
                    return Err(error);
                }
            };
            self.definitions.insert(key.clone(), created);
            return Ok(());
        };

        let mut changed = false;
        if current.spec != spec {
            current.spec = spec;
            changed = true;
        }
        let existing = current.metadata.annotations.get_or_insert_with(Map::new);
        for (k, v) in annotations {
            if existing.get(&k) != Some(&v) {
                existing.insert(k, v);
                changed = true;
            }
        }
        changed |= apply_metadata(&*context, &mut current.metadata, "SecuredAccess");
        changed |= ensure_owner_references(&mut current.metadata, &owners);
        if !changed {
            return Ok(());
        }

        let updated = self
            .backends
            .clients
            .secured_accesses
            .replace(&key.namespace, &current)
            .await?;
        self.definitions.insert(key.clone(), updated);
        Ok(())
    }

    /// Deletes a SecuredAccess created through [`Self::ensure`].
    pub async fn delete(&mut self, key: &ResourceKey) -> Result<(), Error> {
        if self.definitions.contains_key(key) {
            self.backends
                .clients
                .secured_accesses
                .delete(&key.namespace, &key.name)
                .await?;
            self.definitions.remove(key);
        }
        Ok(())
    }

    pub async fn secured_access_changed(
        &mut self,
        key: &ResourceKey,
        sa: Option<SecuredAccess>,
    ) -> Result<(), Error> {
        let Some(mut sa) = sa else {
            // Backend resources are removed through their owner references.
            self.definitions.remove(key);
            self.unresolved.remove(key);
            return Ok(());
        };
        if !self.backends.context.is_controlled(&key.namespace) {
            return Ok(());
        }

        if apply_metadata(&*self.backends.context, &mut sa.metadata, "SecuredAccess") {
            match self
                .backends
                .clients
                .secured_accesses
                .replace(&key.namespace, &sa)
                .await
            {
                Ok(updated) => sa = updated,
                Err(error) => warn!(%key, %error, "Failed to update SecuredAccess metadata"),
            }
        }
        self.definitions.insert(key.clone(), sa);
        self.reconcile(key).await
    }

    fn actual_access_type(&self, sa: &SecuredAccess) -> String {
        if sa.spec.access_type.is_empty() {
            self.default_access_type.clone()
        } else {
            sa.spec.access_type.clone()
        }
    }

    async fn reconcile(&mut self, key: &ResourceKey) -> Result<(), Error> {
        let Some(mut sa) = self.definitions.get(key).cloned() else {
            return Ok(());
        };
        let access_type = self.actual_access_type(&sa);

        let svc = match self.ensure_service(&sa, &access_type).await {
            Ok(svc) => svc,
            Err(error) => {
                warn!(%key, %error, "Failed to ensure Service");
                if sa.set_configured(Some(error.condition())) {
                    self.update_status(key, sa).await?;
                }
                return if error.is_retryable() { Err(error) } else { Ok(()) };
            }
        };

        let strategy = self
            .access_types
            .get(&access_type)
            .unwrap_or(&strategy::UNSUPPORTED);
        let (endpoints, resource_error) = match strategy
            .realise_and_resolve(&mut self.backends, &sa, &svc)
            .await
        {
            Ok(endpoints) => (endpoints, None),
            Err(error) => (Vec::new(), Some(error)),
        };
        if matches!(resource_error, Some(Error::GatewayUnresolved)) {
            if self.unresolved.insert(key.clone()) {
                debug!(%key, "Waiting for Gateway address");
            }
        } else {
            self.unresolved.remove(key);
        }

        let mut updated = false;
        if sa.set_resolved(endpoints) {
            if !sa.endpoints().is_empty() {
                info!(%key, endpoints = ?sa.endpoints(), "Resolved endpoints");
            }
            updated = true;
        }
        if sa.set_ca() {
            updated = true;
        }

        let certificate_error = self.ensure_certificate(&sa).await.err();
        let error = Error::join(resource_error.into_iter().chain(certificate_error));
        if sa.set_configured(error.as_ref().map(Error::condition)) {
            updated = true;
        }
        if updated {
            self.update_status(key, sa).await?;
        }

        match error {
            Some(error) if error.is_retryable() => Err(error),
            Some(error) => {
                debug!(%key, %error, "SecuredAccess not configured");
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn update_status(&mut self, key: &ResourceKey, sa: SecuredAccess) -> Result<(), Error> {
        let latest = self
            .backends
            .clients
            .secured_accesses
            .replace_status(&key.namespace, &sa)
            .await?;
        self.definitions.insert(key.clone(), latest);
        Ok(())
    }

    /// Maintains the server certificate when an issuer is configured.
    async fn ensure_certificate(&mut self, sa: &SecuredAccess) -> Result<(), Error> {
        if sa.spec.issuer.is_empty() {
            return Ok(());
        }
        let name = sa.name_any();
        let namespace = sa.namespace().unwrap_or_default();
        let certificate = if sa.spec.certificate.is_empty() {
            name.clone()
        } else {
            sa.spec.certificate.clone()
        };
        let request = LeafRequest {
            ca: sa.spec.issuer.clone(),
            subject: name.clone(),
            hosts: service_hosts(&name, &namespace, sa.endpoints()),
            client: false,
            server: true,
            certificate_controller: sa
                .spec
                .settings
                .get(SETTING_CERTIFICATE_CONTROLLER)
                .cloned(),
        };
        let owners = owner_reference(sa).into_iter().collect::<Vec<_>>();
        self.certificates
            .ensure(&ResourceKey::new(namespace, certificate), request, &owners)
            .await
    }

    async fn ensure_service(&mut self, sa: &SecuredAccess, access_type: &str) -> Result<Service, Error> {
        let key = ResourceKey::new(sa.namespace().unwrap_or_default(), sa.name_any());
        let service_type = strategy::service_type(access_type);

        let Some(mut svc) = self.backends.services.get(&key).cloned() else {
            return self.create_service(&key, sa, service_type).await;
        };
        let spec = svc.spec.get_or_insert_with(ServiceSpec::default);
        let mut changed = update_selector(spec, &sa.spec.selector);
        changed |= update_ports(spec, &sa.spec.ports);
        changed |= update_type(spec, service_type);
        changed |= apply_metadata(&*self.backends.context, &mut svc.metadata, "Service");
        if !changed {
            return Ok(svc);
        }

        let updated = self
            .backends
            .clients
            .services
            .replace(&key.namespace, &svc)
            .await?;
        info!(%key, "Updated Service");
        self.backends.services.insert(key, updated.clone());
        Ok(updated)
    }

    async fn create_service(
        &mut self,
        key: &ResourceKey,
        sa: &SecuredAccess,
        service_type: Option<&str>,
    ) -> Result<Service, Error> {
        let mut spec = ServiceSpec {
            selector: Some(sa.spec.selector.clone()).filter(|s| !s.is_empty()),
            type_: service_type.map(ToString::to_string),
            ..Default::default()
        };
        update_ports(&mut spec, &sa.spec.ports);
        let mut svc = Service {
            metadata: backends::backend_meta(sa, &key.name),
            spec: Some(spec),
            status: None,
        };
        apply_metadata(&*self.backends.context, &mut svc.metadata, "Service");

        let created = self
            .backends
            .clients
            .services
            .create(&key.namespace, &svc)
            .await?;
        info!(%key, "Created Service");
        self.backends.services.insert(key.clone(), created.clone());
        Ok(created)
    }

    /// Finds the SecuredAccess that a port-qualified backend resource was
    /// created for.
    fn definition_for_port_qualified(&self, key: &ResourceKey, access_type: &str) -> Option<ResourceKey> {
        port_qualified_splits(key)
            .find(|(candidate, port)| {
                self.definitions
                    .get(candidate)
                    .map(|sa| sa.spec.has_port(port) && self.actual_access_type(sa) == access_type)
                    .unwrap_or(false)
            })
            .map(|(candidate, _)| candidate)
    }

    pub async fn service_changed(&mut self, key: &ResourceKey, svc: Option<Service>) -> Result<(), Error> {
        let Some(svc) = svc else {
            self.backends.services.remove(key);
            if self.definitions.contains_key(key) {
                info!(%key, "Service deleted, recreating");
                return self.reconcile(key).await;
            }
            return Ok(());
        };
        if !self.definitions.contains_key(key) {
            if labels::can_delete(&svc.metadata) {
                info!(%key, "Deleting redundant Service");
                self.backends.clients.services.delete(&key.namespace, &key.name).await?;
            }
            return Ok(());
        }
        self.backends.services.insert(key.clone(), svc);
        self.reconcile(key).await
    }

    pub async fn route_changed(&mut self, key: &ResourceKey, route: Option<Route>) -> Result<(), Error> {
        let owner = self.definition_for_port_qualified(key, strategy::ROUTE);
        match route {
            None => {
                self.backends.routes.remove(key);
            }
            Some(route) => {
                let deletable = labels::can_delete(&route.metadata);
                self.backends.routes.insert(key.clone(), route);
                if owner.is_none() {
                    if deletable {
                        info!(%key, "Deleting redundant Route");
                        self.backends.clients.routes.delete(&key.namespace, &key.name).await?;
                    }
                    return Ok(());
                }
            }
        }
        match owner {
            Some(owner) => self.reconcile(&owner).await,
            None => Ok(()),
        }
    }

    pub async fn http_proxy_changed(
        &mut self,
        key: &ResourceKey,
        proxy: Option<HttpProxy>,
    ) -> Result<(), Error> {
        let owner = self.definition_for_port_qualified(key, strategy::CONTOUR_HTTP_PROXY);
        match proxy {
            None => {
                self.backends.http_proxies.remove(key);
            }
            Some(proxy) => {
                let deletable = labels::can_delete(&proxy.metadata);
                self.backends.http_proxies.insert(key.clone(), proxy);
                if owner.is_none() {
                    if deletable {
                        info!(%key, "Deleting redundant HTTPProxy");
                        self.backends
                            .clients
                            .http_proxies
                            .delete(&key.namespace, &key.name)
                            .await?;
                    }
                    return Ok(());
                }
            }
        }
        match owner {
            Some(owner) => self.reconcile(&owner).await,
            None => Ok(()),
        }
    }

    pub async fn tls_route_changed(
        &mut self,
        key: &ResourceKey,
        route: Option<TlsRoute>,
    ) -> Result<(), Error> {
        let owner = self.definition_for_port_qualified(key, GATEWAY);
        match route {
            None => {
                self.backends.tls_routes.remove(key);
            }
            Some(route) => {
                let deletable = labels::can_delete(&route.metadata);
                self.backends.tls_routes.insert(key.clone(), route);
                if owner.is_none() {
                    if deletable {
                        info!(%key, "Deleting redundant TLSRoute");
                        self.backends
                            .clients
                            .tls_routes
                            .delete(&key.namespace, &key.name)
                            .await?;
                    }
                    return Ok(());
                }
            }
        }
        match owner {
            Some(owner) => self.reconcile(&owner).await,
            None => Ok(()),
        }
    }

    pub async fn ingress_changed(&mut self, key: &ResourceKey, ingress: Option<Ingress>) -> Result<(), Error> {
        let owned = self
            .definitions
            .get(key)
            .map(|sa| self.actual_access_type(sa) == INGRESS_NGINX)
            .unwrap_or(false);
        match ingress {
            None => {
                self.backends.ingresses.remove(key);
            }
            Some(ingress) => {
                let deletable = labels::can_delete(&ingress.metadata);
                self.backends.ingresses.insert(key.clone(), ingress);
                if !owned {
                    if deletable {
                        info!(%key, "Deleting redundant Ingress");
                        self.backends.clients.ingresses.delete(&key.namespace, &key.name).await?;
                    }
                    return Ok(());
                }
            }
        }
        if owned {
            return self.reconcile(key).await;
        }
        Ok(())
    }

    /// Keeps the shared Gateway applied and replays SecuredAccesses that were
    /// waiting for its address.
    pub async fn gateway_changed(&mut self, key: &ResourceKey, gateway: Option<Gateway>) -> Result<(), Error> {
        let Some(AccessType::Gateway(access)) = self.access_types.get(GATEWAY) else {
            return Ok(());
        };
        if *key != access.key() {
            return Ok(());
        }
        let access = access.clone();
        self.backends.gateway = gateway;
        access.ensure_gateway(&mut self.backends).await?;
        self.replay_unresolved(&access).await
    }

    async fn replay_unresolved(&mut self, access: &strategy::GatewayAccess) -> Result<(), Error> {
        if self.unresolved.is_empty() {
            return Ok(());
        }
        let Some(domain) = access.base_domain(&self.backends) else {
            return Ok(());
        };
        let parked = std::mem::take(&mut self.unresolved);
        info!(%domain, count = parked.len(), "Gateway resolved, reconciling waiting SecuredAccesses");
        let mut errors = Vec::new();
        for key in parked {
            if let Err(error) = self.reconcile(&key).await {
                errors.push(error);
            }
        }
        Error::join(errors).map_or(Ok(()), Err)
    }

    /// Loads the backend resources that already exist.
    pub fn recover_backends(&mut self, caches: &BackendCaches) {
        fn load<K: Clone + kube::Resource>(
            cache: Option<&Cache<K>>,
            into: &mut AHashMap<ResourceKey, K>,
        ) {
            for resource in cache.map(Cache::list).unwrap_or_default() {
                if let Some(key) = ResourceKey::of(&resource) {
                    into.insert(key, resource);
                }
            }
        }
        load(Some(&caches.services), &mut self.backends.services);
        load(caches.routes.as_ref(), &mut self.backends.routes);
        load(Some(&caches.ingresses), &mut self.backends.ingresses);
        load(caches.http_proxies.as_ref(), &mut self.backends.http_proxies);
        load(caches.tls_routes.as_ref(), &mut self.backends.tls_routes);

        if let (Some(AccessType::Gateway(access)), Some(gateways)) =
            (self.access_types.get(GATEWAY), caches.gateways.as_ref())
        {
            self.backends.gateway = gateways.get(&access.key());
        }
        debug!(
            services = self.backends.services.len(),
            routes = self.backends.routes.len(),
            ingresses = self.backends.ingresses.len(),
            http_proxies = self.backends.http_proxies.len(),
            tls_routes = self.backends.tls_routes.len(),
            "Recovered backend resources"
        );
    }

    /// Ensures the shared Gateway and reconciles every known SecuredAccess.
    pub async fn recover(&mut self, secured_accesses: &Cache<SecuredAccess>) {
        if let Some(AccessType::Gateway(access)) = self.access_types.get(GATEWAY) {
            let access = access.clone();
            if let Err(error) = access.ensure_gateway(&mut self.backends).await {
                warn!(%error, "Failed to ensure Gateway");
            }
        }
        for sa in secured_accesses.list() {
            let Some(key) = ResourceKey::of(&sa) else {
                continue;
            };
            if let Err(error) = self.secured_access_changed(&key, Some(sa)).await {
                warn!(%key, %error, "Failed to recover SecuredAccess");
            }
        }
    }
}

impl std::fmt::Debug for SecuredAccessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecuredAccessManager")
            .field("default_access_type", &self.default_access_type)
            .field("definitions", &self.definitions.len())
            .field("unresolved", &self.unresolved.len())
            .finish_non_exhaustive()
    }
}

/// The watch caches of the backend kinds. Kinds whose API is not installed
/// are not watched.
#[derive(Clone)]
pub struct BackendCaches {
    pub services: Cache<Service>,
    pub ingresses: Cache<Ingress>,
    pub routes: Option<Cache<Route>>,
    pub http_proxies: Option<Cache<HttpProxy>>,
    pub tls_routes: Option<Cache<TlsRoute>>,
    pub gateways: Option<Cache<Gateway>>,
}

/// Replaces the owner references with `owners`, keyed by UID.
fn ensure_owner_references(meta: &mut ObjectMeta, owners: &[OwnerReference]) -> bool {
    let mut wanted = owners
        .iter()
        .map(|o| (o.uid.as_str(), o))
        .collect::<AHashMap<_, _>>();
    let current = meta.owner_references.take().unwrap_or_default();
    let before = current.len();

    let mut refs = current
        .into_iter()
        .filter(|r| wanted.remove(r.uid.as_str()).is_some())
        .collect::<Vec<_>>();
    let mut changed = refs.len() != before;
    for owner in owners {
        if wanted.remove(owner.uid.as_str()).is_some() {
            refs.push(owner.clone());
            changed = true;
        }
    }
    meta.owner_references = Some(refs).filter(|r| !r.is_empty());
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(name: &str, uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "skupper.io/v2alpha1".to_string(),
            kind: "Site".to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn owner_references_are_replaced_by_uid() {
        let mut meta = ObjectMeta {
            owner_references: Some(vec![owner("a", "1"), owner("b", "2")]),
            ..Default::default()
        };
        assert!(!ensure_owner_references(
            &mut meta,
            &[owner("a", "1"), owner("b", "2")]
        ));

        assert!(ensure_owner_references(
            &mut meta,
            &[owner("b", "2"), owner("c", "3")]
        ));
        assert_eq!(
            meta.owner_references,
            Some(vec![owner("b", "2"), owner("c", "3")])
        );

        assert!(ensure_owner_references(&mut meta, &[]));
        assert_eq!(meta.owner_references, None);
    }
}
