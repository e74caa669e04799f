mod certificates;

use crate::{
    certificates::{CertificateManager, IssueError, IssueRequest, Issuer, KeyPair, ParsedCertificate},
    client::{Clients, ResourceApi},
    context::StaticContext,
    core::ResourceKey,
    k8s::{
        Certificate, Gateway, HttpProxy, Ingress, Resource, Route, Secret, SecuredAccess, Service,
        TlsRoute,
    },
    Error,
};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// An in-memory API server for one kind.
///
/// Resource versions are checked on replace so that writes based on stale
/// state are rejected the way the API server rejects them.
pub(crate) struct FakeApi<K> {
    items: Mutex<AHashMap<ResourceKey, K>>,
    actions: Mutex<Vec<String>>,
    versions: AtomicU64,
}

/// Every API the managers write to, shared with the [`Clients`] under test.
pub(crate) struct Fakes {
    pub certificates: Arc<FakeApi<Certificate>>,
    pub secrets: Arc<FakeApi<Secret>>,
    pub secured_accesses: Arc<FakeApi<SecuredAccess>>,
    pub services: Arc<FakeApi<Service>>,
    pub routes: Arc<FakeApi<Route>>,
    pub ingresses: Arc<FakeApi<Ingress>>,
    pub http_proxies: Arc<FakeApi<HttpProxy>>,
    pub tls_routes: Arc<FakeApi<TlsRoute>>,
    pub gateways: Arc<FakeApi<Gateway>>,
}

/// Issues "certificates" that are JSON documents of the parsed fields.
#[derive(Debug, Default)]
pub(crate) struct FakeIssuer;

// === impl FakeApi ===

impl<K> FakeApi<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn new() -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(AHashMap::default()),
            actions: Mutex::new(Vec::new()),
            versions: AtomicU64::new(1),
        })
    }

    pub fn get_item(&self, namespace: &str, name: &str) -> Option<K> {
        self.items.lock().get(&ResourceKey::new(namespace, name)).cloned()
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.get_item(namespace, name).is_some()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Writes a resource directly, as another client would.
    pub fn seed(&self, mut resource: K) -> K {
        let key = ResourceKey::of(&resource).expect("seeded resources must have a key");
        self.stamp(&mut resource);
        self.items.lock().insert(key, resource.clone());
        resource
    }

    /// Removes a resource directly, as another client would.
    pub fn remove(&self, namespace: &str, name: &str) -> Option<K> {
        self.items.lock().remove(&ResourceKey::new(namespace, name))
    }

    /// The writes made through the API, as `verb namespace/name`.
    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().clone()
    }

    pub fn clear_actions(&self) {
        self.actions.lock().clear();
    }

    fn record(&self, verb: &str, namespace: &str, name: &str) {
        self.actions.lock().push(format!("{verb} {namespace}/{name}"));
    }

    fn stamp(&self, resource: &mut K) {
        let version = self.versions.fetch_add(1, Ordering::SeqCst);
        let meta = resource.meta_mut();
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{version}"));
        }
        meta.resource_version = Some(version.to_string());
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }

    fn update(&self, verb: &str, namespace: &str, resource: &K) -> Result<K, Error> {
        let name = resource.meta().name.clone().unwrap_or_default();
        let key = ResourceKey::new(namespace, &name);
        self.record(verb, namespace, &name);

        let mut items = self.items.lock();
        let Some(current) = items.get(&key) else {
            return Err(not_found(&key));
        };
        if let Some(rv) = resource.meta().resource_version.as_ref() {
            if current.meta().resource_version.as_ref() != Some(rv) {
                return Err(Error::Conflict {
                    kind: Self::kind(),
                    key: key.to_string(),
                });
            }
        }
        let mut updated = resource.clone();
        updated.meta_mut().uid = current.meta().uid.clone();
        self.stamp(&mut updated);
        items.insert(key, updated.clone());
        Ok(updated)
    }
}

fn not_found(key: &ResourceKey) -> Error {
    Error::Kube(kube::Error::Api(crate::k8s::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{key} not found"),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

#[async_trait::async_trait]
impl<K> ResourceApi<K> for FakeApi<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, Error> {
        Ok(self.get_item(namespace, name))
    }

    async fn create(&self, namespace: &str, resource: &K) -> Result<K, Error> {
        let name = resource.meta().name.clone().unwrap_or_default();
        let key = ResourceKey::new(namespace, &name);
        self.record("create", namespace, &name);

        let mut items = self.items.lock();
        if items.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: Self::kind(),
                key: key.to_string(),
            });
        }
        let mut created = resource.clone();
        created.meta_mut().namespace = Some(namespace.to_string());
        self.stamp(&mut created);
        items.insert(key, created.clone());
        Ok(created)
    }

    async fn replace(&self, namespace: &str, resource: &K) -> Result<K, Error> {
        self.update("replace", namespace, resource)
    }

    async fn replace_status(&self, namespace: &str, resource: &K) -> Result<K, Error> {
        self.update("status", namespace, resource)
    }

    async fn apply(&self, namespace: &str, resource: &K) -> Result<K, Error> {
        let name = resource.meta().name.clone().unwrap_or_default();
        let key = ResourceKey::new(namespace, &name);
        self.record("apply", namespace, &name);

        let mut items = self.items.lock();
        let mut applied = resource.clone();
        applied.meta_mut().namespace = Some(namespace.to_string());
        if let Some(current) = items.get(&key) {
            applied.meta_mut().uid = current.meta().uid.clone();
        }
        self.stamp(&mut applied);
        items.insert(key, applied.clone());
        Ok(applied)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.record("delete", namespace, name);
        self.items.lock().remove(&ResourceKey::new(namespace, name));
        Ok(())
    }
}

// === impl Fakes ===

impl Fakes {
    pub fn new() -> Self {
        Self {
            certificates: FakeApi::new(),
            secrets: FakeApi::new(),
            secured_accesses: FakeApi::new(),
            services: FakeApi::new(),
            routes: FakeApi::new(),
            ingresses: FakeApi::new(),
            http_proxies: FakeApi::new(),
            tls_routes: FakeApi::new(),
            gateways: FakeApi::new(),
        }
    }

    pub fn clients(&self) -> Clients {
        Clients {
            certificates: self.certificates.clone(),
            secrets: self.secrets.clone(),
            secured_accesses: self.secured_accesses.clone(),
            services: self.services.clone(),
            routes: self.routes.clone(),
            ingresses: self.ingresses.clone(),
            http_proxies: self.http_proxies.clone(),
            tls_routes: self.tls_routes.clone(),
            gateways: self.gateways.clone(),
        }
    }

    pub fn certificate_manager(&self) -> CertificateManager {
        CertificateManager::new(
            self.clients(),
            Arc::new(StaticContext::new("skupper", None)),
            Arc::new(FakeIssuer),
            None,
        )
    }
}

// === impl FakeIssuer ===

impl Issuer for FakeIssuer {
    fn issue(&self, request: &IssueRequest<'_>) -> Result<KeyPair, IssueError> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let parsed = ParsedCertificate {
            subject: request.subject.to_string(),
            dns_names: request.hosts.to_vec(),
            ip_addresses: Vec::new(),
            not_after: now + request.validity.as_secs() as i64,
        };
        let cert_pem =
            serde_json::to_string(&parsed).map_err(|e| IssueError::Decode(e.to_string()))?;
        let ca_pem = match request.ca {
            Some(ca) => ca.cert_pem.clone(),
            None => cert_pem.clone(),
        };
        Ok(KeyPair {
            cert_pem,
            key_pem: format!("key for {}", request.subject),
            ca_pem,
        })
    }

    fn decode(&self, cert_pem: &[u8]) -> Result<ParsedCertificate, IssueError> {
        serde_json::from_slice(cert_pem).map_err(|e| IssueError::Decode(e.to_string()))
    }
}

pub(crate) fn key(namespace: &str, name: &str) -> ResourceKey {
    ResourceKey::new(namespace, name)
}
