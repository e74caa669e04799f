//! Keeps Certificates and the TLS Secrets issued for them in step.
//!
//! A Certificate may be requested by several owners (for example, several
//! SecuredAccess resources sharing one server certificate). Each owner's host
//! claims are recorded on the Certificate so that hosts can be added and
//! removed per owner without losing the claims of the others.

mod issuer;

pub use self::issuer::{IssueError, IssueRequest, Issuer, KeyPair, ParsedCertificate, RcgenIssuer};

use crate::{
    client::Clients,
    context::{apply_metadata, ControllerContext},
    core::{OwnerHosts, ResourceKey},
    k8s::{
        certificate::SETTING_DURATION,
        duration::GoDuration,
        labels::{self, Map},
        owner_reference,
        status::ConditionState,
        ByteString, Certificate, CertificateSpec, ObjectMeta, OwnerReference, Secret, API_VERSION,
    },
    watch::Cache,
    Error,
};
use ahash::{AHashMap, AHashSet};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Validity of issued certificates when no duration is configured.
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(5 * 365 * 24 * 60 * 60);

pub const TLS_CERT: &str = "tls.crt";
pub const TLS_KEY: &str = "tls.key";
pub const CA_CERT: &str = "ca.crt";

/// A request for a leaf certificate signed by `ca`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeafRequest {
    pub ca: String,
    pub subject: String,
    pub hosts: Vec<String>,
    pub client: bool,
    pub server: bool,
    /// An external controller that issues the secret instead of this one.
    pub certificate_controller: Option<String>,
}

pub struct CertificateManager {
    clients: Clients,
    context: Arc<dyn ControllerContext>,
    issuer: Arc<dyn Issuer>,
    certificate_controller: Option<String>,
    definitions: AHashMap<ResourceKey, Certificate>,
    secrets: AHashMap<ResourceKey, Secret>,
    delegated: AHashSet<ResourceKey>,
}

// === impl CertificateManager ===

impl CertificateManager {
    pub fn new(
        clients: Clients,
        context: Arc<dyn ControllerContext>,
        issuer: Arc<dyn Issuer>,
        certificate_controller: Option<String>,
    ) -> Self {
        Self {
            clients,
            context,
            issuer,
            certificate_controller: certificate_controller.filter(|c| !c.is_empty()),
            definitions: AHashMap::default(),
            secrets: AHashMap::default(),
            delegated: AHashSet::default(),
        }
    }

    pub fn definition(&self, key: &ResourceKey) -> Option<&Certificate> {
        self.definitions.get(key)
    }

    pub fn secret(&self, key: &ResourceKey) -> Option<&Secret> {
        self.secrets.get(key)
    }

    /// Ensures a signing certificate exists.
    pub async fn ensure_ca(
        &mut self,
        key: &ResourceKey,
        subject: &str,
        owners: &[OwnerReference],
    ) -> Result<(), Error> {
        let spec = CertificateSpec {
            subject: subject.to_string(),
            signing: true,
            ..Default::default()
        };
        self.ensure_spec(key, spec, owners).await
    }

    /// Ensures a leaf certificate exists with at least the requested hosts
    /// for each owner.
    pub async fn ensure(
        &mut self,
        key: &ResourceKey,
        request: LeafRequest,
        owners: &[OwnerReference],
    ) -> Result<(), Error> {
        let mut spec = CertificateSpec {
            ca: request.ca,
            subject: request.subject,
            hosts: request.hosts,
            client: request.client,
            server: request.server,
            ..Default::default()
        };
        spec.set_certificate_controller(request.certificate_controller.as_deref());
        self.ensure_spec(key, spec, owners).await
    }

    async fn ensure_spec(
        &mut self,
        key: &ResourceKey,
        mut spec: CertificateSpec,
        owners: &[OwnerReference],
    ) -> Result<(), Error> {
        let Some(mut current) = self.definitions.get(key).cloned() else {
            return self.create(key, spec, owners).await;
        };

        let mut records = OwnerHosts::from_annotations(current.metadata.annotations.as_ref());
        if !records.is_controlled() {
            return Err(Error::NotControlled(key.name.clone()));
        }

        let mut changed = merge_owner_references(&mut current.metadata, owners);

        let mut hosts = current.spec.hosts.clone();
        if owners.is_empty() {
            hosts = records.claim(&hosts, None, &spec.hosts);
        }
        for owner in owners {
            hosts = records.claim(&hosts, Some(owner.uid.as_str()), &spec.hosts);
        }
        changed |= records.write(current.metadata.annotations.get_or_insert_with(Map::new));

        let owner_count = current.metadata.owner_references.as_ref().map_or(0, Vec::len);
        if owner_count > 1 && spec.subject != current.spec.subject {
            warn!(
                %key,
                requested = %spec.subject,
                current = %current.spec.subject,
                "Certificate is shared; keeping its subject"
            );
            spec.subject = current.spec.subject.clone();
        }
        spec.hosts = hosts;

        if !equivalent(&spec, &current.spec) {
            current.spec = spec;
            changed = true;
        }
        changed |= apply_metadata(&*self.context, &mut current.metadata, "Certificate");
        if !changed {
            return Ok(());
        }

        self.load_latest_version(key, &mut current).await;
        match self.clients.certificates.replace(&key.namespace, &current).await {
            Ok(updated) => {
                info!(%key, hosts = ?updated.spec.hosts, "Updated Certificate");
                self.definitions.insert(key.clone(), updated);
                Ok(())
            }
            Err(error @ Error::Conflict { .. }) => {
                if let Ok(Some(latest)) = self.clients.certificates.get(&key.namespace, &key.name).await {
                    self.definitions.insert(key.clone(), latest);
                }
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    async fn create(
        &mut self,
        key: &ResourceKey,
        mut spec: CertificateSpec,
        owners: &[OwnerReference],
    ) -> Result<(), Error> {
        let mut seen = AHashSet::new();
        spec.hosts.retain(|h| seen.insert(h.clone()));

        let mut annotations = Map::new();
        OwnerHosts::new(owners.iter().map(|o| o.uid.as_str()), &spec.hosts).write(&mut annotations);

        let mut cert = Certificate::new(&key.name, spec);
        cert.metadata.namespace = Some(key.namespace.clone());
        cert.metadata.owner_references = Some(owners.to_vec()).filter(|o| !o.is_empty());
        cert.metadata.labels = Some(Map::from([(labels::CERTIFICATE.to_string(), "true".to_string())]));
        cert.metadata.annotations = Some(annotations);
        apply_metadata(&*self.context, &mut cert.metadata, "Certificate");

        let created = match self.clients.certificates.create(&key.namespace, &cert).await {
            Ok(created) => {
                info!(%key, "Created Certificate");
                created
            }
            Err(error @ Error::AlreadyExists { .. }) => {
                debug!(%key, "Certificate already exists, loading latest");
                match self.clients.certificates.get(&key.namespace, &key.name).await? {
                    Some(latest) => latest,
                    None => return Err(error),
                }
            }
            Err(error) => return Err(error),
        };
        self.definitions.insert(key.clone(), created);
        Ok(())
    }

    /// Copies the live resource version onto a certificate that is also
    /// written by an external controller.
    async fn load_latest_version(&self, key: &ResourceKey, cert: &mut Certificate) {
        if self.controller_for(&cert.spec).is_none() {
            return;
        }
        match self.clients.certificates.get(&key.namespace, &key.name).await {
            Ok(Some(latest)) => {
                if latest.metadata.resource_version != cert.metadata.resource_version {
                    cert.metadata.resource_version = latest.metadata.resource_version;
                    cert.metadata.generation = latest.metadata.generation;
                }
            }
            Ok(None) => {}
            Err(error) => debug!(%key, %error, "Failed to load latest Certificate"),
        }
    }

    pub async fn certificate_changed(
        &mut self,
        key: &ResourceKey,
        cert: Option<Certificate>,
    ) -> Result<(), Error> {
        let Some(mut cert) = cert else {
            return self.certificate_deleted(key).await;
        };
        if !self.context.is_controlled(&key.namespace) {
            return Ok(());
        }

        let mut records = OwnerHosts::from_annotations(cert.metadata.annotations.as_ref());
        if records.is_controlled() {
            let live = cert
                .metadata
                .owner_references
                .iter()
                .flatten()
                .map(|o| o.uid.as_str())
                .collect::<Vec<_>>();
            let hosts = records.prune(&cert.spec.hosts, live);
            let mut annotations = cert.metadata.annotations.clone().unwrap_or_default();
            if records.write(&mut annotations) {
                cert.metadata.annotations = Some(annotations);
                cert.spec.hosts = hosts;
                let updated = self.clients.certificates.replace(&key.namespace, &cert).await?;
                info!(%key, hosts = ?updated.spec.hosts, "Removed hosts of departed owners");
                self.definitions.insert(key.clone(), updated);
                return Ok(());
            }
        }

        self.reconcile_secret(key, cert).await
    }

    async fn certificate_deleted(&mut self, key: &ResourceKey) -> Result<(), Error> {
        self.definitions.remove(key);
        self.delegated.remove(key);
        if self.secrets.contains_key(key) {
            self.clients.secrets.delete(&key.namespace, &key.name).await?;
            self.secrets.remove(key);
            info!(%key, "Deleted Secret of deleted Certificate");
        }
        Ok(())
    }

    pub async fn secret_changed(&mut self, key: &ResourceKey, secret: Option<Secret>) -> Result<(), Error> {
        let Some(secret) = secret else {
            self.secrets.remove(key);
            if let Some(cert) = self.definitions.get(key).cloned() {
                info!(%key, "Secret deleted, reissuing");
                return self.reconcile_secret(key, cert).await;
            }
            return Ok(());
        };
        if !self.context.is_controlled(&key.namespace) {
            return Ok(());
        }
        self.secrets.insert(key.clone(), secret);

        let mut errors = Vec::new();
        if let Some(cert) = self.definitions.get(key).cloned() {
            if let Err(error) = self.reconcile_secret(key, cert).await {
                errors.push(error);
            }
        }

        // Leaf certificates that were waiting for this CA.
        let waiting = self
            .definitions
            .iter()
            .filter(|(k, c)| {
                k.namespace == key.namespace
                    && !c.spec.signing
                    && c.spec.ca == key.name
                    && !is_ready(c)
            })
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect::<Vec<_>>();
        for (dependent, cert) in waiting {
            debug!(ca = %key, certificate = %dependent, "CA available");
            if let Err(error) = self.reconcile_secret(&dependent, cert).await {
                errors.push(error);
            }
        }
        Error::join(errors).map_or(Ok(()), Err)
    }

    /// Loads existing secrets and reconciles every known certificate.
    pub async fn recover(&mut self, secrets: &Cache<Secret>, certificates: &Cache<Certificate>) {
        for secret in secrets.list() {
            if let Some(key) = ResourceKey::of(&secret) {
                if self.context.is_controlled(&key.namespace) {
                    self.secrets.insert(key, secret);
                }
            }
        }
        for cert in certificates.list() {
            let Some(key) = ResourceKey::of(&cert) else {
                continue;
            };
            if let Err(error) = self.certificate_changed(&key, Some(cert)).await {
                warn!(%key, %error, "Failed to recover Certificate");
            }
        }
    }

    fn controller_for<'a>(&'a self, spec: &'a CertificateSpec) -> Option<&'a str> {
        self.certificate_controller
            .as_deref()
            .or_else(|| spec.certificate_controller())
    }

    /// Returns true if the secret for `cert` is issued by another controller.
    fn ensure_delegated(&mut self, key: &ResourceKey, cert: &Certificate) -> bool {
        match self.controller_for(&cert.spec).map(ToString::to_string) {
            Some(controller) => {
                if self.delegated.insert(key.clone()) {
                    info!(%key, %controller, "Certificate is issued by another controller");
                }
                true
            }
            None => {
                if self.delegated.remove(key) {
                    info!(%key, "Certificate is no longer delegated");
                }
                false
            }
        }
    }

    async fn reconcile_secret(&mut self, key: &ResourceKey, mut cert: Certificate) -> Result<(), Error> {
        if self.ensure_delegated(key, &cert) {
            self.definitions.insert(key.clone(), cert);
            return Ok(());
        }

        let result = match self.secrets.get(key).cloned() {
            Some(secret) => self.update_secret(key, &cert, secret).await,
            None => self.create_secret(key, &cert).await,
        };

        let state = match &result {
            Ok(_) => ConditionState::ready(),
            Err(error) => {
                debug!(%key, %error, "Secret not reconciled");
                error.condition()
            }
        };
        let mut changed = cert.set_ready(state);
        if let Ok(expiration) = &result {
            changed |= cert.set_expiration(expiration.clone());
        }
        if changed {
            cert = self.clients.certificates.replace_status(&key.namespace, &cert).await?;
        }
        self.definitions.insert(key.clone(), cert);

        match result {
            Err(error) if error.is_retryable() => Err(error),
            _ => Ok(()),
        }
    }

    /// Returns the expiration of the secret's certificate.
    async fn update_secret(
        &mut self,
        key: &ResourceKey,
        cert: &Certificate,
        mut secret: Secret,
    ) -> Result<String, Error> {
        let controlled = is_secret_controlled(&secret);
        let mut changed = false;

        let expiration = match self.validate(cert, &secret) {
            Some(parsed) => parsed.expiration(),
            None => {
                if !controlled {
                    return Err(Error::SecretNotControlled);
                }
                let (data, parsed) = self.generate(key, cert)?;
                secret.data = Some(data);
                secret
                    .metadata
                    .annotations
                    .get_or_insert_with(Map::new)
                    .insert(labels::HOSTS.to_string(), cert.spec.hosts.join(","));
                changed = true;
                info!(%key, "Regenerating Secret");
                parsed.expiration()
            }
        };
        if controlled {
            changed |= apply_metadata(&*self.context, &mut secret.metadata, "Secret");
        }
        if changed {
            let updated = self.clients.secrets.replace(&key.namespace, &secret).await?;
            self.secrets.insert(key.clone(), updated);
        }
        Ok(expiration)
    }

    async fn create_secret(&mut self, key: &ResourceKey, cert: &Certificate) -> Result<String, Error> {
        let (data, parsed) = self.generate(key, cert)?;
        let mut annotations = labels::controlled_annotations();
        annotations.insert(labels::CERTIFICATE.to_string(), "true".to_string());
        annotations.insert(labels::HOSTS.to_string(), cert.spec.hosts.join(","));
        let mut secret = Secret {
            metadata: ObjectMeta {
                name: Some(key.name.clone()),
                namespace: Some(key.namespace.clone()),
                owner_references: owner_reference(cert).map(|o| vec![o]),
                annotations: Some(annotations),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        apply_metadata(&*self.context, &mut secret.metadata, "Secret");

        let created = self.clients.secrets.create(&key.namespace, &secret).await?;
        info!(%key, "Created Secret");
        self.secrets.insert(key.clone(), created);
        Ok(parsed.expiration())
    }

    fn generate(
        &self,
        key: &ResourceKey,
        cert: &Certificate,
    ) -> Result<(BTreeMap<String, ByteString>, ParsedCertificate), Error> {
        let validity = match cert.spec.settings.get(SETTING_DURATION) {
            Some(duration) => duration.parse::<GoDuration>()?.as_duration(),
            None => DEFAULT_VALIDITY,
        };

        let ca = if cert.spec.signing {
            None
        } else {
            let ca_key = key.sibling(&cert.spec.ca);
            let secret = self
                .secrets
                .get(&ca_key)
                .ok_or_else(|| Error::CaNotFound(ca_key.to_string()))?;
            Some(key_pair(secret))
        };
        let hosts = if cert.spec.signing {
            &[][..]
        } else {
            cert.spec.hosts.as_slice()
        };

        let pair = self.issuer.issue(&IssueRequest {
            subject: &cert.spec.subject,
            hosts,
            validity,
            client: cert.spec.client,
            server: cert.spec.server,
            signing: cert.spec.signing,
            ca: ca.as_ref(),
        })?;
        let parsed = self.issuer.decode(pair.cert_pem.as_bytes())?;

        let data = BTreeMap::from([
            (TLS_CERT.to_string(), ByteString(pair.cert_pem.into_bytes())),
            (TLS_KEY.to_string(), ByteString(pair.key_pem.into_bytes())),
            (CA_CERT.to_string(), ByteString(pair.ca_pem.into_bytes())),
        ]);
        Ok((data, parsed))
    }

    /// Returns the parsed certificate if the secret still satisfies `cert`.
    fn validate(&self, cert: &Certificate, secret: &Secret) -> Option<ParsedCertificate> {
        let pem = secret.data.as_ref()?.get(TLS_CERT)?;
        let parsed = match self.issuer.decode(&pem.0) {
            Ok(parsed) => parsed,
            Err(error) => {
                debug!(%error, "Secret holds an undecodable certificate");
                return None;
            }
        };
        if parsed.is_expired(time::OffsetDateTime::now_utc().unix_timestamp()) {
            return None;
        }
        if parsed.subject != cert.spec.subject {
            return None;
        }
        let desired = cert
            .spec
            .hosts
            .iter()
            .filter(|h| !h.is_empty())
            .cloned()
            .collect::<std::collections::BTreeSet<_>>();
        if parsed.hosts() != desired {
            return None;
        }
        Some(parsed)
    }
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("certificate_controller", &self.certificate_controller)
            .field("definitions", &self.definitions.len())
            .field("secrets", &self.secrets.len())
            .finish_non_exhaustive()
    }
}

/// Adds owners whose UID is not referenced yet, or whose reference differs.
fn merge_owner_references(meta: &mut ObjectMeta, owners: &[OwnerReference]) -> bool {
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    let mut changed = false;
    for owner in owners {
        if !refs.contains(owner) {
            refs.push(owner.clone());
            changed = true;
        }
    }
    if refs.is_empty() {
        meta.owner_references = None;
    }
    changed
}

/// Specs are compared ignoring host order.
fn equivalent(a: &CertificateSpec, b: &CertificateSpec) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    a.hosts.sort();
    b.hosts.sort();
    a == b
}

fn is_ready(cert: &Certificate) -> bool {
    cert.status
        .as_ref()
        .map(|s| s.status.is_condition_true(crate::k8s::status::CONDITION_READY))
        .unwrap_or(false)
}

fn is_secret_controlled(secret: &Secret) -> bool {
    labels::is_controlled(&secret.metadata)
        || secret
            .metadata
            .owner_references
            .iter()
            .flatten()
            .any(|o| o.kind == "Certificate" && o.api_version == API_VERSION)
}

fn key_pair(secret: &Secret) -> KeyPair {
    let field = |name: &str| {
        secret
            .data
            .as_ref()
            .and_then(|d| d.get(name))
            .map(|b| String::from_utf8_lossy(&b.0).into_owned())
            .unwrap_or_default()
    };
    KeyPair {
        cert_pem: field(TLS_CERT),
        key_pem: field(TLS_KEY),
        ca_pem: field(CA_CERT),
    }
}
