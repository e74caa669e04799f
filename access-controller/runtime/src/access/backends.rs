use crate::{
    client::{Clients, SharedApi},
    context::{apply_metadata, ControllerContext},
    core::ResourceKey,
    k8s::{
        labels, owner_reference, Gateway, HttpProxy, Ingress, ObjectMeta, Resource, ResourceExt,
        Route, SecuredAccess, Service, TlsRoute,
    },
    Error,
};
use ahash::{AHashMap, AHashSet};
use std::sync::Arc;
use tracing::info;

/// The backend resources known to the SecuredAccess manager, together with
/// the means to write them.
pub struct Backends {
    pub(crate) clients: Clients,
    pub(crate) context: Arc<dyn ControllerContext>,
    pub(crate) services: AHashMap<ResourceKey, Service>,
    pub(crate) routes: AHashMap<ResourceKey, Route>,
    pub(crate) ingresses: AHashMap<ResourceKey, Ingress>,
    pub(crate) http_proxies: AHashMap<ResourceKey, HttpProxy>,
    pub(crate) tls_routes: AHashMap<ResourceKey, TlsRoute>,
    pub(crate) gateway: Option<Gateway>,
}

// === impl Backends ===

impl Backends {
    pub(crate) fn new(clients: Clients, context: Arc<dyn ControllerContext>) -> Self {
        Self {
            clients,
            context,
            services: AHashMap::default(),
            routes: AHashMap::default(),
            ingresses: AHashMap::default(),
            http_proxies: AHashMap::default(),
            tls_routes: AHashMap::default(),
            gateway: None,
        }
    }
}

/// Metadata for a backend resource created on behalf of `sa`.
pub(crate) fn backend_meta(sa: &SecuredAccess, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: sa.namespace(),
        labels: Some(labels::secured_access_labels()),
        annotations: Some(labels::controlled_annotations()),
        owner_references: owner_reference(sa).map(|o| vec![o]),
        ..Default::default()
    }
}

/// Creates `desired` if the resource is unknown, otherwise lets `update`
/// bring the known resource in line and writes it if anything changed.
pub(crate) async fn upsert<K>(
    api: &SharedApi<K>,
    cache: &mut AHashMap<ResourceKey, K>,
    context: &dyn ControllerContext,
    key: &ResourceKey,
    desired: K,
    update: impl FnOnce(&mut K) -> Result<bool, Error>,
) -> Result<K, Error>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync,
{
    let kind = K::kind(&()).to_string();

    if let Some(existing) = cache.get(key) {
        let mut current = existing.clone();
        let mut changed = update(&mut current)?;
        changed |= apply_metadata(context, current.meta_mut(), &kind);
        if !changed {
            return Ok(current);
        }
        let updated = api.replace(&key.namespace, &current).await?;
        info!(%key, %kind, "Updated");
        cache.insert(key.clone(), updated.clone());
        return Ok(updated);
    }

    let mut desired = desired;
    apply_metadata(context, desired.meta_mut(), &kind);
    let created = api.create(&key.namespace, &desired).await?;
    info!(%key, %kind, "Created");
    cache.insert(key.clone(), created.clone());
    Ok(created)
}

/// Deletes resources created for `sa` that are no longer desired.
pub(crate) async fn remove_stale<K>(
    api: &SharedApi<K>,
    cache: &mut AHashMap<ResourceKey, K>,
    sa: &SecuredAccess,
    desired: &AHashSet<ResourceKey>,
) -> Result<(), Error>
where
    K: Resource<DynamicType = ()> + Send + Sync,
{
    let Some(uid) = sa.metadata.uid.as_deref() else {
        return Ok(());
    };
    let namespace = sa.namespace().unwrap_or_default();
    let stale = cache
        .iter()
        .filter(|(key, resource)| {
            key.namespace == namespace
                && !desired.contains(*key)
                && is_owned_by(resource.meta(), uid)
                && labels::can_delete(resource.meta())
        })
        .map(|(key, _)| key.clone())
        .collect::<Vec<_>>();

    for key in stale {
        api.delete(&key.namespace, &key.name).await?;
        cache.remove(&key);
        info!(%key, kind = %K::kind(&()), "Deleted redundant");
    }
    Ok(())
}

fn is_owned_by(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|o| o.uid == uid)
}
