use crate::{
    core::{ResourceKey, CONTROLLER_NAME},
    k8s::{
        Api, Certificate, Client, ErrorResponse, Gateway, HttpProxy, Ingress, Patch, PatchParams,
        PostParams, Resource, Route, Secret, SecuredAccess, Service, TlsRoute,
    },
    Error,
};
use k8s_openapi::NamespaceResourceScope;
use kube::api::DeleteParams;
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt, marker::PhantomData, sync::Arc};

/// Writes to the cluster for one kind of namespaced resource.
#[async_trait::async_trait]
pub trait ResourceApi<K>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, Error>;

    async fn create(&self, namespace: &str, resource: &K) -> Result<K, Error>;

    /// Replaces the resource. The update is rejected with
    /// [`Error::Conflict`] if the resource version is stale.
    async fn replace(&self, namespace: &str, resource: &K) -> Result<K, Error>;

    async fn replace_status(&self, namespace: &str, resource: &K) -> Result<K, Error>;

    /// Server-side applies the fields set on `resource`.
    async fn apply(&self, namespace: &str, resource: &K) -> Result<K, Error>;

    /// Deletes the resource. A resource that is already gone is not an error.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

pub type SharedApi<K> = Arc<dyn ResourceApi<K>>;

/// The cluster APIs used by the managers.
#[derive(Clone)]
pub struct Clients {
    pub certificates: SharedApi<Certificate>,
    pub secrets: SharedApi<Secret>,
    pub secured_accesses: SharedApi<SecuredAccess>,
    pub services: SharedApi<Service>,
    pub routes: SharedApi<Route>,
    pub ingresses: SharedApi<Ingress>,
    pub http_proxies: SharedApi<HttpProxy>,
    pub tls_routes: SharedApi<TlsRoute>,
    pub gateways: SharedApi<Gateway>,
}

/// A [`ResourceApi`] backed by the Kubernetes API server.
pub struct KubeApi<K> {
    client: Client,
    _marker: PhantomData<fn() -> K>,
}

// === impl Clients ===

impl Clients {
    pub fn new(client: Client) -> Self {
        Self {
            certificates: KubeApi::shared(client.clone()),
            secrets: KubeApi::shared(client.clone()),
            secured_accesses: KubeApi::shared(client.clone()),
            services: KubeApi::shared(client.clone()),
            routes: KubeApi::shared(client.clone()),
            ingresses: KubeApi::shared(client.clone()),
            http_proxies: KubeApi::shared(client.clone()),
            tls_routes: KubeApi::shared(client.clone()),
            gateways: KubeApi::shared(client),
        }
    }
}

impl fmt::Debug for Clients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clients").finish_non_exhaustive()
    }
}

// === impl KubeApi ===

impl<K> KubeApi<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    K: Clone + fmt::Debug + DeserializeOwned + Serialize + Send + Sync + 'static,
{
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _marker: PhantomData,
        }
    }

    pub fn shared(client: Client) -> SharedApi<K> {
        Arc::new(Self::new(client))
    }

    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn classify(namespace: &str, name: &str, error: kube::Error) -> Error {
        match error {
            kube::Error::Api(ErrorResponse { code: 409, reason, .. }) => {
                let kind = K::kind(&()).to_string();
                let key = ResourceKey::new(namespace, name).to_string();
                if reason == "AlreadyExists" {
                    Error::AlreadyExists { kind, key }
                } else {
                    Error::Conflict { kind, key }
                }
            }
            error => Error::Kube(error),
        }
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(CONTROLLER_NAME.to_string()),
        ..Default::default()
    }
}

fn name_of<K: Resource>(resource: &K) -> &str {
    resource.meta().name.as_deref().unwrap_or_default()
}

#[async_trait::async_trait]
impl<K> ResourceApi<K> for KubeApi<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    K: Clone + fmt::Debug + DeserializeOwned + Serialize + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, Error> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn create(&self, namespace: &str, resource: &K) -> Result<K, Error> {
        let name = name_of(resource);
        self.api(namespace)
            .create(&post_params(), resource)
            .await
            .map_err(|e| Self::classify(namespace, name, e))
    }

    async fn replace(&self, namespace: &str, resource: &K) -> Result<K, Error> {
        let name = name_of(resource);
        self.api(namespace)
            .replace(name, &post_params(), resource)
            .await
            .map_err(|e| Self::classify(namespace, name, e))
    }

    async fn replace_status(&self, namespace: &str, resource: &K) -> Result<K, Error> {
        let name = name_of(resource);
        let status = serde_json::to_value(resource)
            .ok()
            .and_then(|mut v| v.get_mut("status").map(serde_json::Value::take))
            .unwrap_or_default();
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource.meta().resource_version },
            "status": status,
        });
        let params = PatchParams {
            field_manager: Some(CONTROLLER_NAME.to_string()),
            ..Default::default()
        };
        self.api(namespace)
            .patch_status(name, &params, &Patch::Merge(patch))
            .await
            .map_err(|e| Self::classify(namespace, name, e))
    }

    async fn apply(&self, namespace: &str, resource: &K) -> Result<K, Error> {
        let name = name_of(resource);
        let params = PatchParams::apply(CONTROLLER_NAME).force();
        self.api(namespace)
            .patch(name, &params, &Patch::Apply(resource))
            .await
            .map_err(|e| Self::classify(namespace, name, e))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .api(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(()),
            Err(error) => Err(Self::classify(namespace, name, error)),
        }
    }
}
