use crate::{
    context::ControllerContext,
    core::CONTROLLER_NAME,
    k8s::{api::apps::v1::Deployment, labels::Map, ObjectMeta, Resource},
};
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Api, Patch, PatchParams};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const MIN_RENEW_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Identifies the write Lease and the instance competing for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseConfig {
    pub name: String,
    pub namespace: String,
    /// The claimant, normally the pod name.
    pub holder: String,
    /// The Deployment that owns the Lease, so it is removed with it.
    pub owner: String,
    pub duration: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("failed to read Deployment {namespace}/{name}: {source}")]
    Owner {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to create Lease {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to claim Lease {name}: {source}")]
    Claim {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Claims = watch::Receiver<Arc<kubert::lease::Claim>>;

/// Creates the write Lease if needed and starts competing for it.
pub async fn init(
    client: kube::Client,
    config: &LeaseConfig,
    context: &dyn ControllerContext,
) -> Result<Claims, LeaseError> {
    let deployments = Api::<Deployment>::namespaced(client.clone(), &config.namespace);
    let owner = deployments
        .get_opt(&config.owner)
        .await
        .map_err(|source| LeaseError::Owner {
            namespace: config.namespace.clone(),
            name: config.owner.clone(),
            source,
        })?;
    if owner.is_none() {
        warn!(deployment = %config.owner, "Owning Deployment not found, Lease will not be garbage collected");
    }

    let api = Api::<Lease>::namespaced(client, &config.namespace);
    let params = PatchParams {
        field_manager: Some(CONTROLLER_NAME.to_string()),
        ..Default::default()
    };
    let lease = config.lease(owner.as_ref(), context);
    match api.patch(&config.name, &params, &Patch::Apply(lease)).await {
        Ok(_) => info!(lease = %config.name, "Created Lease"),
        // The pinned resource version only matches a Lease that does not exist yet.
        Err(kube::Error::Api(e)) if e.code == 409 => {
            debug!(lease = %config.name, "Lease already exists")
        }
        Err(source) => {
            return Err(LeaseError::Create {
                name: config.name.clone(),
                source,
            })
        }
    }

    let (claims, _task) = kubert::lease::LeaseManager::init(api, config.name.as_str())
        .await
        .map_err(|e| config.claim_error(e))?
        .spawn(config.holder.as_str(), config.claim_params())
        .await
        .map_err(|e| config.claim_error(e))?;
    Ok(claims)
}

// === impl LeaseConfig ===

impl LeaseConfig {
    /// Renewal starts a tenth of the lease duration before it expires.
    pub fn claim_params(&self) -> kubert::lease::ClaimParams {
        kubert::lease::ClaimParams {
            lease_duration: self.duration,
            renew_grace_period: (self.duration / 10).max(MIN_RENEW_GRACE_PERIOD),
        }
    }

    /// The Lease written before claiming it. The spec is left to the lease
    /// manager.
    pub fn lease(&self, owner: Option<&Deployment>, context: &dyn ControllerContext) -> Lease {
        let mut labels = Map::new();
        labels.insert("app.kubernetes.io/name".to_string(), CONTROLLER_NAME.to_string());
        context.set_labels(&self.namespace, &self.name, "Lease", &mut labels);
        let mut annotations = Map::new();
        context.set_annotations(&self.namespace, &self.name, "Lease", &mut annotations);

        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: Some("0".to_string()),
                owner_references: owner
                    .and_then(|d| d.controller_owner_ref(&()))
                    .map(|o| vec![o]),
                labels: Some(labels),
                annotations: (!annotations.is_empty()).then_some(annotations),
                ..Default::default()
            },
            spec: None,
        }
    }

    fn claim_error<E>(&self, source: E) -> LeaseError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        LeaseError::Claim {
            name: self.name.clone(),
            source: Box::new(source),
        }
    }
}
