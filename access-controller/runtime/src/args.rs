use crate::{
    access::{strategy, BackendCaches, SecuredAccessManager},
    certificates::{CertificateManager, RcgenIssuer},
    client::Clients,
    context::StaticContext,
    controller::{Caches, Controller},
    k8s::{self, labels::Map, Client, Resource},
    lease,
    processor::{Kind, Metrics, Processor},
    watch::Cache,
};
use anyhow::{bail, Result};
use clap::Parser;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use serde::de::DeserializeOwned;
use std::{fmt, sync::Arc};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "access-controller",
    about = "Exposes services outside the cluster through SecuredAccess resources"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "access_controller=info,warn",
        env = "SKUPPER_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The namespace the controller runs in. Holds the shared Gateway and
    /// the write Lease.
    #[clap(long, env = "NAMESPACE", default_value = "skupper")]
    namespace: String,

    /// Only manage resources in this namespace.
    #[clap(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    #[clap(
        long,
        env = "SKUPPER_ENABLED_ACCESS_TYPES",
        value_delimiter = ',',
        default_value = "local,loadbalancer,route,nodeport,ingress-nginx,contour-http-proxy,gateway"
    )]
    enabled_access_types: Vec<String>,

    /// Used by SecuredAccesses that do not name an access type. Defaults to
    /// `route` when the Route API is installed, else `loadbalancer`.
    #[clap(long, env = "SKUPPER_DEFAULT_ACCESS_TYPE")]
    default_access_type: Option<String>,

    #[clap(long, env = "SKUPPER_INGRESS_DOMAIN", default_value = "")]
    ingress_domain: String,

    #[clap(long, env = "SKUPPER_HTTP_PROXY_DOMAIN", default_value = "")]
    http_proxy_domain: String,

    /// The class of the shared Gateway. The gateway access type is disabled
    /// without one.
    #[clap(long, env = "SKUPPER_GATEWAY_CLASS", default_value = "")]
    gateway_class: String,

    #[clap(long, env = "SKUPPER_GATEWAY_DOMAIN", default_value = "")]
    gateway_domain: String,

    #[clap(long, env = "SKUPPER_GATEWAY_PORT", default_value = "8443")]
    gateway_port: i32,

    /// The host at which node ports are reachable.
    #[clap(long, env = "SKUPPER_CLUSTER_HOST", default_value = "")]
    cluster_host: String,

    /// Delegates issuing of every certificate to another controller.
    #[clap(long, env = "SKUPPER_CERTIFICATE_CONTROLLER")]
    certificate_controller: Option<String>,

    /// Labels added to every resource the controller writes, as
    /// `key=value,key=value`.
    #[clap(long, env = "SKUPPER_LABELS", default_value = "")]
    resource_labels: KeyValues,

    /// Annotations added to every resource the controller writes.
    #[clap(long, env = "SKUPPER_ANNOTATIONS", default_value = "")]
    resource_annotations: KeyValues,

    /// The Deployment that owns the write Lease.
    #[clap(long, default_value = "skupper-controller")]
    controller_deployment_name: String,

    #[clap(long, default_value = "skupper-controller-write")]
    lease_name: String,

    /// Seconds a claim on the write Lease is valid without renewal.
    #[clap(long, default_value = "30")]
    lease_duration_secs: u64,

    /// Identifies this instance when claiming the write Lease.
    #[clap(long, env = "HOSTNAME")]
    lease_holder: Option<String>,

    /// Runs without claiming the write Lease.
    #[clap(long)]
    lease_disabled: bool,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            namespace,
            watch_namespace,
            enabled_access_types,
            default_access_type,
            ingress_domain,
            http_proxy_domain,
            gateway_class,
            gateway_domain,
            gateway_port,
            cluster_host,
            certificate_controller,
            resource_labels: KeyValues(resource_labels),
            resource_annotations: KeyValues(resource_annotations),
            controller_deployment_name,
            lease_name,
            lease_duration_secs,
            lease_holder,
            lease_disabled,
        } = self;
        let watch_namespace = watch_namespace.filter(|ns| !ns.is_empty());

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("controller"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let kube_client = runtime.client();
        let routes_available = api_resource_exists::<k8s::Route>(&kube_client).await;
        let config = strategy::Config {
            enabled_access_types,
            default_access_type,
            ingress_domain,
            http_proxy_domain,
            gateway_class,
            gateway_domain,
            gateway_port,
            cluster_host,
            namespace: namespace.clone(),
        };
        let default_access_type = config.default_access_type(routes_available);
        info!(%default_access_type, enabled = ?config.enabled_access_types, "Access types");

        // Spawn resource watches.

        let mut processor = Processor::new(metrics);
        let ns = watch_namespace.as_deref();
        let all = watcher::Config::default;
        let secured_access = || watcher::Config::default().labels(k8s::labels::SECURED_ACCESS);

        let certificates = watch::<k8s::Certificate, _>(&mut runtime, &mut processor, Kind::Certificate, ns, all());
        let secrets = watch::<k8s::Secret, _>(&mut runtime, &mut processor, Kind::Secret, ns, all());
        let secured_accesses =
            watch::<k8s::SecuredAccess, _>(&mut runtime, &mut processor, Kind::SecuredAccess, ns, all());
        let services =
            watch::<k8s::Service, _>(&mut runtime, &mut processor, Kind::Service, ns, secured_access());
        let ingresses =
            watch::<k8s::Ingress, _>(&mut runtime, &mut processor, Kind::Ingress, ns, secured_access());

        let routes = if routes_available {
            Some(watch::<k8s::Route, _>(&mut runtime, &mut processor, Kind::Route, ns, secured_access()))
        } else {
            tracing::warn!("routes.route.openshift.io resource kind not found, skipping watches");
            None
        };

        let http_proxies = if api_resource_exists::<k8s::HttpProxy>(&kube_client).await {
            Some(watch::<k8s::HttpProxy, _>(
                &mut runtime,
                &mut processor,
                Kind::HttpProxy,
                ns,
                secured_access(),
            ))
        } else {
            tracing::warn!("httpproxies.projectcontour.io resource kind not found, skipping watches");
            None
        };

        let tls_routes = if api_resource_exists::<k8s::TlsRoute>(&kube_client).await {
            Some(watch::<k8s::TlsRoute, _>(
                &mut runtime,
                &mut processor,
                Kind::TlsRoute,
                ns,
                secured_access(),
            ))
        } else {
            tracing::warn!(
                "tlsroutes.gateway.networking.k8s.io resource kind not found, skipping watches"
            );
            None
        };

        let gateways = if api_resource_exists::<k8s::Gateway>(&kube_client).await {
            let name = format!("metadata.name={}", strategy::GATEWAY_NAME);
            Some(watch::<k8s::Gateway, _>(
                &mut runtime,
                &mut processor,
                Kind::Gateway,
                Some(namespace.as_str()),
                watcher::Config::default().fields(&name),
            ))
        } else {
            tracing::warn!(
                "gateways.gateway.networking.k8s.io resource kind not found, skipping watches"
            );
            None
        };

        let caches = Caches {
            certificates,
            secrets,
            secured_accesses,
            backends: BackendCaches {
                services,
                ingresses,
                routes,
                http_proxies,
                tls_routes,
                gateways,
            },
        };

        let context = Arc::new(
            StaticContext::new(&namespace, watch_namespace)
                .with_labels(resource_labels)
                .with_annotations(resource_annotations),
        );
        let clients = Clients::new(kube_client);
        let certificates = CertificateManager::new(
            clients.clone(),
            context.clone(),
            Arc::new(RcgenIssuer::new()),
            certificate_controller,
        );
        let access = SecuredAccessManager::new(
            clients,
            context.clone(),
            certificates,
            &config,
            default_access_type,
        );

        let claims = if lease_disabled {
            None
        } else {
            let Some(holder) = lease_holder.filter(|h| !h.is_empty()) else {
                bail!("--lease-holder or HOSTNAME must be set unless --lease-disabled is given");
            };
            let lease_config = lease::LeaseConfig {
                name: lease_name,
                namespace: namespace.clone(),
                holder,
                owner: controller_deployment_name,
                duration: std::time::Duration::from_secs(lease_duration_secs),
            };
            let claims = lease::init(runtime.client(), &lease_config, context.as_ref()).await?;
            Some((claims, lease_config.holder))
        };

        let shutdown = runtime.shutdown_handle();
        tokio::spawn(
            run(processor, Controller::new(access, caches), claims, shutdown)
                .instrument(info_span!("controller")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Waits for the watches to sync and, once this instance holds the write
/// Lease, recovers existing state and starts handling changes.
async fn run(
    mut processor: Processor,
    mut controller: Controller,
    claims: Option<(lease::Claims, String)>,
    shutdown: drain::Watch,
) {
    processor.wait_for_sync().await;

    if let Some((mut claims, hostname)) = claims {
        info!(%hostname, "Waiting for the write Lease");
        let claimed = async {
            claims
                .wait_for(|claim| claim.is_current_for(&hostname))
                .await
                .is_ok()
        };
        tokio::select! {
            claimed = claimed => {
                if !claimed {
                    tracing::warn!("Lease manager stopped before the Lease was claimed");
                    return;
                }
            }
            _release = shutdown.clone().signaled() => return,
        }
        info!(%hostname, "Claimed the write Lease");
    }

    controller.recover().await;
    processor.run(controller, shutdown).await;
}

fn watch<T, S: 'static>(
    runtime: &mut kubert::Runtime<S>,
    processor: &mut Processor,
    kind: Kind,
    namespace: Option<&str>,
    config: watcher::Config,
) -> Cache<T>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    T: DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static,
{
    let (source, cache) = processor.register::<T>(kind);
    let span = info_span!("watch", %kind);
    match namespace {
        Some(ns) => {
            let events = runtime.watch_namespaced::<T>(ns.to_string(), config);
            tokio::spawn(kubert::index::namespaced(source, events).instrument(span));
        }
        None => {
            let events = runtime.watch_all::<T>(config);
            tokio::spawn(kubert::index::namespaced(source, events).instrument(span));
        }
    }
    cache
}

/// `key=value` pairs separated by commas.
#[derive(Clone, Debug, Default)]
struct KeyValues(Map);

impl std::str::FromStr for KeyValues {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        s.split(',')
            .map(str::trim)
            .filter(|kv| !kv.is_empty())
            .map(|kv| match kv.split_once('=') {
                Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
                _ => bail!("invalid key=value pair: {kv:?}"),
            })
            .collect::<Result<Map>>()
            .map(Self)
    }
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}
