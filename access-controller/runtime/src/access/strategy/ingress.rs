use super::{
    super::backends::{backend_meta, upsert, Backends},
    endpoint,
};
use crate::{
    core::{
        endpoints::{prefix, qualify, qualify_once},
        ResourceKey,
    },
    k8s::{
        api::networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, ServiceBackendPort,
        },
        Endpoint, Ingress, ResourceExt, SecuredAccess,
    },
    Error,
};
use tracing::{debug, info};

const NGINX_CLASS: &str = "nginx";
const NGINX_SSL_PASSTHROUGH: &str = "nginx.ingress.kubernetes.io/ssl-passthrough";
const NGINX_SSL_REDIRECT: &str = "nginx.ingress.kubernetes.io/ssl-redirect";

/// Exposes every port of a SecuredAccess through one Ingress, with a rule
/// per port.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngressAccess {
    nginx: bool,
    domain: String,
}

// === impl IngressAccess ===

impl IngressAccess {
    /// An ingress for the nginx controller, with SSL passthrough enabled.
    pub fn nginx(domain: &str) -> Self {
        Self {
            nginx: true,
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
        let key = ResourceKey::new(&namespace, &name);

        let mut desired = self.desired(sa, &qualify(&namespace, &self.domain));
        let mut domain = self.domain.clone();
        if domain.is_empty() {
            if let Some(existing) = backends.ingresses.get(&key) {
                match deduce_domain(existing) {
                    Some(deduced) => {
                        if qualify_hosts(&mut desired, &deduced) {
                            info!(%key, domain = %deduced, "Qualified ingress hosts with deduced domain");
                        }
                        domain = deduced;
                    }
                    None => debug!(%key, "No domain can be inferred yet for ingress"),
                }
            }
        }

        let spec = desired.spec.clone();
        let ingress = upsert(
            &backends.clients.ingresses,
            &mut backends.ingresses,
            &*backends.context,
            &key,
            desired,
            |current| {
                if current.spec == spec {
                    return Ok(false);
                }
                current.spec = spec.clone();
                Ok(true)
            },
        )
        .await?;

        if domain.is_empty() {
            return Ok(Vec::new());
        }
        let endpoints = ingress
            .spec
            .iter()
            .flat_map(|s| s.rules.iter().flatten())
            .filter_map(|rule| rule.host.as_deref())
            .map(|host| endpoint(prefix(host), host, "443"))
            .collect();
        Ok(endpoints)
    }

    fn desired(&self, sa: &SecuredAccess, domain: &str) -> Ingress {
        let name = sa.name_any();
        let rules = sa
            .spec
            .ports
            .iter()
            .map(|port| IngressRule {
                host: Some(qualify(&port.name, domain)),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: name.clone(),
                                port: Some(ServiceBackendPort {
                                    number: Some(port.port),
                                    name: None,
                                }),
                            }),
                            resource: None,
                        },
                    }],
                }),
            })
            .collect();

        let mut ingress = Ingress {
            metadata: backend_meta(sa, &name),
            spec: Some(IngressSpec {
                rules: Some(rules),
                ..Default::default()
            }),
            status: None,
        };
        if self.nginx {
            if let Some(spec) = ingress.spec.as_mut() {
                spec.ingress_class_name = Some(NGINX_CLASS.to_string());
            }
            let annotations = ingress.metadata.annotations.get_or_insert_with(Default::default);
            annotations.insert(NGINX_SSL_PASSTHROUGH.to_string(), "true".to_string());
            annotations.insert(NGINX_SSL_REDIRECT.to_string(), "true".to_string());
        }
        ingress
    }
}

/// The domain under which the ingress controller publishes hosts, taken
/// from the first load balancer address.
fn deduce_domain(ingress: &Ingress) -> Option<String> {
    let address = ingress
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?;
    if let Some(hostname) = address.hostname.as_deref().filter(|h| !h.is_empty()) {
        return Some(hostname.to_string());
    }
    address
        .ip
        .as_deref()
        .filter(|ip| !ip.is_empty())
        .map(|ip| format!("{ip}.nip.io"))
}

fn qualify_hosts(ingress: &mut Ingress, domain: &str) -> bool {
    let mut changed = false;
    let rules = ingress
        .spec
        .iter_mut()
        .flat_map(|s| s.rules.iter_mut().flatten());
    for rule in rules {
        let host = rule.host.as_deref().unwrap_or_default();
        let qualified = qualify_once(host, domain);
        if qualified != host {
            rule.host = Some(qualified);
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::{
        api::networking::v1::{
            IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressStatus,
        },
        SecuredAccessPort, SecuredAccessSpec,
    };
    use pretty_assertions::assert_eq;

    fn ingress_at(hostname: Option<&str>, ip: Option<&str>) -> Ingress {
        Ingress {
            status: Some(IngressStatus {
                load_balancer: Some(IngressLoadBalancerStatus {
                    ingress: Some(vec![IngressLoadBalancerIngress {
                        hostname: hostname.map(ToString::to_string),
                        ip: ip.map(ToString::to_string),
                        ports: None,
                    }]),
                }),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn deduces_domain_from_status() {
        assert_eq!(
            deduce_domain(&ingress_at(Some("my-ingress-gateway.net"), None)).as_deref(),
            Some("my-ingress-gateway.net")
        );
        assert_eq!(
            deduce_domain(&ingress_at(None, Some("10.1.1.1"))).as_deref(),
            Some("10.1.1.1.nip.io")
        );
        assert_eq!(deduce_domain(&Ingress::default()), None);
    }

    #[test]
    fn desired_nginx_ingress() {
        let mut sa = SecuredAccess::new(
            "mysvc",
            SecuredAccessSpec {
                ports: vec![SecuredAccessPort {
                    name: "a".to_string(),
                    port: 8080,
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        sa.metadata.namespace = Some("test".to_string());

        let access = IngressAccess::nginx("");
        let mut ingress = access.desired(&sa, "test");
        let spec = ingress.spec.as_ref().unwrap();
        assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));
        let rules = spec.rules.as_ref().unwrap();
        assert_eq!(rules[0].host.as_deref(), Some("a.test"));
        assert_eq!(
            ingress.metadata.annotations.as_ref().unwrap()[NGINX_SSL_PASSTHROUGH],
            "true"
        );

        assert!(qualify_hosts(&mut ingress, "my-ingress-gateway.net"));
        assert!(!qualify_hosts(&mut ingress, "my-ingress-gateway.net"));
        assert_eq!(
            ingress.spec.unwrap().rules.unwrap()[0].host.as_deref(),
            Some("a.test.my-ingress-gateway.net")
        );
    }
}
