//! Access types resolved directly from the SecuredAccess Service.

use super::endpoint;
use crate::{
    core::endpoints::qualify,
    k8s::{Endpoint, ResourceExt, SecuredAccess, Service},
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodePortAccess {
    cluster_host: String,
}

/// Endpoints at the address assigned to a LoadBalancer service.
pub(super) fn load_balancer(sa: &SecuredAccess, svc: &Service) -> Vec<Endpoint> {
    let ingress = svc
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|i| i.first());
    let Some(ingress) = ingress else {
        return Vec::new();
    };
    let host = ingress
        .hostname
        .as_deref()
        .filter(|h| !h.is_empty())
        .or(ingress.ip.as_deref())
        .filter(|h| !h.is_empty());
    let Some(host) = host else {
        return Vec::new();
    };
    sa.spec
        .ports
        .iter()
        .map(|port| endpoint(&port.name, host, port.port))
        .collect()
}

/// Endpoints at the in-cluster service name.
pub(super) fn local(sa: &SecuredAccess) -> Vec<Endpoint> {
    let host = qualify(&sa.name_any(), &sa.namespace().unwrap_or_default());
    sa.spec
        .ports
        .iter()
        .map(|port| endpoint(&port.name, &host, port.port))
        .collect()
}

// === impl NodePortAccess ===

impl NodePortAccess {
    pub fn new(cluster_host: &str) -> Self {
        Self {
            cluster_host: cluster_host.to_string(),
        }
    }

    /// Endpoints at the cluster host, one for each port that has been
    /// allocated a node port.
    pub(super) fn resolve(&self, sa: &SecuredAccess, svc: &Service) -> Vec<Endpoint> {
        if self.cluster_host.is_empty() {
            return Vec::new();
        }
        let ports = svc
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .map(Vec::as_slice)
            .unwrap_or_default();
        sa.spec
            .ports
            .iter()
            .filter_map(|port| {
                let allocated = ports
                    .iter()
                    .find(|p| p.name.as_deref() == Some(port.name.as_str()))
                    .and_then(|p| p.node_port)
                    .filter(|n| *n > 0)?;
                Some(endpoint(&port.name, &self.cluster_host, allocated))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::{
        api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus},
        SecuredAccessPort, SecuredAccessSpec, ServicePort, ServiceSpec,
    };
    use pretty_assertions::assert_eq;

    fn secured_access() -> SecuredAccess {
        let mut sa = SecuredAccess::new(
            "mysvc",
            SecuredAccessSpec {
                ports: vec![SecuredAccessPort {
                    name: "port1".to_string(),
                    port: 8080,
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        sa.metadata.namespace = Some("test".to_string());
        sa
    }

    fn load_balancer_service(hostname: Option<&str>, ip: Option<&str>) -> Service {
        Service {
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        hostname: hostname.map(ToString::to_string),
                        ip: ip.map(ToString::to_string),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn load_balancer_prefers_hostname() {
        let sa = secured_access();
        assert_eq!(
            load_balancer(&sa, &load_balancer_service(Some("lb.example.com"), Some("10.1.1.1"))),
            vec![endpoint("port1", "lb.example.com", 8080)]
        );
        assert_eq!(
            load_balancer(&sa, &load_balancer_service(None, Some("10.1.1.1"))),
            vec![endpoint("port1", "10.1.1.1", 8080)]
        );
        assert!(load_balancer(&sa, &Service::default()).is_empty());
    }

    #[test]
    fn local_uses_service_name() {
        assert_eq!(
            local(&secured_access()),
            vec![endpoint("port1", "mysvc.test", 8080)]
        );
    }

    #[test]
    fn node_port_waits_for_allocation() {
        let sa = secured_access();
        let nodeport = NodePortAccess::new("mycluster.com");
        let mut svc = Service {
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    name: Some("port1".to_string()),
                    port: 8080,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(nodeport.resolve(&sa, &svc).is_empty());

        svc.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].node_port = Some(33333);
        assert_eq!(
            nodeport.resolve(&sa, &svc),
            vec![endpoint("port1", "mycluster.com", 33333)]
        );
        assert!(NodePortAccess::new("").resolve(&sa, &svc).is_empty());
    }
}
