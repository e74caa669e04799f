//! Reconciliation of the Service that backs a SecuredAccess.

use access_controller_k8s_api::{
    labels::Map, IntOrString, SecuredAccessPort, ServicePort, ServiceSpec,
};

pub const TYPE_CLUSTER_IP: &str = "ClusterIP";
pub const TYPE_LOAD_BALANCER: &str = "LoadBalancer";
pub const TYPE_NODE_PORT: &str = "NodePort";

const PROTOCOL_TCP: &str = "TCP";

/// Builds the service port for a SecuredAccess port.
///
/// An unset target port and protocol are left for the API server to default.
pub fn to_service_port(port: &SecuredAccessPort) -> ServicePort {
    ServicePort {
        name: Some(port.name.clone()),
        port: port.port,
        target_port: (port.target_port != 0).then_some(IntOrString::Int(port.target_port)),
        protocol: Some(port.protocol.clone()).filter(|p| !p.is_empty()),
        ..Default::default()
    }
}

/// Tests whether an existing port already satisfies a desired one, allowing
/// for the values the API server fills in.
pub fn equivalent_ports(desired: &ServicePort, actual: &ServicePort) -> bool {
    desired.name == actual.name
        && desired.port == actual.port
        && equivalent_target_ports(desired, actual)
        && equivalent_protocols(desired.protocol.as_deref(), actual.protocol.as_deref())
}

fn equivalent_target_ports(desired: &ServicePort, actual: &ServicePort) -> bool {
    match (&desired.target_port, &actual.target_port) {
        (d, a) if d == a => true,
        (None, Some(IntOrString::Int(p))) => *p == desired.port,
        _ => false,
    }
}

fn equivalent_protocols(desired: Option<&str>, actual: Option<&str>) -> bool {
    desired == actual || (desired.is_none() && actual == Some(PROTOCOL_TCP))
}

/// Brings the service ports in line with `desired`.
///
/// Ports that are already equivalent are left untouched, changed ports are
/// replaced in place and new ports are appended in the order given.
pub fn update_ports(spec: &mut ServiceSpec, desired: &[SecuredAccessPort]) -> bool {
    let mut expected = desired
        .iter()
        .map(|p| (p.name.as_str(), to_service_port(p)))
        .collect::<Vec<_>>();

    let mut changed = false;
    let mut ports = Vec::with_capacity(desired.len());
    for actual in spec.ports.iter().flatten() {
        let name = actual.name.as_deref().unwrap_or_default();
        match expected.iter().position(|(n, _)| *n == name) {
            Some(i) => {
                let (_, port) = expected.remove(i);
                if equivalent_ports(&port, actual) {
                    ports.push(actual.clone());
                } else {
                    ports.push(port);
                    changed = true;
                }
            }
            None => changed = true,
        }
    }
    for (_, port) in expected {
        ports.push(port);
        changed = true;
    }
    if changed {
        spec.ports = Some(ports);
    }
    changed
}

pub fn update_selector(spec: &mut ServiceSpec, desired: &Map) -> bool {
    let actual = spec.selector.as_ref().filter(|s| !s.is_empty());
    let desired = Some(desired).filter(|s| !s.is_empty());
    if actual == desired {
        return false;
    }
    spec.selector = desired.cloned();
    true
}

/// Sets the service type. `None` means the default cluster IP service.
pub fn update_type(spec: &mut ServiceSpec, desired: Option<&str>) -> bool {
    let actual = spec.type_.as_deref().unwrap_or(TYPE_CLUSTER_IP);
    let wanted = desired.unwrap_or(TYPE_CLUSTER_IP);
    if actual == wanted {
        return false;
    }
    spec.type_ = desired.map(ToString::to_string);
    true
}
