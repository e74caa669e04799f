#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod certificate;
pub mod duration;
pub mod gateway;
pub mod http_proxy;
pub mod labels;
pub mod route;
pub mod secured_access;
pub mod status;

pub use self::{
    certificate::{Certificate, CertificateSpec, CertificateStatus},
    gateway::{Gateway, TlsRoute},
    http_proxy::HttpProxy,
    route::Route,
    secured_access::{Endpoint, SecuredAccess, SecuredAccessPort, SecuredAccessSpec},
    status::{Condition, Status, StatusType},
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{Secret, Service, ServicePort, ServiceSpec},
        networking::v1::Ingress,
    },
    apimachinery::{
        self,
        pkg::{apis::meta::v1::OwnerReference, util::intstr::IntOrString},
    },
    ByteString,
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, PostParams, Resource, ResourceExt},
    error::ErrorResponse,
    runtime::watcher,
    Client, Error,
};

/// The API group and version of the resources owned by this controller.
pub const API_VERSION: &str = "skupper.io/v2alpha1";

/// Builds an owner reference pointing at `resource`.
///
/// Returns `None` when the resource has not been assigned a name yet.
pub fn owner_reference<K>(resource: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    let meta = resource.meta();
    Some(OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: meta.name.clone()?,
        uid: meta.uid.clone().unwrap_or_default(),
        ..Default::default()
    })
}
