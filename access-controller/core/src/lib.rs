#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod endpoints;
pub mod hosts;
mod keys;
pub mod service;

pub use self::{
    hosts::{HostDelta, OwnerHosts},
    keys::{port_qualified_name, port_qualified_splits, InvalidKey, ResourceKey},
};

/// The name under which this controller manages resources.
pub const CONTROLLER_NAME: &str = "skupper-controller";
