#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use access_controller_core as core;
pub use access_controller_k8s_api as k8s;

pub mod access;
mod args;
pub mod certificates;
pub mod client;
pub mod context;
pub mod controller;
mod error;
mod lease;
pub mod processor;
pub mod watch;

#[cfg(test)]
mod tests;

pub use self::{args::Args, error::Error};
