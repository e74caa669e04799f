use crate::status::{ConditionState, Status, CONDITION_CONFIGURED, CONDITION_RESOLVED};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The setting used by the route access type to choose an explicit domain.
pub const SETTING_DOMAIN: &str = "domain";

const REQUIRED: [&str; 2] = [CONDITION_CONFIGURED, CONDITION_RESOLVED];

/// A SecuredAccess asks for a set of pods to be reachable over TLS from
/// outside the cluster, using one of the enabled access types.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "skupper.io",
    version = "v2alpha1",
    kind = "SecuredAccess",
    status = "SecuredAccessStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SecuredAccessSpec {
    /// Falls back to the controller's default access type when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_type: String,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<SecuredAccessPort>,
    /// Name of the server certificate. Defaults to the resource name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub certificate: String,
    /// When set, a server certificate signed by this CA is maintained.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub issuer: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecuredAccessPort {
    pub name: String,
    pub port: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub target_port: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecuredAccessStatus {
    #[serde(flatten)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca: String,
}

/// An externally reachable address for one port.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
}

fn is_zero(n: &i32) -> bool {
    *n == 0
}

// === impl SecuredAccessSpec ===

impl SecuredAccessSpec {
    pub fn has_port(&self, name: &str) -> bool {
        self.ports.iter().any(|p| p.name == name)
    }
}

// === impl SecuredAccess ===

impl SecuredAccess {
    /// Records the outcome of provisioning the backing resources.
    ///
    /// `None` means everything was configured. A pending state is used for
    /// dependencies that have not resolved yet.
    pub fn set_configured(&mut self, state: Option<ConditionState>) -> bool {
        let generation = self.metadata.generation.unwrap_or_default();
        let status = &mut self.status.get_or_insert_with(Default::default).status;
        let state = state.unwrap_or_else(ConditionState::ready);
        if status.set_condition(CONDITION_CONFIGURED, state, generation) {
            status.set_ready(&REQUIRED, generation);
            return true;
        }
        false
    }

    /// Records the endpoints returned by the access type.
    pub fn set_resolved(&mut self, endpoints: Vec<Endpoint>) -> bool {
        let generation = self.metadata.generation.unwrap_or_default();
        let status = self.status.get_or_insert_with(Default::default);
        let resolved = !endpoints.is_empty();
        let mut changed = false;
        if status.endpoints != endpoints {
            status.endpoints = endpoints;
            changed = true;
        }
        if status.status.set_condition(
            CONDITION_RESOLVED,
            ConditionState::ready_or_pending(resolved),
            generation,
        ) {
            changed = true;
        }
        if status.status.set_ready(&REQUIRED, generation) {
            changed = true;
        }
        changed
    }

    /// Records the CA that signs the server certificate, if any.
    pub fn set_ca(&mut self) -> bool {
        let issuer = self.spec.issuer.clone();
        let status = self.status.get_or_insert_with(Default::default);
        if status.ca == issuer {
            return false;
        }
        status.ca = issuer;
        true
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        self.status
            .as_ref()
            .map(|s| s.endpoints.as_slice())
            .unwrap_or_default()
    }

    pub fn status_message(&self) -> Option<&str> {
        self.status.as_ref().map(|s| s.status.message.as_str())
    }

    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| {
                s.status.is_condition_true(CONDITION_CONFIGURED)
                    && s.status.is_condition_true(CONDITION_RESOLVED)
            })
            .unwrap_or(false)
    }
}
