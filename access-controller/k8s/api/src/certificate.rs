use crate::status::{ConditionState, Status, CONDITION_READY};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The setting naming an external controller that issues this certificate.
pub const SETTING_CERTIFICATE_CONTROLLER: &str = "certificateController";

/// The setting overriding the validity period of an issued certificate.
pub const SETTING_DURATION: &str = "duration";

/// A Certificate describes TLS key material the controller keeps in a Secret
/// of the same name.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "skupper.io",
    version = "v2alpha1",
    kind = "Certificate",
    status = "CertificateStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    /// Name of the Certificate that signs this one. Unused when signing.
    #[serde(default)]
    pub ca: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub client: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub server: bool,
    /// When set, the certificate is a CA that may sign other certificates.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub signing: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    #[serde(flatten)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expiration: String,
}

// === impl CertificateSpec ===

impl CertificateSpec {
    pub fn certificate_controller(&self) -> Option<&str> {
        self.settings
            .get(SETTING_CERTIFICATE_CONTROLLER)
            .map(String::as_str)
            .filter(|c| !c.is_empty())
    }

    pub fn set_certificate_controller(&mut self, controller: Option<&str>) {
        match controller.filter(|c| !c.is_empty()) {
            Some(c) => {
                self.settings
                    .insert(SETTING_CERTIFICATE_CONTROLLER.to_string(), c.to_string());
            }
            None => {
                self.settings.remove(SETTING_CERTIFICATE_CONTROLLER);
            }
        }
    }
}

// === impl Certificate ===

impl Certificate {
    /// Records the outcome of the last secret reconciliation.
    pub fn set_ready(&mut self, state: ConditionState) -> bool {
        let generation = self.metadata.generation.unwrap_or_default();
        let status = &mut self.status.get_or_insert_with(Default::default).status;
        let changed = status.set_condition(CONDITION_READY, state, generation);
        if changed {
            status.set_ready(&[CONDITION_READY], generation);
        }
        changed
    }

    pub fn set_expiration(&mut self, expiration: String) -> bool {
        let status = self.status.get_or_insert_with(Default::default);
        if status.expiration == expiration {
            return false;
        }
        status.expiration = expiration;
        true
    }

    pub fn ready_condition(&self) -> Option<&crate::Condition> {
        self.status
            .as_ref()
            .and_then(|s| s.status.condition(CONDITION_READY))
    }
}
