use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_CONFIGURED: &str = "Configured";
pub const CONDITION_RESOLVED: &str = "Resolved";

pub const STATUS_OK: &str = "OK";

/// The rollup reported in `status.status`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum StatusType {
    #[default]
    Pending,
    Ready,
    Error,
}

/// The common status fields shared by every resource this controller owns.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(rename = "status", default, skip_serializing_if = "Option::is_none")]
    pub status_type: Option<StatusType>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// A status condition in the standard Kubernetes shape.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// The desired value of a single condition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConditionState {
    pub status: ConditionStatus,
    pub reason: StatusType,
    pub message: String,
}

// === impl ConditionState ===

impl ConditionState {
    pub fn ready() -> Self {
        Self {
            status: ConditionStatus::True,
            reason: StatusType::Ready,
            message: STATUS_OK.to_string(),
        }
    }

    pub fn error(message: impl ToString) -> Self {
        Self {
            status: ConditionStatus::False,
            reason: StatusType::Error,
            message: message.to_string(),
        }
    }

    pub fn pending(message: impl ToString) -> Self {
        Self {
            status: ConditionStatus::False,
            reason: StatusType::Pending,
            message: message.to_string(),
        }
    }

    pub fn ready_or_pending(ready: bool) -> Self {
        if ready {
            Self::ready()
        } else {
            Self::pending("Pending")
        }
    }
}

// === impl Status ===

impl Status {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn is_condition_true(&self, type_: &str) -> bool {
        self.condition(type_)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    /// Sets a condition, returning true if anything about it changed.
    ///
    /// The transition time only moves when the condition's status flips.
    pub fn set_condition(&mut self, type_: &str, state: ConditionState, generation: i64) -> bool {
        let reason = format!("{:?}", state.reason);
        let generation = Some(generation).filter(|g| *g != 0);
        let existing = match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => existing,
            None => {
                self.conditions.push(Condition {
                    type_: type_.to_string(),
                    status: state.status,
                    reason,
                    message: state.message,
                    observed_generation: generation,
                    last_transition_time: Some(now()),
                });
                return true;
            }
        };

        let mut changed = false;
        if existing.status != state.status {
            existing.status = state.status;
            existing.last_transition_time = Some(now());
            changed = true;
        }
        if existing.reason != reason {
            existing.reason = reason;
            changed = true;
        }
        if existing.message != state.message {
            existing.message = state.message;
            changed = true;
        }
        if existing.observed_generation != generation {
            existing.observed_generation = generation;
            changed = true;
        }
        changed
    }

    /// Derives the `Ready` condition and the rollup from `required`.
    ///
    /// The first required condition that is missing makes the resource
    /// pending; the first one that is false lends its reason and message.
    pub fn set_ready(&mut self, required: &[&str], generation: i64) -> bool {
        let state = self.ready_state(required);
        let mut changed = false;
        if self.status_type != Some(state.reason) {
            self.status_type = Some(state.reason);
            changed = true;
        }
        if self.message != state.message {
            self.message = state.message.clone();
            changed = true;
        }
        if self.set_condition(CONDITION_READY, state, generation) {
            changed = true;
        }
        changed
    }

    fn ready_state(&self, required: &[&str]) -> ConditionState {
        for type_ in required {
            match self.condition(type_) {
                None => return ConditionState::pending(format!("Not {type_}")),
                Some(c) if c.status == ConditionStatus::False => {
                    let reason = match c.reason.as_str() {
                        "Pending" => StatusType::Pending,
                        "Ready" => StatusType::Ready,
                        _ => StatusType::Error,
                    };
                    return ConditionState {
                        status: ConditionStatus::False,
                        reason,
                        message: c.message.clone(),
                    };
                }
                Some(_) => {}
            }
        }
        ConditionState::ready()
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn set_condition_reports_changes() {
        let mut status = Status::default();
        assert!(status.set_condition(CONDITION_CONFIGURED, ConditionState::ready(), 1));
        assert!(!status.set_condition(CONDITION_CONFIGURED, ConditionState::ready(), 1));

        let first = status.conditions[0].last_transition_time.clone();
        assert!(status.set_condition(CONDITION_CONFIGURED, ConditionState::ready(), 2));
        assert_eq!(status.conditions[0].last_transition_time, first);

        assert!(status.set_condition(CONDITION_CONFIGURED, ConditionState::error("boom"), 2));
        let cond = status.condition(CONDITION_CONFIGURED).unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason, "Error");
        assert_eq!(cond.message, "boom");
    }

    #[test]
    fn ready_requires_every_condition() {
        let required = [CONDITION_CONFIGURED, CONDITION_RESOLVED];
        let mut status = Status::default();

        status.set_ready(&required, 1);
        assert_eq!(status.status_type, Some(StatusType::Pending));
        assert_eq!(status.message, "Not Configured");

        status.set_condition(CONDITION_CONFIGURED, ConditionState::ready(), 1);
        status.set_condition(CONDITION_RESOLVED, ConditionState::ready_or_pending(false), 1);
        status.set_ready(&required, 1);
        assert_eq!(status.status_type, Some(StatusType::Pending));
        assert_eq!(status.message, "Pending");
        assert!(!status.is_condition_true(CONDITION_READY));

        status.set_condition(CONDITION_RESOLVED, ConditionState::ready_or_pending(true), 1);
        assert!(status.set_ready(&required, 1));
        assert_eq!(status.status_type, Some(StatusType::Ready));
        assert_eq!(status.message, STATUS_OK);
        assert!(status.is_condition_true(CONDITION_READY));
        assert!(!status.set_ready(&required, 1));
    }

    #[test]
    fn errors_take_precedence_in_order() {
        let required = [CONDITION_CONFIGURED, CONDITION_RESOLVED];
        let mut status = Status::default();
        status.set_condition(CONDITION_CONFIGURED, ConditionState::error("bad port"), 1);
        status.set_condition(CONDITION_RESOLVED, ConditionState::pending("Pending"), 1);
        status.set_ready(&required, 1);
        assert_eq!(status.status_type, Some(StatusType::Error));
        assert_eq!(status.message, "bad port");
    }
}
