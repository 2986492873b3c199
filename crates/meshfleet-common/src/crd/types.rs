//! Status conditions shared by meshfleet CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Well-known condition types
pub mod condition_types {
    /// ServiceExport passed structural validation
    pub const VALID: &str = "Valid";
    /// ServiceExport clashes with an export elsewhere in the fleet
    pub const CONFLICT: &str = "Conflict";
    /// Resource is ready
    pub const READY: &str = "Ready";
    /// Connector for a Cluster is running
    pub const CONNECTED: &str = "Connected";
}

/// Condition status values
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Valid, Conflict)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// True when the condition of `type_` is present with `status`
pub fn condition_is(conditions: &[Condition], type_: &str, status: ConditionStatus) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == status)
}

/// Insert or replace a condition by type.
///
/// The transition time is kept when the status did not change so that
/// repeated reconciles do not churn the status subresource.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            let keep_time = existing.status == condition.status;
            let time = existing.last_transition_time;
            *existing = condition;
            if keep_time {
                existing.last_transition_time = time;
            }
        }
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_replaces_by_type() {
        let mut conditions = vec![Condition::new(
            condition_types::CONFLICT,
            ConditionStatus::False,
            "NoConflict",
            "",
        )];
        set_condition(
            &mut conditions,
            Condition::new(
                condition_types::CONFLICT,
                ConditionStatus::True,
                "Conflict",
                "ServiceExport shop/cart conflicts",
            ),
        );
        assert_eq!(conditions.len(), 1);
        assert!(condition_is(
            &conditions,
            condition_types::CONFLICT,
            ConditionStatus::True
        ));
    }

    #[test]
    fn unchanged_status_keeps_transition_time() {
        let mut first = Condition::new(condition_types::VALID, ConditionStatus::True, "Valid", "");
        first.last_transition_time = DateTime::<Utc>::MIN_UTC;
        let mut conditions = vec![first];
        set_condition(
            &mut conditions,
            Condition::new(condition_types::VALID, ConditionStatus::True, "Valid", "ok"),
        );
        assert_eq!(conditions[0].last_transition_time, DateTime::<Utc>::MIN_UTC);
        assert_eq!(conditions[0].message, "ok");
    }

    #[test]
    fn missing_condition_is_not_true() {
        assert!(!condition_is(&[], condition_types::VALID, ConditionStatus::False));
    }

    #[test]
    fn condition_serializes_with_kubernetes_field_names() {
        let c = Condition::new(condition_types::READY, ConditionStatus::True, "Ready", "");
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastTransitionTime").is_some());
    }
}
