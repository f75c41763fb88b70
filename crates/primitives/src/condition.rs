use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of claim a [`Condition`] makes about a devnet.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
pub enum ConditionType {
    /// All nodes are up and passing health checks.
    Ready,
    /// A provisioning run is in flight.
    Progressing,
    BinaryBuilt,
    GenesisForked,
    NodesInitialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A structured boolean-with-reason claim about a devnet, in the style of
/// Kubernetes resource conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        r#type: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            r#type,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Upserts `cond` into `conditions`, keyed by type.
///
/// `last_transition_time` is carried over from the existing entry unless the
/// status actually flipped, so that observers can order phase transitions by
/// transition time.
pub fn set_condition(conditions: &mut Vec<Condition>, mut cond: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == cond.r#type) {
        if existing.status == cond.status {
            cond.last_transition_time = existing.last_transition_time;
        }
        *existing = cond;
    } else {
        conditions.push(cond);
    }
}

/// Looks up a condition by type.
pub fn get_condition(conditions: &[Condition], r#type: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.r#type == r#type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_preserves_transition_time_when_status_unchanged() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new(ConditionType::Ready, ConditionStatus::False, "Provisioning", ""),
        );
        let t0 = conditions[0].last_transition_time;

        set_condition(
            &mut conditions,
            Condition::new(ConditionType::Ready, ConditionStatus::False, "StillProvisioning", ""),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, t0);
        assert_eq!(conditions[0].reason, "StillProvisioning");
    }

    #[test]
    fn set_condition_bumps_transition_time_on_flip() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new(ConditionType::Ready, ConditionStatus::False, "Provisioning", ""),
        );
        let t0 = conditions[0].last_transition_time;

        std::thread::sleep(std::time::Duration::from_millis(5));
        set_condition(
            &mut conditions,
            Condition::new(ConditionType::Ready, ConditionStatus::True, "AllNodesReady", ""),
        );
        assert_eq!(conditions.len(), 1);
        assert!(conditions[0].last_transition_time > t0);
    }

    #[test]
    fn distinct_types_coexist() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new(ConditionType::Ready, ConditionStatus::True, "AllNodesReady", ""),
        );
        set_condition(
            &mut conditions,
            Condition::new(ConditionType::Progressing, ConditionStatus::False, "Idle", ""),
        );
        assert_eq!(conditions.len(), 2);
        assert!(get_condition(&conditions, ConditionType::Ready).is_some());
        assert!(get_condition(&conditions, ConditionType::Progressing).is_some());
    }
}
