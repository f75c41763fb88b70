use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::name::NodeName;

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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeRole {
    Validator,
    Fullnode,
}

/// The phase a node is requested to be in. Set by the controller, acted on by
/// the node runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum DesiredPhase {
    Running,
    Stopped,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
pub enum NodePhase {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Stopped,
    Transitioning,
    Unknown,
}

/// Latest health observation for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthState {
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Default for HealthState {
    fn default() -> Self {
        Self { status: HealthStatus::Unknown, last_check: None, consecutive_failures: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub role: NodeRole,
    pub desired_phase: DesiredPhase,
    /// Explicit bind address. Empty means loopback with per-index port offsets.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub phase: Option<NodePhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub block_height: u64,
    pub peer_count: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default)]
    pub health: HealthState,
}

impl Default for NodeSpec {
    fn default() -> Self {
        Self { role: NodeRole::Validator, desired_phase: DesiredPhase::Running, address: String::new() }
    }
}

/// One process or container running a chain binary, keyed by `(devnet, index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub name: NodeName,
    pub index: u32,
    pub spec: NodeSpec,
    pub status: NodeStatus,
}

impl Node {
    pub fn new(role: NodeRole, index: u32) -> Self {
        Self {
            name: NodeName::new(role, index),
            index,
            spec: NodeSpec { role, ..Default::default() },
            status: NodeStatus { phase: Some(NodePhase::Pending), ..Default::default() },
        }
    }

    pub fn phase(&self) -> NodePhase {
        self.status.phase.unwrap_or(NodePhase::Pending)
    }

    /// A node is ready when it is healthy and has produced or synced at least
    /// one block.
    pub fn is_ready(&self) -> bool {
        self.status.health.status == HealthStatus::Healthy && self.status.block_height > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_naming_follows_role_and_index() {
        assert_eq!(Node::new(NodeRole::Validator, 0).name.to_string(), "validator-0");
        assert_eq!(Node::new(NodeRole::Fullnode, 2).name.to_string(), "fullnode-2");
    }

    #[test]
    fn readiness_requires_health_and_height() {
        let mut node = Node::new(NodeRole::Validator, 0);
        assert!(!node.is_ready());

        node.status.health.status = HealthStatus::Healthy;
        assert!(!node.is_ready(), "healthy but no height yet");

        node.status.block_height = 1;
        assert!(node.is_ready());
    }
}
