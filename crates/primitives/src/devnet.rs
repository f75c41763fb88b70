use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::event::Event;
use crate::name::{DevnetName, Namespace};
use crate::node::Node;

/// Default validator count applied when the spec leaves it unset (`0`).
pub const DEFAULT_VALIDATORS: u32 = 4;

/// How node processes are hosted.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
    #[default]
    Docker,
    Local,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NetworkType {
    /// No upstream network; serialized as the empty string.
    #[default]
    #[serde(rename = "", alias = "none")]
    #[strum(serialize = "")]
    None,
    Mainnet,
    Testnet,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
pub enum DevnetPhase {
    #[default]
    Pending,
    Provisioning,
    Running,
    Degraded,
    Stopped,
    Failed,
}

/// The desired state of a devnet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevnetSpec {
    /// Which network plugin drives this devnet, eg. `stable`.
    pub plugin: String,
    #[serde(default)]
    pub network_type: NetworkType,
    #[serde(default)]
    pub mode: Mode,
    /// Number of validator nodes. `0` means "use the default".
    #[serde(default)]
    pub validators: u32,
    #[serde(default)]
    pub full_nodes: u32,
    /// Version (git ref) of the chain binary to build.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sdk_version: String,
    /// Network to fork state from, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fork_network: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub genesis_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snapshot_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rpc_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chain_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidSpec {
    #[error("spec.plugin: must not be empty")]
    MissingPlugin,

    #[error("spec.validators: must be at least 1, got {0}")]
    NoValidators(u32),
}

impl DevnetSpec {
    /// Returns the spec with defaults filled in: `validators = 4` when unset.
    /// Mode already defaults to `docker` via `Default`.
    pub fn normalized(mut self) -> Self {
        if self.validators == 0 {
            self.validators = DEFAULT_VALIDATORS;
        }
        self
    }

    /// Validates a normalized spec. Reported field-by-field so the client can
    /// print kubectl-style errors with a source path.
    pub fn validate(&self) -> Result<(), InvalidSpec> {
        if self.plugin.is_empty() {
            return Err(InvalidSpec::MissingPlugin);
        }
        if self.validators == 0 {
            return Err(InvalidSpec::NoValidators(self.validators));
        }
        Ok(())
    }

    /// Total node count this spec asks for.
    pub fn node_count(&self) -> u32 {
        self.validators + self.full_nodes
    }
}

/// The observed state of a devnet.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevnetStatus {
    pub phase: DevnetPhase,
    pub nodes: u32,
    pub ready_nodes: u32,
    pub current_height: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sdk_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Event>,
}

/// The top-level managed resource: a declared multi-node development chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Devnet {
    pub namespace: Namespace,
    pub name: DevnetName,
    pub spec: DevnetSpec,
    #[serde(default)]
    pub status: DevnetStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Node>,
}

impl Devnet {
    pub fn new(namespace: Namespace, name: DevnetName, spec: DevnetSpec) -> Self {
        Self { namespace, name, spec, status: DevnetStatus::default(), nodes: Vec::new() }
    }

    pub fn node(&self, index: u32) -> Option<&Node> {
        self.nodes.iter().find(|n| n.index == index)
    }

    pub fn node_mut(&mut self, index: u32) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.index == index)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn normalization_fills_defaults() {
        let spec = DevnetSpec { plugin: "stable".into(), ..Default::default() }.normalized();
        assert_eq!(spec.validators, DEFAULT_VALIDATORS);
        assert_eq!(spec.mode, Mode::Docker);

        // Explicit values survive normalization.
        let spec = DevnetSpec {
            plugin: "stable".into(),
            validators: 2,
            mode: Mode::Local,
            ..Default::default()
        }
        .normalized();
        assert_eq!(spec.validators, 2);
        assert_eq!(spec.mode, Mode::Local);
    }

    #[test]
    fn validation_is_field_addressed() {
        let err = DevnetSpec::default().validate().unwrap_err();
        assert_eq!(err, InvalidSpec::MissingPlugin);
        assert!(err.to_string().starts_with("spec.plugin"));
    }

    #[test]
    fn spec_json_round_trip() {
        let spec = DevnetSpec {
            plugin: "stable".into(),
            validators: 2,
            mode: Mode::Local,
            chain_id: "devnet-1".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&spec).unwrap();
        let back: DevnetSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
