//! Wire types of the devnet RPC surface.
//!
//! Resource shapes (devnets, nodes, conditions, events, log lines) are the
//! primitives types themselves; this crate adds the request/response
//! envelopes around them.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use devnet_primitives::{Devnet, DevnetSpec, HealthState, Node};
use serde::{Deserialize, Serialize};

pub use devnet_primitives::{LogLine, LogStream, ProvisionLogEntry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub version: String,
    pub time: DateTime<Utc>,
    /// `trusted` on the loopback listener, `restricted` behind an API key.
    pub trust_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhoAmIResponse {
    pub identity: String,
    /// Allowed namespaces; `["*"]` means all.
    pub namespaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub name: String,
    pub display_name: String,
    pub binary_name: String,
    pub default_version: String,
    pub available_networks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListNetworksResponse {
    pub networks: Vec<NetworkInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListBinaryVersionsRequest {
    pub network: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListBinaryVersionsResponse {
    pub versions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyDevnetRequest {
    pub namespace: String,
    pub name: String,
    pub spec: DevnetSpec,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyDevnetResponse {
    pub devnet: Devnet,
    /// `created`, `configured` or `unchanged`.
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevnetRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDevnetsRequest {
    /// Empty means all namespaces.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDevnetsResponse {
    pub devnets: Vec<Devnet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevnetResponse {
    pub devnet: Devnet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResponse {
    pub node: Node,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    pub namespace: String,
    pub devnet: String,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListNodesResponse {
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealthResponse {
    pub health: HealthState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePortsResponse {
    pub ports: BTreeMap<String, u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecInNodeRequest {
    pub namespace: String,
    pub devnet: String,
    pub index: u32,
    pub argv: Vec<String>,
    #[serde(default = "default_exec_timeout")]
    pub timeout_seconds: u64,
}

fn default_exec_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecInNodeResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamNodeLogsRequest {
    pub namespace: String,
    pub devnet: String,
    pub index: u32,
    #[serde(default)]
    pub follow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamProvisionLogsRequest {
    pub namespace: String,
    pub devnet: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_request_round_trips() {
        let req = ApplyDevnetRequest {
            namespace: "default".into(),
            name: "d1".into(),
            spec: DevnetSpec { plugin: "stable".into(), validators: 2, ..Default::default() },
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: ApplyDevnetRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn exec_timeout_defaults() {
        let req: ExecInNodeRequest = serde_json::from_str(
            r#"{"namespace":"default","devnet":"d1","index":0,"argv":["stabled","version"]}"#,
        )
        .unwrap();
        assert_eq!(req.timeout_seconds, 30);
    }
}
