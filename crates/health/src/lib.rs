//! Node health probing.
//!
//! Each node is probed over its RPC `/status` endpoint; the probe outcome is
//! combined with the node's lifecycle phase into one of the health statuses,
//! and consecutive failures are counted so the controller can distinguish a
//! blip from a crash.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use std::time::Duration;

use chrono::Utc;
use devnet_primitives::{HealthState, HealthStatus, NodePhase};
use tracing::trace;

/// Probe cadence while a devnet is provisioning or a node is starting.
pub const PROBE_INTERVAL_FAST: Duration = Duration::from_secs(2);
/// Probe cadence in steady state.
pub const PROBE_INTERVAL_STEADY: Duration = Duration::from_secs(5);
/// Consecutive failures after which a running node is considered crashed.
pub const FAILURE_THRESHOLD: u32 = 3;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// What one `/status` probe observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// 200 with a parseable block height.
    Responsive { height: u64, peers: u32 },
    /// 2xx but the body did not parse.
    Malformed,
    /// Non-2xx response.
    HttpError { status: u16 },
    /// Connection refused, reset or timed out.
    Unreachable,
}

/// Maps `(node phase, probe outcome)` onto a health status.
///
/// Lifecycle phases win over probe results: a node that is deliberately
/// stopped or still starting is never "unhealthy", whatever its socket does.
pub fn classify(phase: NodePhase, outcome: &ProbeOutcome) -> HealthStatus {
    match phase {
        NodePhase::Pending | NodePhase::Starting | NodePhase::Stopping => {
            HealthStatus::Transitioning
        }
        NodePhase::Stopped => HealthStatus::Stopped,
        NodePhase::Running | NodePhase::Crashed => match outcome {
            ProbeOutcome::Responsive { .. } => HealthStatus::Healthy,
            ProbeOutcome::Malformed
            | ProbeOutcome::HttpError { .. }
            | ProbeOutcome::Unreachable => HealthStatus::Unhealthy,
        },
    }
}

/// Folds a classified probe into the node's health state.
///
/// The failure streak grows only on `Unhealthy` and resets on any `Healthy`;
/// transitioning/stopped observations leave it untouched.
pub fn apply_probe(health: &mut HealthState, status: HealthStatus) {
    match status {
        HealthStatus::Healthy => health.consecutive_failures = 0,
        HealthStatus::Unhealthy => health.consecutive_failures += 1,
        HealthStatus::Stopped | HealthStatus::Transitioning | HealthStatus::Unknown => {}
    }
    health.status = status;
    health.last_check = Some(Utc::now());
}

/// True once the failure streak warrants flipping a running node to crashed.
pub fn exceeds_threshold(health: &HealthState) -> bool {
    health.consecutive_failures >= FAILURE_THRESHOLD
}

/// Probes node RPC endpoints over HTTP.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: reqwest::Client,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .expect("default client config is valid");
        Self { client }
    }

    /// Probes `GET http://<host>:<port>/status`.
    pub async fn probe(&self, host: &str, rpc_port: u16) -> ProbeOutcome {
        let url = format!("http://{host}:{rpc_port}/status");

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                trace!(target: "health", %url, %err, "Probe failed.");
                return ProbeOutcome::Unreachable;
            }
        };

        let status = response.status();
        if !status.is_success() {
            return ProbeOutcome::HttpError { status: status.as_u16() };
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(_) => return ProbeOutcome::Malformed,
        };

        match parse_status_body(&body) {
            Some((height, peers)) => ProbeOutcome::Responsive { height, peers },
            None => ProbeOutcome::Malformed,
        }
    }
}

/// Parses the comet `/status` body, with and without the JSON-RPC envelope.
fn parse_status_body(body: &[u8]) -> Option<(u64, u32)> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let sync_info =
        value.pointer("/result/sync_info").or_else(|| value.pointer("/sync_info"))?;

    let height = sync_info.get("latest_block_height")?;
    let height = match height {
        serde_json::Value::String(s) => s.parse().ok()?,
        serde_json::Value::Number(n) => n.as_u64()?,
        _ => return None,
    };

    let peers = value
        .pointer("/result/n_peers")
        .or_else(|| value.pointer("/n_peers"))
        .and_then(|v| v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_u64().map(|n| n as u32)))
        .unwrap_or(0);

    Some((height, peers))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(NodePhase::Pending, ProbeOutcome::Unreachable, HealthStatus::Transitioning)]
    #[case(NodePhase::Starting, ProbeOutcome::Responsive { height: 5, peers: 1 }, HealthStatus::Transitioning)]
    #[case(NodePhase::Stopping, ProbeOutcome::Unreachable, HealthStatus::Transitioning)]
    #[case(NodePhase::Stopped, ProbeOutcome::Unreachable, HealthStatus::Stopped)]
    #[case(NodePhase::Running, ProbeOutcome::Responsive { height: 5, peers: 1 }, HealthStatus::Healthy)]
    #[case(NodePhase::Running, ProbeOutcome::Malformed, HealthStatus::Unhealthy)]
    #[case(NodePhase::Running, ProbeOutcome::HttpError { status: 500 }, HealthStatus::Unhealthy)]
    #[case(NodePhase::Running, ProbeOutcome::Unreachable, HealthStatus::Unhealthy)]
    #[case(NodePhase::Crashed, ProbeOutcome::Responsive { height: 5, peers: 0 }, HealthStatus::Healthy)]
    fn classification_table(
        #[case] phase: NodePhase,
        #[case] outcome: ProbeOutcome,
        #[case] expected: HealthStatus,
    ) {
        assert_eq!(classify(phase, &outcome), expected);
    }

    #[test]
    fn failure_streak_grows_and_resets() {
        let mut health = HealthState::default();

        apply_probe(&mut health, HealthStatus::Unhealthy);
        apply_probe(&mut health, HealthStatus::Unhealthy);
        assert_eq!(health.consecutive_failures, 2);
        assert!(!exceeds_threshold(&health));

        apply_probe(&mut health, HealthStatus::Healthy);
        assert_eq!(health.consecutive_failures, 0);

        for _ in 0..FAILURE_THRESHOLD {
            apply_probe(&mut health, HealthStatus::Unhealthy);
        }
        assert!(exceeds_threshold(&health));
    }

    #[test]
    fn transitioning_probes_leave_the_streak_alone() {
        let mut health = HealthState::default();
        apply_probe(&mut health, HealthStatus::Unhealthy);
        apply_probe(&mut health, HealthStatus::Transitioning);
        assert_eq!(health.consecutive_failures, 1);
        assert_eq!(health.status, HealthStatus::Transitioning);
    }

    #[test]
    fn status_body_parsing_accepts_both_envelopes() {
        let enveloped = serde_json::json!({
            "result": { "sync_info": { "latest_block_height": "42" } }
        });
        let bare = serde_json::json!({ "sync_info": { "latest_block_height": 7 } });

        assert_eq!(
            parse_status_body(&serde_json::to_vec(&enveloped).unwrap()),
            Some((42, 0))
        );
        assert_eq!(parse_status_body(&serde_json::to_vec(&bare).unwrap()), Some((7, 0)));
        assert_eq!(parse_status_body(b"{}"), None);
        assert_eq!(parse_status_body(b"garbage"), None);
    }
}
