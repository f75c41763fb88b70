use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The phases of a provisioning run, in execution order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
pub enum ProvisionPhase {
    Building,
    Forking,
    Initializing,
    Starting,
    HealthChecking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

/// Progress of one step within a provisioning phase.
///
/// Byte-progress steps (downloads) carry `unit = "bytes"` and monotonically
/// non-decreasing `current`; the final event of a successful step has
/// `current == total` when the total is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEvent {
    pub step_name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_current: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_total: Option<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    /// Transfer speed rendered by the producer, eg. `1.2 MB/s`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub speed: String,
}

impl StepEvent {
    pub fn running(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Running,
            progress_current: None,
            progress_total: None,
            unit: String::new(),
            detail: String::new(),
            speed: String::new(),
        }
    }

    pub fn completed(step_name: impl Into<String>) -> Self {
        Self { status: StepStatus::Completed, ..Self::running(step_name) }
    }

    pub fn failed(step_name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { status: StepStatus::Failed, detail: detail.into(), ..Self::running(step_name) }
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn progress(mut self, current: u64, total: Option<u64>, unit: impl Into<String>) -> Self {
        self.progress_current = Some(current);
        self.progress_total = total;
        self.unit = unit.into();
        self
    }
}

/// One entry in a provisioning run's log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ProvisionPhase>,
    #[serde(flatten)]
    pub step: Option<StepEvent>,
}

impl ProvisionLogEntry {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level: "info".to_string(),
            message: message.into(),
            phase: None,
            step: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { level: "error".to_string(), ..Self::info(message) }
    }

    pub fn phase(mut self, phase: ProvisionPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn step(mut self, step: StepEvent) -> Self {
        self.step = Some(step);
        self
    }
}

/// Which of the node's output streams a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One line of node output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub message: String,
}

impl LogLine {
    pub fn new(stream: LogStream, message: impl Into<String>) -> Self {
        Self { timestamp: Utc::now(), stream, message: message.into() }
    }
}
