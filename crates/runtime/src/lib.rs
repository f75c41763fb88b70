//! Node runtime supervision.
//!
//! Owns the lifecycle of the processes (or containers) implementing a
//! devnet's nodes. Two backends hide behind one [`NodeRuntime`] interface:
//! the process backend forks the chain binary directly and tracks PIDs, the
//! docker backend drives the docker CLI and tracks container ids. Callers
//! select a backend by devnet mode once and never branch again.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod docker;
mod init;
mod process;
mod slot;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devnet_log::LogBus;
use devnet_plugin::CommandSpec;
use devnet_primitives::{LogLine, Mode, NodePhase};
pub use docker::DockerRuntime;
pub use init::{Initializer, KeyInfo, TEST_MNEMONICS};
pub use process::ProcessRuntime;

/// Grace window between the polite stop signal and the hard kill.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("node {node} is not running")]
    NotRunning { node: String },

    #[error("exec timed out after {timeout:?}")]
    ExecTimeout { timeout: Duration },

    #[error("{context}: {stderr}")]
    Backend { context: String, stderr: String },

    #[error("init verification failed: expected {path} to exist")]
    InitVerification { path: PathBuf },

    #[error(transparent)]
    Command(#[from] devnet_utils::CommandError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Everything a backend needs to know about one node.
///
/// The context references its devnet by name, never by pointer; the
/// controller resolves it fresh for every operation.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub namespace: String,
    pub devnet: String,
    /// External node name, `<role>-<index>`.
    pub node: String,
    pub index: u32,
    /// The node's home directory.
    pub home: PathBuf,
    /// Fully resolved command to run the node; the program is an absolute
    /// path for the process backend and an in-container path for docker.
    pub command: CommandSpec,
    /// Host address the node binds to (loopback unless the spec overrides).
    pub host: String,
    pub rpc_port: u16,
    pub p2p_port: u16,
    pub rest_port: u16,
    pub grpc_port: u16,
    /// Path of the built chain binary on the host.
    pub binary_path: PathBuf,
}

impl NodeContext {
    /// Key of this node's channel on the log bus.
    pub fn bus_key(&self) -> String {
        LogBus::node_key(&self.namespace, &self.devnet, self.index)
    }

    /// Identity used for container names and supervision map keys.
    pub fn runtime_key(&self) -> String {
        format!("{}-{}-{}", self.namespace, self.devnet, self.node)
    }
}

/// Observed runtime state of one node, as the backend sees it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuntimeStatus {
    pub phase: Option<NodePhase>,
    pub pid: Option<u32>,
    pub container_id: Option<String>,
    pub restart_count: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// The backend-neutral supervision interface.
#[async_trait]
pub trait NodeRuntime: Send + Sync {
    /// Starts the node. Idempotent: starting a running node is a no-op that
    /// returns the current status; starting a crashed node clears the crash.
    async fn start(&self, ctx: &NodeContext) -> Result<RuntimeStatus, RuntimeError>;

    /// Stops the node, politely first, then hard after [`STOP_GRACE`].
    async fn stop(&self, ctx: &NodeContext, graceful: bool) -> Result<RuntimeStatus, RuntimeError>;

    async fn restart(&self, ctx: &NodeContext) -> Result<RuntimeStatus, RuntimeError>;

    async fn status(&self, ctx: &NodeContext) -> Result<RuntimeStatus, RuntimeError>;

    /// Runs `argv` in the node's context. Denied unless the node is running.
    async fn exec(
        &self,
        ctx: &NodeContext,
        argv: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecResult, RuntimeError>;

    /// Live view over the node's merged stdout/stderr: a bounded replay of
    /// at most `tail` lines, then the live feed. Fan-out safe.
    fn logs(&self, ctx: &NodeContext, tail: Option<usize>) -> devnet_log::Subscription<LogLine>;

    /// Tears down everything this backend is still supervising.
    async fn cleanup(&self) -> Result<(), RuntimeError>;
}

/// Owns both backends and hands out the right one per devnet mode.
pub struct Runtime {
    process: Arc<ProcessRuntime>,
    docker: Arc<DockerRuntime>,
}

impl Runtime {
    pub fn new(bus: Arc<LogBus>) -> Self {
        Self {
            process: Arc::new(ProcessRuntime::new(bus.clone())),
            docker: Arc::new(DockerRuntime::new(bus)),
        }
    }

    pub fn for_mode(&self, mode: Mode) -> Arc<dyn NodeRuntime> {
        match mode {
            Mode::Local => self.process.clone(),
            Mode::Docker => self.docker.clone(),
        }
    }

    pub async fn cleanup(&self) -> Result<(), RuntimeError> {
        self.process.cleanup().await?;
        self.docker.cleanup().await?;
        Ok(())
    }
}
