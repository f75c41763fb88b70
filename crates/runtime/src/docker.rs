//! Docker backend: run nodes as containers via the docker CLI.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devnet_log::LogBus;
use devnet_plugin::CommandSpec;
use devnet_primitives::{LogStream, NodePhase};
use devnet_utils::run_command;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::slot::{self, SlotMap};
use crate::{ExecResult, NodeContext, NodeRuntime, RuntimeError, RuntimeStatus, STOP_GRACE};

/// Base image node containers run on; the built binary is bind-mounted in.
pub const DEFAULT_IMAGE: &str = "debian:bookworm-slim";

const CONTAINER_BINARY_DIR: &str = "/usr/local/bin";

/// Runs nodes as docker containers, identified by container id.
pub struct DockerRuntime {
    bus: Arc<LogBus>,
    nodes: SlotMap,
}

impl DockerRuntime {
    pub fn new(bus: Arc<LogBus>) -> Self {
        Self { bus, nodes: SlotMap::default() }
    }

    fn container_name(ctx: &NodeContext) -> String {
        format!("dvb-{}", ctx.runtime_key())
    }

    fn mounted_binary(ctx: &NodeContext) -> String {
        let file = ctx
            .binary_path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "node".to_string());
        format!("{CONTAINER_BINARY_DIR}/{file}")
    }

    async fn docker(
        &self,
        args: Vec<String>,
        context: &str,
    ) -> Result<devnet_utils::CommandOutput, RuntimeError> {
        let spec = CommandSpec::new("docker").args(args);
        let cwd = std::env::temp_dir();
        let out = run_command(&spec, &cwd, &CancellationToken::new(), |_| {}).await?;
        if !out.success {
            return Err(RuntimeError::Backend {
                context: context.to_string(),
                stderr: out.stderr(),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl NodeRuntime for DockerRuntime {
    async fn start(&self, ctx: &NodeContext) -> Result<RuntimeStatus, RuntimeError> {
        let slot = self.nodes.get_or_insert(&ctx.runtime_key());
        let _guard = slot.op_lock.lock().await;

        {
            let mut state = slot.state.lock();
            if state.is_live() {
                return Ok(state.status());
            }
            state.phase = Some(NodePhase::Starting);
            state.stop_requested = false;
            state.message = String::new();
        }

        let name = Self::container_name(ctx);
        // A previous container with this name may linger after a crash.
        let _ = self.docker(vec!["rm".into(), "-f".into(), name.clone()], "docker rm").await;

        let home = ctx.home.display().to_string();
        let binary = Self::mounted_binary(ctx);

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.clone(),
            "-v".into(),
            format!("{home}:{home}"),
            "-v".into(),
            format!("{}:{binary}:ro", ctx.binary_path.display()),
            "-w".into(),
            home.clone(),
        ];
        for (host_port, container_port) in [
            (ctx.rpc_port, devnet_plugin::RPC_PORT_BASE),
            (ctx.p2p_port, devnet_plugin::P2P_PORT_BASE),
            (ctx.rest_port, devnet_plugin::REST_PORT_BASE),
            (ctx.grpc_port, devnet_plugin::GRPC_PORT_BASE),
        ] {
            args.push("-p".into());
            args.push(format!("{}:{host_port}:{container_port}", ctx.host));
        }
        for (key, value) in &ctx.command.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(DEFAULT_IMAGE.into());
        args.push(binary);
        args.extend(ctx.command.args.iter().cloned());

        let out = self.docker(args, "docker run").await?;
        let container_id = out.stdout.trim().to_string();
        if container_id.is_empty() {
            return Err(RuntimeError::Backend {
                context: "docker run".to_string(),
                stderr: "no container id returned".to_string(),
            });
        }

        {
            let mut state = slot.state.lock();
            state.phase = Some(NodePhase::Running);
            state.container_id = Some(container_id.clone());
        }

        // Log pump: follow the container's output into the bus and log file.
        let log_file = slot::open_log_file(&ctx.home)?;
        let mut logs_cmd = Command::new("docker");
        logs_cmd
            .args(["logs", "-f", "--tail", "0", &container_id])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        match logs_cmd.spawn() {
            Ok(mut child) => {
                let stdout = BufReader::new(child.stdout.take().expect("stdout piped"));
                let stderr = BufReader::new(child.stderr.take().expect("stderr piped"));
                tokio::spawn(slot::pump_lines(
                    stdout,
                    LogStream::Stdout,
                    self.bus.clone(),
                    ctx.bus_key(),
                    log_file.clone(),
                ));
                tokio::spawn(slot::pump_lines(
                    stderr,
                    LogStream::Stderr,
                    self.bus.clone(),
                    ctx.bus_key(),
                    log_file,
                ));
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
            }
            Err(err) => warn!(target: "runtime", %err, "Failed to attach container logs."),
        }

        // Monitor: `docker wait` blocks until the container exits.
        let monitor_slot = slot.clone();
        let wait_id = container_id.clone();
        let node = ctx.node.clone();
        tokio::spawn(async move {
            let mut cmd = Command::new("docker");
            cmd.args(["wait", &wait_id]).stdout(std::process::Stdio::piped());
            let description = match cmd.output().await {
                Ok(out) => {
                    let code = String::from_utf8_lossy(&out.stdout).trim().to_string();
                    format!("container exited with code {code}")
                }
                Err(err) => format!("container wait failed: {err}"),
            };
            slot::record_exit(&monitor_slot, description);
            debug!(target: "runtime", %node, "Node container exited.");
        });

        info!(target: "runtime", node = %ctx.node, container = %container_id, "Node started.");
        let status = slot.state.lock().status();
        Ok(status)
    }

    async fn stop(&self, ctx: &NodeContext, graceful: bool) -> Result<RuntimeStatus, RuntimeError> {
        let Some(slot) = self.nodes.get(&ctx.runtime_key()) else {
            return Ok(RuntimeStatus { phase: Some(NodePhase::Stopped), ..Default::default() });
        };
        let _guard = slot.op_lock.lock().await;

        let container_id = {
            let mut state = slot.state.lock();
            if !state.is_live() {
                state.phase = Some(NodePhase::Stopped);
                return Ok(state.status());
            }
            state.stop_requested = true;
            state.phase = Some(NodePhase::Stopping);
            state.container_id.clone()
        };

        if let Some(id) = container_id {
            let result = if graceful {
                let grace = STOP_GRACE.as_secs().to_string();
                self.docker(vec!["stop".into(), "-t".into(), grace, id.clone()], "docker stop")
                    .await
            } else {
                self.docker(vec!["kill".into(), id.clone()], "docker kill").await
            };
            if let Err(err) = result {
                warn!(target: "runtime", node = %ctx.node, %err, "Container stop failed.");
            }
        }

        let mut state = slot.state.lock();
        state.phase = Some(NodePhase::Stopped);
        info!(target: "runtime", node = %ctx.node, "Node stopped.");
        Ok(state.status())
    }

    async fn restart(&self, ctx: &NodeContext) -> Result<RuntimeStatus, RuntimeError> {
        self.stop(ctx, true).await?;
        self.start(ctx).await
    }

    async fn status(&self, ctx: &NodeContext) -> Result<RuntimeStatus, RuntimeError> {
        match self.nodes.get(&ctx.runtime_key()) {
            Some(slot) => Ok(slot.state.lock().status()),
            None => Ok(RuntimeStatus::default()),
        }
    }

    async fn exec(
        &self,
        ctx: &NodeContext,
        argv: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecResult, RuntimeError> {
        let container_id = self
            .nodes
            .get(&ctx.runtime_key())
            .and_then(|slot| {
                let state = slot.state.lock();
                (state.phase == Some(NodePhase::Running)).then(|| state.container_id.clone())
            })
            .flatten()
            .ok_or_else(|| RuntimeError::NotRunning { node: ctx.node.clone() })?;

        if argv.is_empty() {
            return Err(RuntimeError::Backend {
                context: "exec".to_string(),
                stderr: "empty argv".to_string(),
            });
        }

        let mut args: Vec<String> = vec!["exec".into(), container_id];
        args.extend(argv);

        let spec = CommandSpec::new("docker").args(args);
        let cancel = CancellationToken::new();
        let cwd = std::env::temp_dir();

        let out = tokio::time::timeout(timeout, run_command(&spec, &cwd, &cancel, |_| {}))
            .await
            .map_err(|_| {
                cancel.cancel();
                RuntimeError::ExecTimeout { timeout }
            })??;

        Ok(ExecResult {
            stdout: out.stdout.clone(),
            stderr: out.stderr(),
            exit_code: out.code.unwrap_or(-1),
        })
    }

    fn logs(
        &self,
        ctx: &NodeContext,
        tail: Option<usize>,
    ) -> devnet_log::Subscription<devnet_primitives::LogLine> {
        self.bus.subscribe_node(&ctx.bus_key(), tail)
    }

    async fn cleanup(&self) -> Result<(), RuntimeError> {
        for (key, slot) in self.nodes.snapshot() {
            let container_id = {
                let mut state = slot.state.lock();
                state.stop_requested = true;
                state.container_id.clone()
            };
            if let Some(id) = container_id {
                debug!(target: "runtime", node = %key, container = %id, "Removing leftover container.");
                let _ = self.docker(vec!["rm".into(), "-f".into(), id], "docker rm").await;
            }
        }
        Ok(())
    }
}
