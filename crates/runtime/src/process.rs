//! Process backend: fork/exec the chain binary directly.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devnet_log::LogBus;
use devnet_plugin::CommandSpec;
use devnet_primitives::{LogStream, NodePhase};
use devnet_utils::run_command;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::slot::{self, Slot, SlotMap};
use crate::{ExecResult, NodeContext, NodeRuntime, RuntimeError, RuntimeStatus, STOP_GRACE};

const PID_FILE: &str = "node.pid";

/// Runs nodes as host processes, identified by PID.
pub struct ProcessRuntime {
    bus: Arc<LogBus>,
    nodes: SlotMap,
}

impl ProcessRuntime {
    pub fn new(bus: Arc<LogBus>) -> Self {
        Self { bus, nodes: SlotMap::default() }
    }

    fn resolve_program(&self, ctx: &NodeContext) -> String {
        // The orchestrator hands over the bare binary name; the process
        // backend runs the cached build product directly.
        if ctx.command.program.contains('/') {
            ctx.command.program.clone()
        } else {
            ctx.binary_path.display().to_string()
        }
    }

    async fn wait_for_exit(&self, slot: &Slot, deadline: Duration) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            let exited = {
                let state = slot.state.lock();
                !state.is_live() && state.pid.is_none()
            };
            if exited {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        !slot.state.lock().is_live()
    }
}

#[async_trait]
impl NodeRuntime for ProcessRuntime {
    async fn start(&self, ctx: &NodeContext) -> Result<RuntimeStatus, RuntimeError> {
        let slot = self.nodes.get_or_insert(&ctx.runtime_key());
        let _guard = slot.op_lock.lock().await;

        {
            let mut state = slot.state.lock();
            if state.is_live() {
                // Idempotent: a running node stays untouched.
                return Ok(state.status());
            }
            // Starting a crashed node clears the crash.
            state.phase = Some(NodePhase::Starting);
            state.stop_requested = false;
            state.message = String::new();
        }

        let program = self.resolve_program(ctx);
        debug!(target: "runtime", node = %ctx.node, %program, "Starting node process.");

        let mut cmd = Command::new(&program);
        cmd.args(&ctx.command.args)
            .envs(ctx.command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&ctx.home)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|err| RuntimeError::Backend {
                context: format!("spawn {program}"),
                stderr: err.to_string(),
            })?;

        let pid = child.id().unwrap_or_default();
        std::fs::write(ctx.home.join(PID_FILE), pid.to_string())?;

        let log_file = slot::open_log_file(&ctx.home)?;
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

        {
            let mut state = slot.state.lock();
            state.phase = Some(NodePhase::Running);
            state.pid = Some(pid);
        }

        // Monitor: observe the process exit and classify it.
        let monitor_slot = slot.clone();
        let pid_file = ctx.home.join(PID_FILE);
        let node = ctx.node.clone();
        tokio::spawn(async move {
            let description = match child.wait().await {
                Ok(status) => format!("process exited: {status}"),
                Err(err) => format!("process wait failed: {err}"),
            };
            slot::record_exit(&monitor_slot, description);
            let _ = std::fs::remove_file(pid_file);
            debug!(target: "runtime", %node, "Node process exited.");
        });

        info!(target: "runtime", node = %ctx.node, %pid, "Node started.");
        let status = slot.state.lock().status();
        Ok(status)
    }

    async fn stop(&self, ctx: &NodeContext, graceful: bool) -> Result<RuntimeStatus, RuntimeError> {
        let Some(slot) = self.nodes.get(&ctx.runtime_key()) else {
            return Ok(RuntimeStatus { phase: Some(NodePhase::Stopped), ..Default::default() });
        };
        let _guard = slot.op_lock.lock().await;

        let pid = {
            let mut state = slot.state.lock();
            if !state.is_live() {
                state.phase = Some(NodePhase::Stopped);
                return Ok(state.status());
            }
            state.stop_requested = true;
            state.phase = Some(NodePhase::Stopping);
            state.pid
        };

        if let Some(pid) = pid {
            let pid = Pid::from_raw(pid as i32);
            if graceful {
                let _ = kill(pid, Signal::SIGTERM);
                if !self.wait_for_exit(&slot, STOP_GRACE).await {
                    let _ = kill(pid, Signal::SIGKILL);
                    self.wait_for_exit(&slot, Duration::from_secs(2)).await;
                }
            } else {
                let _ = kill(pid, Signal::SIGKILL);
                self.wait_for_exit(&slot, Duration::from_secs(2)).await;
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
        let running = self
            .nodes
            .get(&ctx.runtime_key())
            .map(|slot| slot.state.lock().phase == Some(NodePhase::Running))
            .unwrap_or(false);
        if !running {
            return Err(RuntimeError::NotRunning { node: ctx.node.clone() });
        }

        let Some((program, args)) = argv.split_first() else {
            return Err(RuntimeError::Backend {
                context: "exec".to_string(),
                stderr: "empty argv".to_string(),
            });
        };

        // The node's own binary is addressed by bare name; everything else
        // must resolve through PATH.
        let program = if program == &ctx.command.program || *program == ctx.binary_path.file_name().map(|f| f.to_string_lossy().to_string()).unwrap_or_default() {
            ctx.binary_path.display().to_string()
        } else {
            program.clone()
        };

        let spec = CommandSpec::new(program).args(args.iter().cloned());
        let cancel = CancellationToken::new();

        let out = tokio::time::timeout(timeout, run_command(&spec, &ctx.home, &cancel, |_| {}))
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
            let pid = {
                let mut state = slot.state.lock();
                state.stop_requested = true;
                state.pid
            };
            if let Some(pid) = pid {
                debug!(target: "runtime", node = %key, %pid, "Killing leftover node process.");
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use devnet_log::SubscriptionEvent;

    use super::*;

    fn ctx(home: &std::path::Path, script: &str) -> NodeContext {
        NodeContext {
            namespace: "default".into(),
            devnet: "d1".into(),
            node: "validator-0".into(),
            index: 0,
            home: home.to_path_buf(),
            command: CommandSpec::new("/bin/sh").args(["-c", script]),
            host: "127.0.0.1".into(),
            rpc_port: 26657,
            p2p_port: 26656,
            rest_port: 1317,
            grpc_port: 9090,
            binary_path: "/bin/sh".into(),
        }
    }

    async fn wait_for_phase(
        rt: &ProcessRuntime,
        ctx: &NodeContext,
        phase: NodePhase,
    ) -> RuntimeStatus {
        for _ in 0..100 {
            let status = rt.status(ctx).await.unwrap();
            if status.phase == Some(phase) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("node never reached {phase}");
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let home = tempfile::tempdir().unwrap();
        let rt = ProcessRuntime::new(Arc::new(LogBus::new()));
        let ctx = ctx(home.path(), "sleep 30");

        let first = rt.start(&ctx).await.unwrap();
        assert_eq!(first.phase, Some(NodePhase::Running));
        let pid = first.pid.unwrap();

        let second = rt.start(&ctx).await.unwrap();
        assert_eq!(second.pid, Some(pid), "second start must not spawn a new process");

        rt.stop(&ctx, false).await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_crash_keeps_restart_count() {
        let home = tempfile::tempdir().unwrap();
        let rt = ProcessRuntime::new(Arc::new(LogBus::new()));
        let ctx = ctx(home.path(), "sleep 30");

        rt.start(&ctx).await.unwrap();
        let status = rt.stop(&ctx, true).await.unwrap();
        assert_eq!(status.phase, Some(NodePhase::Stopped));
        assert_eq!(status.restart_count, 0, "requested stop is not a crash");
    }

    #[tokio::test]
    async fn unexpected_exit_is_a_crash() {
        let home = tempfile::tempdir().unwrap();
        let rt = ProcessRuntime::new(Arc::new(LogBus::new()));
        let ctx = ctx(home.path(), "exit 7");

        rt.start(&ctx).await.unwrap();
        let status = wait_for_phase(&rt, &ctx, NodePhase::Crashed).await;
        assert_eq!(status.restart_count, 1);
        assert!(status.message.contains("exited"));

        // Restarting a crashed node clears the crash flag.
        let ctx_ok = NodeContext {
            command: CommandSpec::new("/bin/sh").args(["-c", "sleep 30"]),
            ..ctx.clone()
        };
        let status = rt.start(&ctx_ok).await.unwrap();
        assert_eq!(status.phase, Some(NodePhase::Running));
        rt.stop(&ctx_ok, false).await.unwrap();
    }

    #[tokio::test]
    async fn node_output_reaches_bus_and_log_file() {
        let home = tempfile::tempdir().unwrap();
        let bus = Arc::new(LogBus::new());
        let rt = ProcessRuntime::new(bus.clone());
        let ctx = ctx(home.path(), "echo ready; sleep 30");

        let mut sub = bus.subscribe_node(&ctx.bus_key(), Some(0));
        rt.start(&ctx).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap();
        assert_matches!(event, SubscriptionEvent::Entry(line) if line.message == "ready");

        // The same line landed in the on-disk log.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let disk = std::fs::read_to_string(home.path().join("node.log")).unwrap();
        assert!(disk.contains("ready"));

        rt.stop(&ctx, false).await.unwrap();
    }

    #[tokio::test]
    async fn exec_is_denied_unless_running() {
        let home = tempfile::tempdir().unwrap();
        let rt = ProcessRuntime::new(Arc::new(LogBus::new()));
        let ctx = ctx(home.path(), "sleep 30");

        let err = rt.exec(&ctx, vec!["echo".into(), "hi".into()], Duration::from_secs(5)).await;
        assert_matches!(err, Err(RuntimeError::NotRunning { .. }));

        rt.start(&ctx).await.unwrap();
        let out = rt.exec(&ctx, vec!["echo".into(), "hi".into()], Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "hi\n");

        rt.stop(&ctx, false).await.unwrap();
    }
}
