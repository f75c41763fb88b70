//! Per-node supervision state shared by both backends.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use devnet_log::LogBus;
use devnet_primitives::{LogLine, LogStream, NodePhase};
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::warn;

use crate::RuntimeStatus;

/// Supervision record for one node.
///
/// `op_lock` serializes state transitions (start/stop/restart) per node;
/// `state` is the small shared snapshot the monitor task and readers touch.
#[derive(Debug, Default)]
pub(crate) struct Slot {
    pub op_lock: tokio::sync::Mutex<()>,
    pub state: Mutex<SlotState>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct SlotState {
    pub phase: Option<NodePhase>,
    pub pid: Option<u32>,
    pub container_id: Option<String>,
    pub restart_count: u32,
    pub stop_requested: bool,
    pub message: String,
}

impl SlotState {
    pub fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            phase: self.phase,
            pid: self.pid,
            container_id: self.container_id.clone(),
            restart_count: self.restart_count,
            message: self.message.clone(),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.phase, Some(NodePhase::Starting | NodePhase::Running))
    }
}

/// Marks the slot's process as exited.
///
/// An exit while a stop was requested is a normal stop; anything else is an
/// observed crash and bumps the restart counter.
pub(crate) fn record_exit(slot: &Slot, exit_description: String) {
    let mut state = slot.state.lock();
    if state.stop_requested {
        state.phase = Some(NodePhase::Stopped);
        state.message = String::new();
    } else {
        state.phase = Some(NodePhase::Crashed);
        state.restart_count += 1;
        state.message = exit_description;
    }
    state.pid = None;
}

#[derive(Debug, Default)]
pub(crate) struct SlotMap {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl SlotMap {
    pub fn get_or_insert(&self, key: &str) -> Arc<Slot> {
        self.slots.lock().entry(key.to_string()).or_default().clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Slot>> {
        self.slots.lock().get(key).cloned()
    }

    pub fn snapshot(&self) -> Vec<(String, Arc<Slot>)> {
        self.slots.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Pumps one output stream into the node's log file and bus channel,
/// preserving line boundaries and stamping each line monotonically.
pub(crate) async fn pump_lines<R>(
    reader: R,
    stream: LogStream,
    bus: Arc<LogBus>,
    bus_key: String,
    log_file: Arc<Mutex<std::fs::File>>,
) where
    R: AsyncBufRead + Unpin,
{
    use std::io::Write;

    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let entry = LogLine::new(stream, line);
                {
                    let mut file = log_file.lock();
                    let _ = writeln!(
                        file,
                        "{} [{}] {}",
                        entry.timestamp.to_rfc3339(),
                        entry.stream,
                        entry.message
                    );
                }
                bus.publish_node_line(&bus_key, entry);
            }
            Ok(None) => break,
            Err(err) => {
                warn!(target: "runtime", %err, "Log pump read error.");
                break;
            }
        }
    }
}

/// Opens the node's on-disk log file for appending.
pub(crate) fn open_log_file(home: &Path) -> std::io::Result<Arc<Mutex<std::fs::File>>> {
    let file = std::fs::OpenOptions::new().create(true).append(true).open(home.join("node.log"))?;
    Ok(Arc::new(Mutex::new(file)))
}
