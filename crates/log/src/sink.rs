use std::sync::Arc;

use devnet_primitives::{ProvisionLogEntry, ProvisionPhase, StepEvent};

use crate::LogBus;

/// Where provisioning steps report their progress.
///
/// Implemented by the bus-backed sink in production and by collecting fakes
/// in tests; leaf subsystems (builder, forker) only ever see this trait.
pub trait StepSink: Send + Sync {
    fn emit(&self, entry: ProvisionLogEntry);

    fn step(&self, phase: ProvisionPhase, step: StepEvent) {
        self.emit(ProvisionLogEntry::info(step.step_name.clone()).phase(phase).step(step));
    }
}

/// Publishes step events onto a devnet's provisioning channel.
pub struct BusSink {
    bus: Arc<LogBus>,
    key: String,
}

impl BusSink {
    pub fn new(bus: Arc<LogBus>, key: impl Into<String>) -> Self {
        Self { bus, key: key.into() }
    }
}

impl StepSink for BusSink {
    fn emit(&self, entry: ProvisionLogEntry) {
        self.bus.publish_provision(&self.key, entry);
    }
}

/// Discards everything. For callers that do not care about progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl StepSink for NullSink {
    fn emit(&self, _entry: ProvisionLogEntry) {}
}
