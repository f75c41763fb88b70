//! The devnet control plane: provisioning orchestrator, per-devnet
//! reconcile loop and status aggregation.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod controller;
mod nodes;
mod provisioner;
mod status;
mod store;

pub use controller::{ControllerConfig, DevnetController, RuntimeProvider};
use devnet_primitives::devnet::InvalidSpec;
use devnet_primitives::NodePhase;
pub use nodes::{node_context, role_of_index};
pub use provisioner::{
    EventSink, Provision, ProvisionError, ProvisionReport, ProvisionRequest, Provisioner,
    ProvisionerConfig,
};
pub use status::{derive_phase, refresh_status, PhaseInputs};
pub use store::{ApplyAction, DataDir, DevnetKey, DevnetRecord, ProvisionState, Store};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Validation(#[from] InvalidSpec),

    #[error(transparent)]
    Plugin(#[from] devnet_plugin::PluginError),

    #[error("devnet {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error("devnet {namespace}/{name} already exists")]
    AlreadyExists { namespace: String, name: String },

    #[error("node {index} not found")]
    NodeNotFound { index: u32 },

    #[error("node {index} is {phase}, not Running")]
    NodeNotRunning { index: u32, phase: NodePhase },

    #[error(transparent)]
    Runtime(#[from] devnet_runtime::RuntimeError),
}
