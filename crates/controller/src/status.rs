//! Pure derivation of devnet phase and conditions from observed state.

use devnet_primitives::condition::set_condition;
use devnet_primitives::{
    Condition, ConditionStatus, ConditionType, DesiredPhase, Devnet, DevnetPhase,
};

/// Everything phase derivation looks at.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseInputs {
    pub provisioning: bool,
    pub provisioned: bool,
    pub provision_failed: bool,
    /// An explicit stop arrived, possibly before any node materialized.
    pub halted: bool,
    pub nodes: u32,
    pub ready_nodes: u32,
    pub all_desired_stopped: bool,
}

/// Maps observed state onto the devnet phase.
///
/// An explicit stop wins over everything: a devnet whose nodes are all
/// desired-stopped reports `Stopped` even while individual nodes are still
/// winding down. A successfully provisioned devnet with zero ready nodes is
/// `Failed`, not `Degraded`; `Degraded` requires at least one ready node.
pub fn derive_phase(inputs: PhaseInputs) -> DevnetPhase {
    if inputs.all_desired_stopped && inputs.nodes > 0 {
        return DevnetPhase::Stopped;
    }
    // Stopped while provisioning was still materializing the node set.
    if inputs.halted && inputs.nodes == 0 && !inputs.provisioning {
        return DevnetPhase::Stopped;
    }
    if inputs.provisioning {
        return DevnetPhase::Provisioning;
    }
    if inputs.provision_failed {
        return DevnetPhase::Failed;
    }
    if !inputs.provisioned || inputs.nodes == 0 {
        return DevnetPhase::Pending;
    }
    if inputs.ready_nodes == inputs.nodes {
        return DevnetPhase::Running;
    }
    if inputs.ready_nodes > 0 {
        return DevnetPhase::Degraded;
    }
    DevnetPhase::Failed
}

/// Recomputes node counts, phase and conditions on a devnet in place.
/// The caller (the reconcile task) is the only writer.
pub fn refresh_status(devnet: &mut Devnet, inputs_base: PhaseInputs) {
    let nodes = devnet.nodes.len() as u32;
    let ready_nodes = devnet.nodes.iter().filter(|n| n.is_ready()).count() as u32;
    let all_desired_stopped =
        nodes > 0 && devnet.nodes.iter().all(|n| n.spec.desired_phase == DesiredPhase::Stopped);

    let inputs = PhaseInputs { nodes, ready_nodes, all_desired_stopped, ..inputs_base };
    let phase = derive_phase(inputs);

    devnet.status.nodes = nodes;
    devnet.status.ready_nodes = ready_nodes;
    devnet.status.phase = phase;
    devnet.status.current_height =
        devnet.nodes.iter().map(|n| n.status.block_height).max().unwrap_or(0);

    let ready = ready_nodes == nodes && nodes > 0;
    set_condition(
        &mut devnet.status.conditions,
        if ready {
            Condition::new(ConditionType::Ready, ConditionStatus::True, "AllNodesReady", "")
        } else {
            Condition::new(
                ConditionType::Ready,
                ConditionStatus::False,
                "NodesNotReady",
                format!("{ready_nodes}/{nodes} nodes ready"),
            )
        },
    );
    set_condition(
        &mut devnet.status.conditions,
        if inputs.provisioning {
            Condition::new(ConditionType::Progressing, ConditionStatus::True, "Provisioning", "")
        } else {
            Condition::new(ConditionType::Progressing, ConditionStatus::False, "Idle", "")
        },
    );
}
