//! The per-devnet reconcile loop.
//!
//! One task per devnet consumes triggers (RPC mutations, provisioning
//! completion, health transitions, a coarse periodic tick) and converges the
//! observed node set onto the spec. Reconciles for one devnet are serialized
//! by the task; different devnets reconcile concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use devnet_health::{apply_probe, classify, exceeds_threshold, HealthChecker, ProbeOutcome};
use devnet_log::LogBus;
use devnet_plugin::PluginRegistry;
use devnet_primitives::event::append_event;
use devnet_primitives::{
    DesiredPhase, Devnet, DevnetName, DevnetPhase, DevnetSpec, Event, HealthState, Mode, Namespace,
    Node, NodePhase,
};
use devnet_runtime::{ExecResult, NodeContext, NodeRuntime};
use devnet_tasks::TaskSpawner;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::nodes::{node_context, role_of_index};
use crate::provisioner::{Provision, ProvisionError, ProvisionReport, ProvisionRequest};
use crate::status::{refresh_status, PhaseInputs};
use crate::store::{ApplyAction, DataDir, DevnetKey, DevnetRecord, Store};
use crate::ControllerError;

const COMPONENT: &str = "controller";

/// Hands out the runtime backend for a devnet mode. Trait-shaped so the
/// reconcile loop can be exercised against a fake runtime.
pub trait RuntimeProvider: Send + Sync {
    fn for_mode(&self, mode: Mode) -> Arc<dyn NodeRuntime>;
}

impl RuntimeProvider for devnet_runtime::Runtime {
    fn for_mode(&self, mode: Mode) -> Arc<dyn NodeRuntime> {
        devnet_runtime::Runtime::for_mode(self, mode)
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Coarse periodic reconcile tick.
    pub reconcile_interval: Duration,
    /// Restart budget for a crashing node while desired Running.
    pub max_restarts: u32,
    pub health_interval_fast: Duration,
    pub health_interval_steady: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(10),
            max_restarts: 5,
            health_interval_fast: devnet_health::PROBE_INTERVAL_FAST,
            health_interval_steady: devnet_health::PROBE_INTERVAL_STEADY,
        }
    }
}

#[derive(Debug)]
enum Trigger {
    /// Spec or desired state changed through the RPC surface.
    Mutated,
    /// A provisioning run finished.
    ProvisionFinished(Result<ProvisionReport, ProvisionError>),
    /// A health transition worth reacting to (crash threshold, ready flip).
    Health,
}

struct DevnetTask {
    tx: mpsc::UnboundedSender<Trigger>,
    cancel: CancellationToken,
}

/// The devnet controller: owns every devnet record and its reconcile task.
pub struct DevnetController {
    inner: Arc<Inner>,
}

struct Inner {
    store: Store,
    registry: PluginRegistry,
    provisioner: Arc<dyn Provision>,
    runtime: Arc<dyn RuntimeProvider>,
    health: HealthChecker,
    bus: Arc<LogBus>,
    data_dir: DataDir,
    spawner: TaskSpawner,
    config: ControllerConfig,
    tasks: Mutex<HashMap<DevnetKey, DevnetTask>>,
}

impl DevnetController {
    pub fn new(
        registry: PluginRegistry,
        provisioner: Arc<dyn Provision>,
        runtime: Arc<dyn RuntimeProvider>,
        bus: Arc<LogBus>,
        data_dir: DataDir,
        spawner: TaskSpawner,
        config: ControllerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: Store::new(),
                registry,
                provisioner,
                runtime,
                health: HealthChecker::new(),
                bus,
                data_dir,
                spawner,
                config,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.inner.registry
    }

    // --- resource operations, called by the RPC surface

    /// Idempotent upsert; validation happens before any side effect.
    pub fn apply(
        &self,
        namespace: Namespace,
        name: DevnetName,
        spec: DevnetSpec,
    ) -> Result<(Devnet, ApplyAction), ControllerError> {
        let normalized = spec.normalized();
        normalized.validate()?;
        self.inner.registry.get(&normalized.plugin)?;

        let (record, action) = self.inner.store.apply(namespace.clone(), name.clone(), normalized);

        match action {
            ApplyAction::Created => {
                let mut devnet = record.devnet.write();
                append_event(
                    &mut devnet.status.events,
                    Event::normal("Created", "devnet registered", COMPONENT),
                );
            }
            ApplyAction::Configured => {
                warn!(target: "controller", %namespace, %name, "Spec overwritten by apply.");
                // A re-apply is the user-initiated retry path out of Failed
                // or an explicit stop.
                {
                    let mut provision = record.provision.write();
                    provision.failed = false;
                    provision.halted = false;
                }
                let mut devnet = record.devnet.write();
                append_event(
                    &mut devnet.status.events,
                    Event::normal("SpecChanged", "spec updated by apply", COMPONENT),
                );
            }
            ApplyAction::Unchanged => {}
        }

        if action != ApplyAction::Unchanged {
            self.ensure_task(&namespace, &name);
            self.trigger(&namespace, &name, Trigger::Mutated);
        } else {
            // First apply after a daemon restart still needs a task.
            self.ensure_task(&namespace, &name);
        }

        let devnet = record.devnet.read().clone();
        Ok((devnet, action))
    }

    /// Like [`Self::apply`], but refuses to overwrite an existing devnet.
    pub fn create(
        &self,
        namespace: Namespace,
        name: DevnetName,
        spec: DevnetSpec,
    ) -> Result<Devnet, ControllerError> {
        if self.inner.store.contains(&namespace, &name) {
            return Err(ControllerError::AlreadyExists {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        let (devnet, _) = self.apply(namespace, name, spec)?;
        Ok(devnet)
    }

    pub fn get(&self, namespace: &Namespace, name: &DevnetName) -> Result<Devnet, ControllerError> {
        let record = self.record(namespace, name)?;
        let devnet = record.devnet.read().clone();
        Ok(devnet)
    }

    /// Lists devnets; an empty namespace filter means all namespaces.
    pub fn list(&self, namespace: Option<&Namespace>) -> Vec<Devnet> {
        self.inner.store.list(namespace).iter().map(|r| r.devnet.read().clone()).collect()
    }

    /// Deletes a devnet. Node teardown happens before this returns; removal
    /// of the on-disk directory is finished in the background.
    pub async fn delete(
        &self,
        namespace: &Namespace,
        name: &DevnetName,
    ) -> Result<(), ControllerError> {
        let record = self.record(namespace, name)?;

        // Stop the reconcile task first so it cannot resurrect nodes.
        if let Some(task) = self.inner.tasks.lock().remove(&(namespace.clone(), name.clone())) {
            task.cancel.cancel();
        }

        let (mode, nodes) = {
            let devnet = record.devnet.read();
            (devnet.spec.mode, devnet.nodes.clone())
        };
        let contexts = self.inner.contexts_for(&record, &nodes);
        let runtime = self.inner.runtime.for_mode(mode);
        for ctx in &contexts {
            if let Err(err) = runtime.stop(ctx, true).await {
                warn!(target: "controller", node = %ctx.node, %err, "Teardown stop failed.");
            }
        }

        self.inner.store.remove(namespace, name);
        self.inner.bus.remove_devnet(namespace.as_str(), name.as_str());

        let dir = self.inner.data_dir.devnet_dir(name.as_str());
        self.inner.spawner.build_task().name("devnet-gc").spawn(async move {
            if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(target: "controller", dir = %dir.display(), %err, "Devnet GC failed.");
                }
            }
        });

        info!(target: "controller", %namespace, %name, "Devnet deleted.");
        Ok(())
    }

    /// Flips every node's desired phase to Running and re-reconciles.
    pub fn start_devnet(
        &self,
        namespace: &Namespace,
        name: &DevnetName,
    ) -> Result<Devnet, ControllerError> {
        self.set_all_desired(namespace, name, DesiredPhase::Running)
    }

    pub fn stop_devnet(
        &self,
        namespace: &Namespace,
        name: &DevnetName,
    ) -> Result<Devnet, ControllerError> {
        self.set_all_desired(namespace, name, DesiredPhase::Stopped)
    }

    pub fn set_node_desired(
        &self,
        namespace: &Namespace,
        name: &DevnetName,
        index: u32,
        desired: DesiredPhase,
    ) -> Result<Node, ControllerError> {
        let record = self.record(namespace, name)?;
        let node = {
            let mut devnet = record.devnet.write();
            let node = devnet
                .node_mut(index)
                .ok_or(ControllerError::NodeNotFound { index })?;
            node.spec.desired_phase = desired;
            node.clone()
        };
        self.trigger(namespace, name, Trigger::Mutated);
        Ok(node)
    }

    /// Imperative node restart, independent of the desired phase.
    pub async fn restart_node(
        &self,
        namespace: &Namespace,
        name: &DevnetName,
        index: u32,
    ) -> Result<Node, ControllerError> {
        let record = self.record(namespace, name)?;
        let (mode, node) = {
            let devnet = record.devnet.read();
            let node =
                devnet.node(index).ok_or(ControllerError::NodeNotFound { index })?.clone();
            (devnet.spec.mode, node)
        };

        let ctx = self
            .inner
            .contexts_for(&record, std::slice::from_ref(&node))
            .pop()
            .ok_or(ControllerError::NodeNotFound { index })?;

        self.inner.runtime.for_mode(mode).restart(&ctx).await?;
        self.trigger(namespace, name, Trigger::Mutated);
        self.get(namespace, name)?
            .node(index)
            .cloned()
            .ok_or(ControllerError::NodeNotFound { index })
    }

    pub async fn exec_in_node(
        &self,
        namespace: &Namespace,
        name: &DevnetName,
        index: u32,
        argv: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecResult, ControllerError> {
        let record = self.record(namespace, name)?;
        let (mode, node) = {
            let devnet = record.devnet.read();
            let node =
                devnet.node(index).ok_or(ControllerError::NodeNotFound { index })?.clone();
            (devnet.spec.mode, node)
        };

        if node.phase() != NodePhase::Running {
            return Err(ControllerError::NodeNotRunning { index, phase: node.phase() });
        }

        let ctx = self
            .inner
            .contexts_for(&record, std::slice::from_ref(&node))
            .pop()
            .ok_or(ControllerError::NodeNotFound { index })?;

        Ok(self.inner.runtime.for_mode(mode).exec(&ctx, argv, timeout).await?)
    }

    pub fn node_health(
        &self,
        namespace: &Namespace,
        name: &DevnetName,
        index: u32,
    ) -> Result<HealthState, ControllerError> {
        let devnet = self.get(namespace, name)?;
        devnet
            .node(index)
            .map(|n| n.status.health.clone())
            .ok_or(ControllerError::NodeNotFound { index })
    }

    /// Port map of one node, derived from the plugin's port arithmetic.
    pub fn node_ports(
        &self,
        namespace: &Namespace,
        name: &DevnetName,
        index: u32,
    ) -> Result<Vec<(String, u16)>, ControllerError> {
        let devnet = self.get(namespace, name)?;
        devnet.node(index).ok_or(ControllerError::NodeNotFound { index })?;
        let plugin = self.inner.registry.get(&devnet.spec.plugin)?;
        Ok(vec![
            ("rpc".to_string(), plugin.rpc_port(index)),
            ("p2p".to_string(), plugin.p2p_port(index)),
            ("rest".to_string(), plugin.rest_port(index)),
            ("grpc".to_string(), plugin.grpc_port(index)),
        ])
    }

    /// Stops every reconcile task; used on daemon shutdown.
    pub fn shutdown(&self) {
        for (_, task) in self.inner.tasks.lock().drain() {
            task.cancel.cancel();
        }
    }

    // --- internals

    fn record(
        &self,
        namespace: &Namespace,
        name: &DevnetName,
    ) -> Result<Arc<DevnetRecord>, ControllerError> {
        self.inner.store.get(namespace, name).ok_or_else(|| ControllerError::NotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    fn set_all_desired(
        &self,
        namespace: &Namespace,
        name: &DevnetName,
        desired: DesiredPhase,
    ) -> Result<Devnet, ControllerError> {
        let record = self.record(namespace, name)?;
        {
            let mut provision = record.provision.write();
            match desired {
                DesiredPhase::Stopped => {
                    provision.halted = true;
                    // Abort an in-flight provisioning run at its next safe
                    // point; already-written node homes stay on disk.
                    if let Some(cancel) = &provision.cancel {
                        cancel.cancel();
                    }
                }
                DesiredPhase::Running => provision.halted = false,
            }
        }
        {
            let mut devnet = record.devnet.write();
            for node in &mut devnet.nodes {
                node.spec.desired_phase = desired;
            }
            let reason = match desired {
                DesiredPhase::Running => "StartRequested",
                DesiredPhase::Stopped => "StopRequested",
            };
            append_event(
                &mut devnet.status.events,
                Event::normal(reason, format!("all nodes desired {desired}"), COMPONENT),
            );
        }
        self.trigger(namespace, name, Trigger::Mutated);
        let devnet = record.devnet.read().clone();
        Ok(devnet)
    }

    fn trigger(&self, namespace: &Namespace, name: &DevnetName, trigger: Trigger) {
        let tasks = self.inner.tasks.lock();
        if let Some(task) = tasks.get(&(namespace.clone(), name.clone())) {
            let _ = task.tx.send(trigger);
        }
    }

    /// Spawns the reconcile and health tasks for a devnet if missing.
    fn ensure_task(&self, namespace: &Namespace, name: &DevnetName) {
        let key = (namespace.clone(), name.clone());
        let mut tasks = self.inner.tasks.lock();
        if tasks.contains_key(&key) {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = self.inner.spawner.cancellation_token().child_token();

        let inner = self.inner.clone();
        let loop_key = key.clone();
        let loop_cancel = cancel.clone();
        let loop_tx = tx.clone();
        self.inner
            .spawner
            .build_task()
            .name("devnet-reconcile")
            .spawn(reconcile_loop(inner, loop_key, rx, loop_tx, loop_cancel));

        let inner = self.inner.clone();
        let health_key = key.clone();
        let health_cancel = cancel.clone();
        let health_tx = tx.clone();
        self.inner
            .spawner
            .build_task()
            .name("devnet-health")
            .spawn(health_loop(inner, health_key, health_tx, health_cancel));

        tasks.insert(key, DevnetTask { tx, cancel });
    }
}

impl Inner {
    /// Builds runtime contexts for `nodes` of a devnet record.
    fn contexts_for(&self, record: &DevnetRecord, nodes: &[Node]) -> Vec<NodeContext> {
        let devnet = record.devnet.read();
        let provision = record.provision.read();
        let Ok(plugin) = self.registry.get(&devnet.spec.plugin) else { return Vec::new() };
        let binary = provision.binary_path.clone().unwrap_or_default();

        nodes
            .iter()
            .map(|node| node_context(&devnet, node, plugin.as_ref(), &self.data_dir, &binary))
            .collect()
    }

    fn push_event(&self, record: &DevnetRecord, event: Event) {
        let mut devnet = record.devnet.write();
        append_event(&mut devnet.status.events, event);
    }
}

// --- the reconcile task

async fn reconcile_loop(
    inner: Arc<Inner>,
    key: DevnetKey,
    mut rx: mpsc::UnboundedReceiver<Trigger>,
    tx: mpsc::UnboundedSender<Trigger>,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(inner.config.reconcile_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let trigger = tokio::select! {
            _ = cancel.cancelled() => return,
            trigger = rx.recv() => match trigger {
                Some(trigger) => trigger,
                None => return,
            },
            _ = tick.tick() => Trigger::Mutated,
        };

        if let Trigger::ProvisionFinished(result) = trigger {
            handle_provision_result(&inner, &key, result);
        }

        if let Err(err) = reconcile(&inner, &key, &tx, &cancel).await {
            error!(target: "controller", devnet = %key.1, %err, "Reconcile failed.");
        }
    }
}

/// One reconcile pass: converge observed state onto the spec.
async fn reconcile(
    inner: &Arc<Inner>,
    key: &DevnetKey,
    tx: &mpsc::UnboundedSender<Trigger>,
    cancel: &CancellationToken,
) -> Result<(), ControllerError> {
    let Some(record) = inner.store.get(&key.0, &key.1) else { return Ok(()) };

    let (spec, provision) = {
        let devnet = record.devnet.read();
        (devnet.spec.clone(), record.provision.read().clone())
    };

    // 1. Launch provisioning when nothing exists yet, or when the node count
    //    changed on a provisioned devnet (initialize-only for new homes).
    let desired_count = spec.node_count();
    let current_count = record.devnet.read().nodes.len() as u32;

    if !provision.provisioning {
        let needs_full = !provision.provisioned && !provision.failed && !provision.halted;
        let needs_scale = provision.provisioned && desired_count != current_count;

        if needs_full || needs_scale {
            if needs_scale && desired_count < current_count {
                scale_down(inner, &record, desired_count).await;
            } else {
                launch_provisioning(inner, key, &record, tx, cancel);
                return Ok(());
            }
        }
    }

    if provision.provisioning {
        return Ok(());
    }

    // 2. Refresh node runtime statuses and drive desired phases.
    let (mode, nodes) = {
        let devnet = record.devnet.read();
        (devnet.spec.mode, devnet.nodes.clone())
    };
    let contexts = inner.contexts_for(&record, &nodes);
    let runtime = inner.runtime.for_mode(mode);

    for (node, ctx) in nodes.iter().zip(&contexts) {
        let status = runtime.status(ctx).await?;
        let merged_phase = {
            let mut devnet = record.devnet.write();
            let Some(stored) = devnet.node_mut(node.index) else { continue };

            // The health loop can flag a hung-but-alive node as crashed; the
            // backend still reports it running, so the crash flag wins here
            // and is cleared by the restart below.
            let health_crash = stored.phase() == NodePhase::Crashed
                && status.phase == Some(NodePhase::Running);
            if !health_crash {
                if let Some(phase) = status.phase {
                    stored.status.phase = Some(phase);
                }
            }
            stored.status.pid = status.pid;
            stored.status.container_id = status.container_id.clone();
            stored.status.restart_count = stored.status.restart_count.max(status.restart_count);
            if !status.message.is_empty() {
                stored.status.message = status.message.clone();
            }
            stored.phase()
        };

        match (node.spec.desired_phase, merged_phase) {
            (DesiredPhase::Stopped, NodePhase::Running | NodePhase::Starting) => {
                runtime.stop(ctx, true).await?;
                sync_node_phase(&record, node.index, NodePhase::Stopped);
            }
            (DesiredPhase::Running, NodePhase::Stopped) => {
                runtime.start(ctx).await?;
                sync_node_phase(&record, node.index, NodePhase::Running);
            }
            (DesiredPhase::Running, NodePhase::Crashed) => {
                // Bounded crash recovery.
                if status.restart_count <= inner.config.max_restarts {
                    info!(target: "controller", node = %ctx.node, "Restarting crashed node.");
                    inner.push_event(
                        &record,
                        Event::warning(
                            "NodeCrashed",
                            format!("{} crashed, restarting", ctx.node),
                            COMPONENT,
                        ),
                    );
                    runtime.restart(ctx).await?;
                    sync_node_phase(&record, node.index, NodePhase::Running);
                    reset_health(&record, node.index);
                } else {
                    inner.push_event(
                        &record,
                        Event::warning(
                            "RestartBudgetExhausted",
                            format!("{} crashed {} times, giving up", ctx.node, status.restart_count),
                            COMPONENT,
                        ),
                    );
                }
            }
            _ => {}
        }
    }

    // 3. Recompute phase, conditions and transition events.
    finalize_status(inner, &record, &provision);
    Ok(())
}

fn sync_node_phase(record: &DevnetRecord, index: u32, phase: NodePhase) {
    let mut devnet = record.devnet.write();
    if let Some(node) = devnet.node_mut(index) {
        node.status.phase = Some(phase);
    }
}

fn reset_health(record: &DevnetRecord, index: u32) {
    let mut devnet = record.devnet.write();
    if let Some(node) = devnet.node_mut(index) {
        node.status.health = HealthState::default();
    }
}

/// Recomputes the devnet status and appends an event when the phase moved.
fn finalize_status(inner: &Arc<Inner>, record: &DevnetRecord, provision: &crate::store::ProvisionState) {
    let mut devnet = record.devnet.write();
    let before = devnet.status.phase;

    refresh_status(
        &mut devnet,
        PhaseInputs {
            provisioning: provision.provisioning,
            provisioned: provision.provisioned,
            provision_failed: provision.failed,
            halted: provision.halted,
            ..Default::default()
        },
    );

    let after = devnet.status.phase;
    if before != after {
        let event = match after {
            DevnetPhase::Running => Event::normal("Running", "all nodes ready", COMPONENT),
            DevnetPhase::Degraded => Event::warning(
                "Degraded",
                format!("{}/{} nodes ready", devnet.status.ready_nodes, devnet.status.nodes),
                COMPONENT,
            ),
            DevnetPhase::Stopped => Event::normal("Stopped", "all nodes stopped", COMPONENT),
            DevnetPhase::Failed => Event::warning("Failed", devnet.status.message.clone(), COMPONENT),
            DevnetPhase::Provisioning => Event::normal("Provisioning", "provisioning started", COMPONENT),
            DevnetPhase::Pending => Event::normal("Pending", "", COMPONENT),
        };
        append_event(&mut devnet.status.events, event);
        debug!(target: "controller", devnet = %devnet.name, ?before, ?after, "Phase transition.");
    }
}

fn launch_provisioning(
    inner: &Arc<Inner>,
    key: &DevnetKey,
    record: &Arc<DevnetRecord>,
    tx: &mpsc::UnboundedSender<Trigger>,
    cancel: &CancellationToken,
) {
    let (spec, existing) = {
        let devnet = record.devnet.read();
        let existing = devnet.nodes.iter().map(|n| n.index).collect();
        (devnet.spec.clone(), existing)
    };

    let run_cancel = cancel.child_token();
    {
        let mut provision = record.provision.write();
        provision.provisioning = true;
        provision.failed = false;
        provision.cancel = Some(run_cancel.clone());
    }
    {
        let mut devnet = record.devnet.write();
        devnet.status.phase = DevnetPhase::Provisioning;
        append_event(
            &mut devnet.status.events,
            Event::normal("Provisioning", "provisioning started", COMPONENT),
        );
    }

    let request = ProvisionRequest {
        namespace: key.0.clone(),
        name: key.1.clone(),
        spec,
        existing,
        binary_path: record.provision.read().binary_path.clone(),
    };

    let events_record = record.clone();
    let events_inner = inner.clone();
    let events: crate::provisioner::EventSink = Arc::new(move |event| {
        events_inner.push_event(&events_record, event);
    });

    let provisioner = inner.provisioner.clone();
    let tx = tx.clone();
    inner.spawner.build_task().name("devnet-provision").spawn(async move {
        let result = provisioner.provision(request, events, run_cancel).await;
        let _ = tx.send(Trigger::ProvisionFinished(result));
    });
}

fn handle_provision_result(
    inner: &Arc<Inner>,
    key: &DevnetKey,
    result: Result<ProvisionReport, ProvisionError>,
) {
    let Some(record) = inner.store.get(&key.0, &key.1) else { return };

    match result {
        Ok(report) => {
            {
                let mut provision = record.provision.write();
                provision.provisioning = false;
                provision.provisioned = true;
                provision.failed = false;
                provision.cancel = None;
                provision.binary_path = Some(report.binary_path.clone());
                provision.chain_id = report.chain_id.clone();
            }
            let mut devnet = record.devnet.write();

            // Materialize the node set: keep surviving records, add new ones.
            let spec = devnet.spec.clone();
            let mut nodes: Vec<Node> = Vec::with_capacity(spec.node_count() as usize);
            for index in 0..spec.node_count() {
                let role = role_of_index(spec.validators, index);
                match devnet.node(index) {
                    Some(existing) => nodes.push(existing.clone()),
                    None => {
                        let mut node = Node::new(role, index);
                        node.status.phase = Some(NodePhase::Running);
                        nodes.push(node);
                    }
                }
            }
            devnet.nodes = nodes;

            // Seed health from the orchestrator's gate so the phase reflects
            // reality before the first steady-state probe pass lands.
            for (index, height) in &report.ready {
                if let Some(node) = devnet.node_mut(*index) {
                    node.status.health.status = devnet_primitives::HealthStatus::Healthy;
                    node.status.block_height = *height;
                }
            }

            if let Some(binary) = &report.binary {
                devnet.status.sdk_version = binary.git_ref.clone();
            }
            devnet.status.message = String::new();

            info!(
                target: "controller",
                devnet = %key.1,
                ready = report.ready_nodes(),
                nodes = report.nodes,
                "Provisioning finished.",
            );
        }
        Err(ProvisionError::Cancelled) => {
            {
                let mut provision = record.provision.write();
                provision.provisioning = false;
                provision.cancel = None;
            }
            inner.push_event(
                &record,
                Event::normal("ProvisioningCancelled", "provisioning cancelled", COMPONENT),
            );
        }
        Err(err) => {
            {
                let mut provision = record.provision.write();
                provision.provisioning = false;
                provision.failed = true;
                provision.cancel = None;
            }
            {
                let mut devnet = record.devnet.write();
                devnet.status.message = err.to_string();
            }
            inner.push_event(&record, Event::warning("ProvisioningFailed", err.to_string(), COMPONENT));
            warn!(target: "controller", devnet = %key.1, %err, "Provisioning failed.");
        }
    }
}

async fn scale_down(inner: &Arc<Inner>, record: &Arc<DevnetRecord>, desired_count: u32) {
    let (mode, removed): (Mode, Vec<Node>) = {
        let devnet = record.devnet.read();
        (
            devnet.spec.mode,
            devnet.nodes.iter().filter(|n| n.index >= desired_count).cloned().collect(),
        )
    };

    let contexts = inner.contexts_for(record, &removed);
    let runtime = inner.runtime.for_mode(mode);
    for ctx in &contexts {
        if let Err(err) = runtime.stop(ctx, true).await {
            warn!(target: "controller", node = %ctx.node, %err, "Scale-down stop failed.");
        }
        let home = ctx.home.clone();
        inner.spawner.build_task().name("node-gc").spawn(async move {
            let _ = tokio::fs::remove_dir_all(home).await;
        });
    }

    let mut devnet = record.devnet.write();
    devnet.nodes.retain(|n| n.index < desired_count);
    append_event(
        &mut devnet.status.events,
        Event::normal(
            "ScaledDown",
            format!("removed {} nodes", removed.len()),
            COMPONENT,
        ),
    );
}

// --- the health task

async fn health_loop(
    inner: Arc<Inner>,
    key: DevnetKey,
    tx: mpsc::UnboundedSender<Trigger>,
    cancel: CancellationToken,
) {
    loop {
        let interval = {
            match inner.store.get(&key.0, &key.1) {
                Some(record) => {
                    let phase = record.devnet.read().status.phase;
                    match phase {
                        DevnetPhase::Provisioning | DevnetPhase::Pending => {
                            inner.config.health_interval_fast
                        }
                        _ => inner.config.health_interval_steady,
                    }
                }
                None => return,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(record) = inner.store.get(&key.0, &key.1) else { return };
        let nodes = record.devnet.read().nodes.clone();
        if nodes.is_empty() {
            continue;
        }
        let contexts = inner.contexts_for(&record, &nodes);

        let mut transition = false;
        for (node, ctx) in nodes.iter().zip(&contexts) {
            let outcome = inner.health.probe(&ctx.host, ctx.rpc_port).await;
            let status = classify(node.phase(), &outcome);

            let mut devnet = record.devnet.write();
            let Some(stored) = devnet.node_mut(node.index) else { continue };

            let was_ready = stored.is_ready();
            apply_probe(&mut stored.status.health, status);
            if let ProbeOutcome::Responsive { height, peers } = outcome {
                stored.status.block_height = height;
                stored.status.peer_count = peers;
            }

            // Hung-but-alive detection: a running node that keeps failing its
            // probes past the threshold is treated as crashed.
            if stored.phase() == NodePhase::Running
                && stored.spec.desired_phase == DesiredPhase::Running
                && exceeds_threshold(&stored.status.health)
            {
                stored.status.phase = Some(NodePhase::Crashed);
                stored.status.message = "health probes failing".to_string();
                transition = true;
            }

            if was_ready != stored.is_ready() {
                transition = true;
            }
        }

        if transition {
            let _ = tx.send(Trigger::Health);
        }
    }
}
