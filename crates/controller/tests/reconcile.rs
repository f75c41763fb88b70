//! Reconcile-loop behavior against fake provisioning and runtime seams.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{spawn_status_server, ScriptedPlugin};
use devnet_controller::{
    ApplyAction, ControllerConfig, DataDir, DevnetController, EventSink, Provision,
    ProvisionError, ProvisionReport, ProvisionRequest, RuntimeProvider,
};
use devnet_log::LogBus;
use devnet_plugin::PluginRegistry;
use devnet_primitives::{
    ConditionStatus, ConditionType, DesiredPhase, DevnetName, DevnetPhase, DevnetSpec, Event,
    Mode, Namespace, NodePhase,
};
use devnet_runtime::{ExecResult, NodeContext, NodeRuntime, RuntimeError, RuntimeStatus};
use devnet_tasks::TaskManager;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Provisioning that succeeds instantly and reports every node ready.
struct InstantProvision {
    requests: Mutex<Vec<ProvisionRequest>>,
}

#[async_trait]
impl Provision for InstantProvision {
    async fn provision(
        &self,
        request: ProvisionRequest,
        events: EventSink,
        _cancel: CancellationToken,
    ) -> Result<ProvisionReport, ProvisionError> {
        events(Event::normal("BinaryBuilt", "binary ready", "provisioner"));
        events(Event::normal("NodesInitialized", "homes initialized", "provisioner"));

        let nodes = request.spec.node_count();
        let report = ProvisionReport {
            binary: None,
            binary_path: "/bin/sh".into(),
            chain_id: "test-1".into(),
            nodes,
            ready: (0..nodes).map(|i| (i, 10)).collect(),
        };
        self.requests.lock().push(request);
        Ok(report)
    }
}

/// In-memory runtime: phases move instantly, nothing is spawned.
#[derive(Default)]
struct FakeRuntime {
    phases: Mutex<HashMap<String, NodePhase>>,
}

#[async_trait]
impl NodeRuntime for FakeRuntime {
    async fn start(&self, ctx: &NodeContext) -> Result<RuntimeStatus, RuntimeError> {
        self.phases.lock().insert(ctx.runtime_key(), NodePhase::Running);
        self.status(ctx).await
    }

    async fn stop(&self, ctx: &NodeContext, _graceful: bool) -> Result<RuntimeStatus, RuntimeError> {
        self.phases.lock().insert(ctx.runtime_key(), NodePhase::Stopped);
        self.status(ctx).await
    }

    async fn restart(&self, ctx: &NodeContext) -> Result<RuntimeStatus, RuntimeError> {
        self.start(ctx).await
    }

    async fn status(&self, ctx: &NodeContext) -> Result<RuntimeStatus, RuntimeError> {
        let phase = self.phases.lock().get(&ctx.runtime_key()).copied();
        Ok(RuntimeStatus { phase, ..Default::default() })
    }

    async fn exec(
        &self,
        _ctx: &NodeContext,
        _argv: Vec<String>,
        _timeout: Duration,
    ) -> Result<ExecResult, RuntimeError> {
        Ok(ExecResult { stdout: "v1.0.0".into(), stderr: String::new(), exit_code: 0 })
    }

    fn logs(
        &self,
        _ctx: &NodeContext,
        tail: Option<usize>,
    ) -> devnet_log::Subscription<devnet_primitives::LogLine> {
        LogBus::new().subscribe_node("unused", tail)
    }

    async fn cleanup(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

struct FakeRuntimeProvider(Arc<FakeRuntime>);

impl RuntimeProvider for FakeRuntimeProvider {
    fn for_mode(&self, _mode: Mode) -> Arc<dyn NodeRuntime> {
        self.0.clone()
    }
}

struct Fixture {
    controller: DevnetController,
    manager: TaskManager,
    _data: tempfile::TempDir,
}

async fn fixture(rpc_base: u16) -> Fixture {
    let mut registry = PluginRegistry::empty();
    registry.register(Arc::new(ScriptedPlugin { rpc_base }));

    let data = tempfile::tempdir().unwrap();
    let manager = TaskManager::current();

    let controller = DevnetController::new(
        registry,
        Arc::new(InstantProvision { requests: Mutex::new(Vec::new()) }),
        Arc::new(FakeRuntimeProvider(Arc::new(FakeRuntime::default()))),
        Arc::new(LogBus::new()),
        DataDir::new(data.path()),
        manager.task_spawner(),
        ControllerConfig {
            reconcile_interval: Duration::from_millis(200),
            health_interval_fast: Duration::from_millis(100),
            health_interval_steady: Duration::from_millis(100),
            ..Default::default()
        },
    );

    Fixture { controller, manager, _data: data }
}

fn spec(validators: u32) -> DevnetSpec {
    DevnetSpec {
        plugin: "fakechain".into(),
        validators,
        mode: Mode::Local,
        ..Default::default()
    }
}

fn ns() -> Namespace {
    "default".parse().unwrap()
}

fn name(s: &str) -> DevnetName {
    s.parse().unwrap()
}

async fn wait_for_phase(
    controller: &DevnetController,
    name: &DevnetName,
    phase: DevnetPhase,
) -> devnet_primitives::Devnet {
    for _ in 0..100 {
        if let Ok(devnet) = controller.get(&ns(), name) {
            if devnet.status.phase == phase {
                return devnet;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let state = controller.get(&ns(), name).ok();
    panic!("devnet never reached {phase}; last state: {state:#?}");
}

#[tokio::test]
async fn fresh_create_reaches_running_with_conditions_and_events() {
    let status = spawn_status_server(10).await;
    let fx = fixture(status.port()).await;

    let (_, action) = fx.controller.apply(ns(), name("d1"), spec(2)).unwrap();
    assert_eq!(action, ApplyAction::Created);

    let devnet = wait_for_phase(&fx.controller, &name("d1"), DevnetPhase::Running).await;

    assert_eq!(devnet.status.nodes, 2);
    assert_eq!(devnet.status.ready_nodes, 2);
    assert_eq!(devnet.nodes[0].name.to_string(), "validator-0");
    assert_eq!(devnet.nodes[1].name.to_string(), "validator-1");

    let ready = devnet
        .status
        .conditions
        .iter()
        .find(|c| c.r#type == ConditionType::Ready)
        .expect("Ready condition present");
    assert_eq!(ready.status, ConditionStatus::True);
    let progressing = devnet
        .status
        .conditions
        .iter()
        .find(|c| c.r#type == ConditionType::Progressing)
        .expect("Progressing condition present");
    assert_eq!(progressing.status, ConditionStatus::False);

    let reasons: Vec<_> = devnet.status.events.iter().map(|e| e.reason.as_str()).collect();
    assert!(reasons.contains(&"BinaryBuilt"), "events: {reasons:?}");
    assert!(reasons.contains(&"NodesInitialized"), "events: {reasons:?}");
    assert!(reasons.contains(&"Running"), "events: {reasons:?}");

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn reapply_is_idempotent_and_appends_no_events() {
    let status = spawn_status_server(10).await;
    let fx = fixture(status.port()).await;

    fx.controller.apply(ns(), name("d1"), spec(2)).unwrap();
    wait_for_phase(&fx.controller, &name("d1"), DevnetPhase::Running).await;

    let before = fx.controller.get(&ns(), &name("d1")).unwrap();
    let (after, action) = fx.controller.apply(ns(), name("d1"), spec(2)).unwrap();

    assert_eq!(action, ApplyAction::Unchanged);
    assert_eq!(after.spec, before.spec);
    assert_eq!(after.status.events.len(), before.status.events.len());

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn scale_up_adds_nodes_without_touching_existing() {
    let status = spawn_status_server(10).await;
    let fx = fixture(status.port()).await;

    fx.controller.apply(ns(), name("d1"), spec(2)).unwrap();
    wait_for_phase(&fx.controller, &name("d1"), DevnetPhase::Running).await;

    let (_, action) = fx.controller.apply(ns(), name("d1"), spec(4)).unwrap();
    assert_eq!(action, ApplyAction::Configured);

    let mut devnet = fx.controller.get(&ns(), &name("d1")).unwrap();
    for _ in 0..100 {
        devnet = fx.controller.get(&ns(), &name("d1")).unwrap();
        if devnet.status.nodes == 4 && devnet.status.phase == DevnetPhase::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(devnet.status.nodes, 4);

    let names: Vec<_> = devnet.nodes.iter().map(|n| n.name.to_string()).collect();
    assert_eq!(names, vec!["validator-0", "validator-1", "validator-2", "validator-3"]);
    assert_eq!(devnet.status.ready_nodes, 4);

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn stop_devnet_transitions_to_stopped() {
    let status = spawn_status_server(10).await;
    let fx = fixture(status.port()).await;

    fx.controller.apply(ns(), name("d1"), spec(1)).unwrap();
    wait_for_phase(&fx.controller, &name("d1"), DevnetPhase::Running).await;

    let devnet = fx.controller.stop_devnet(&ns(), &name("d1")).unwrap();
    assert!(devnet.nodes.iter().all(|n| n.spec.desired_phase == DesiredPhase::Stopped));

    let devnet = wait_for_phase(&fx.controller, &name("d1"), DevnetPhase::Stopped).await;
    assert_eq!(devnet.status.phase, DevnetPhase::Stopped);

    // Start brings it back.
    fx.controller.start_devnet(&ns(), &name("d1")).unwrap();
    wait_for_phase(&fx.controller, &name("d1"), DevnetPhase::Running).await;

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn delete_removes_devnet_and_get_fails() {
    let status = spawn_status_server(10).await;
    let fx = fixture(status.port()).await;

    fx.controller.apply(ns(), name("d1"), spec(1)).unwrap();
    wait_for_phase(&fx.controller, &name("d1"), DevnetPhase::Running).await;

    fx.controller.delete(&ns(), &name("d1")).await.unwrap();
    assert!(fx.controller.get(&ns(), &name("d1")).is_err());
    assert!(fx.controller.list(None).is_empty());

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn create_refuses_existing_devnet() {
    let status = spawn_status_server(10).await;
    let fx = fixture(status.port()).await;

    fx.controller.create(ns(), name("d1"), spec(1)).unwrap();
    let err = fx.controller.create(ns(), name("d1"), spec(1)).unwrap_err();
    assert!(matches!(err, devnet_controller::ControllerError::AlreadyExists { .. }));

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn exec_requires_running_node() {
    let status = spawn_status_server(10).await;
    let fx = fixture(status.port()).await;

    fx.controller.apply(ns(), name("d1"), spec(1)).unwrap();
    wait_for_phase(&fx.controller, &name("d1"), DevnetPhase::Running).await;

    let out = fx
        .controller
        .exec_in_node(&ns(), &name("d1"), 0, vec!["fakechaind".into(), "version".into()], Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(out.exit_code, 0);

    fx.controller.stop_devnet(&ns(), &name("d1")).unwrap();
    wait_for_phase(&fx.controller, &name("d1"), DevnetPhase::Stopped).await;

    let err = fx
        .controller
        .exec_in_node(&ns(), &name("d1"), 0, vec!["fakechaind".into(), "version".into()], Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, devnet_controller::ControllerError::NodeNotRunning { .. }));

    fx.manager.shutdown().await;
}
