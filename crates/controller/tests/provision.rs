//! End-to-end provisioning with a scripted plugin: no real chain binary, no
//! network, but real processes, real node homes and a real health gate.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::{spawn_status_server, ScriptedPlugin};
use devnet_build::{BinaryCache, Builder};
use devnet_controller::{
    DataDir, Provision, ProvisionRequest, Provisioner, ProvisionerConfig,
};
use devnet_genesis::GenesisForker;
use devnet_log::LogBus;
use devnet_plugin::PluginRegistry;
use devnet_primitives::{DevnetSpec, Event, Mode};
use devnet_runtime::Runtime;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn provisions_single_validator_to_running() {
    let status_addr = spawn_status_server(5).await;

    let mut registry = PluginRegistry::empty();
    registry.register(Arc::new(ScriptedPlugin { rpc_base: status_addr.port() }));

    let data = tempfile::tempdir().unwrap();
    let data_dir = DataDir::new(data.path());
    let bus = Arc::new(LogBus::new());
    let runtime = Arc::new(Runtime::new(bus.clone()));

    let provisioner = Provisioner::new(
        registry,
        Arc::new(Builder::new(BinaryCache::new(data_dir.bin_cache()))),
        Arc::new(GenesisForker::new(data_dir.bin_cache())),
        runtime.clone(),
        bus.clone(),
        data_dir.clone(),
        ProvisionerConfig {
            bootstrap_deadline: Duration::from_secs(10),
            probe_interval: Duration::from_millis(100),
            ..Default::default()
        },
    );

    let request = ProvisionRequest {
        namespace: "default".parse().unwrap(),
        name: "d1".parse().unwrap(),
        spec: DevnetSpec {
            plugin: "fakechain".into(),
            validators: 1,
            mode: Mode::Local,
            ..Default::default()
        }
        .normalized(),
        existing: BTreeSet::new(),
        // /bin/sh stands in for the chain binary; the build phase is skipped.
        binary_path: Some("/bin/sh".into()),
    };

    let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let sink: devnet_controller::EventSink =
        Arc::new(move |event| sink_events.lock().push(event));

    let report = provisioner
        .provision(request, sink, CancellationToken::new())
        .await
        .expect("provisioning should succeed");

    assert_eq!(report.nodes, 1);
    assert_eq!(report.ready_nodes(), 1, "the status stub reports height 5");
    assert_eq!(report.ready, vec![(0, 5)]);
    assert_eq!(report.chain_id, "d1-devnet");
    assert!(report.binary.is_none(), "build was skipped");

    // The node home exists with the assembled genesis and peer config.
    let home = data_dir.node_home("d1", "validator-0");
    assert!(home.join("config/genesis.json").is_file());
    assert!(home.join("config/config.toml").is_file());
    assert!(home.join("node.pid").is_file(), "process backend wrote a pid file");

    let reasons: Vec<_> = events.lock().iter().map(|e| e.reason.clone()).collect();
    assert!(reasons.contains(&"NodesInitialized".to_string()), "events: {reasons:?}");

    runtime.cleanup().await.unwrap();
}

#[tokio::test]
async fn cancellation_preserves_node_homes() {
    let status_addr = spawn_status_server(5).await;

    let mut registry = PluginRegistry::empty();
    registry.register(Arc::new(ScriptedPlugin { rpc_base: status_addr.port() }));

    let data = tempfile::tempdir().unwrap();
    let data_dir = DataDir::new(data.path());
    let bus = Arc::new(LogBus::new());
    let runtime = Arc::new(Runtime::new(bus.clone()));

    let provisioner = Provisioner::new(
        registry,
        Arc::new(Builder::new(BinaryCache::new(data_dir.bin_cache()))),
        Arc::new(GenesisForker::new(data_dir.bin_cache())),
        runtime.clone(),
        bus,
        data_dir.clone(),
        ProvisionerConfig::default(),
    );

    let request = ProvisionRequest {
        namespace: "default".parse().unwrap(),
        name: "d2".parse().unwrap(),
        spec: DevnetSpec {
            plugin: "fakechain".into(),
            validators: 1,
            mode: Mode::Local,
            ..Default::default()
        }
        .normalized(),
        existing: BTreeSet::new(),
        binary_path: Some("/bin/sh".into()),
    };

    let cancel = CancellationToken::new();
    cancel.cancel();

    let sink: devnet_controller::EventSink = Arc::new(|_| {});
    let err = provisioner.provision(request, sink, cancel).await.unwrap_err();
    assert!(matches!(err, devnet_controller::ProvisionError::Cancelled));

    runtime.cleanup().await.unwrap();
}
