//! RPC surface tests over a real server socket.

use std::collections::HashMap;
use std::sync::Arc;

use devnet_build::{BinaryCache, Builder};
use devnet_controller::{
    ControllerConfig, DataDir, DevnetController, Provisioner, ProvisionerConfig,
};
use devnet_genesis::GenesisForker;
use devnet_log::LogBus;
use devnet_plugin::PluginRegistry;
use devnet_primitives::{LogLine, LogStream};
use devnet_rpc::api::DevnetApi;
use devnet_rpc::auth::{ApiKeySet, Identity};
use devnet_rpc::RpcServer;
use devnet_rpc_api::{DevnetApiClient, DevnetApiServer};
use devnet_rpc_types::{DevnetRef, StreamNodeLogsRequest};
use devnet_runtime::Runtime;
use devnet_tasks::TaskManager;
use http::HeaderMap;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::Error as RpcError;
use jsonrpsee::http_client::HttpClientBuilder;
use jsonrpsee::rpc_params;
use jsonrpsee::ws_client::WsClientBuilder;

struct Fixture {
    manager: TaskManager,
    bus: Arc<LogBus>,
    module: jsonrpsee::RpcModule<()>,
    _data: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let data = tempfile::tempdir().unwrap();
    let data_dir = DataDir::new(data.path());
    let bus = Arc::new(LogBus::new());
    let manager = TaskManager::current();

    let builder = Arc::new(Builder::new(BinaryCache::new(data_dir.bin_cache())));
    let runtime = Arc::new(Runtime::new(bus.clone()));
    let provisioner = Arc::new(Provisioner::new(
        PluginRegistry::default(),
        builder.clone(),
        Arc::new(GenesisForker::new(data_dir.bin_cache())),
        runtime.clone(),
        bus.clone(),
        data_dir.clone(),
        ProvisionerConfig::default(),
    ));

    let controller = Arc::new(DevnetController::new(
        PluginRegistry::default(),
        provisioner,
        runtime,
        bus.clone(),
        data_dir.clone(),
        manager.task_spawner(),
        ControllerConfig::default(),
    ));

    let api = DevnetApi::new(
        controller,
        builder,
        bus.clone(),
        data_dir,
        Identity::trusted(),
        "0.3.0-test",
    );

    let mut module = jsonrpsee::RpcModule::new(());
    module.merge(api.into_rpc()).expect("api methods are disjoint");

    Fixture { manager, bus, module, _data: data }
}

#[tokio::test]
async fn ping_and_list_networks_round_trip() {
    let fx = fixture();
    let server = RpcServer::new().health_check(true).module(fx.module.clone()).unwrap();
    let handle = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let url = format!("ws://{}", handle.addr());
    let client = WsClientBuilder::default().build(&url).await.unwrap();

    let pong = client.ping().await.unwrap();
    assert_eq!(pong.version, "0.3.0-test");
    assert_eq!(pong.trust_level, "trusted");

    let networks = client.list_networks().await.unwrap();
    let names: Vec<_> = networks.networks.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["cosmos", "stable"]);

    let me = client.who_am_i().await.unwrap();
    assert_eq!(me.identity, "local");
    assert_eq!(me.namespaces, vec!["*"]);

    handle.stop().unwrap();
    fx.manager.shutdown().await;
}

#[tokio::test]
async fn get_missing_devnet_maps_to_not_found_code() {
    let fx = fixture();
    let server = RpcServer::new().module(fx.module.clone()).unwrap();
    let handle = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let url = format!("ws://{}", handle.addr());
    let client = WsClientBuilder::default().build(&url).await.unwrap();

    let err = client
        .get_devnet(DevnetRef { namespace: "default".into(), name: "ghost".into() })
        .await
        .unwrap_err();

    match err {
        RpcError::Call(jsonrpsee::types::error::CallError::Custom(object)) => {
            assert_eq!(object.code(), 1, "NotFound code");
            assert!(object.message().contains("not found"));
        }
        other => panic!("expected a call error, got {other:?}"),
    }

    handle.stop().unwrap();
    fx.manager.shutdown().await;
}

#[tokio::test]
async fn invalid_names_are_rejected_before_any_side_effect() {
    let fx = fixture();
    let server = RpcServer::new().module(fx.module.clone()).unwrap();
    let handle = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let url = format!("ws://{}", handle.addr());
    let client = WsClientBuilder::default().build(&url).await.unwrap();

    let err = client
        .get_devnet(DevnetRef { namespace: "default".into(), name: "Bad/Name".into() })
        .await
        .unwrap_err();

    match err {
        RpcError::Call(jsonrpsee::types::error::CallError::Custom(object)) => {
            assert_eq!(object.code(), 3, "InvalidArgument code");
        }
        other => panic!("expected a call error, got {other:?}"),
    }

    handle.stop().unwrap();
    fx.manager.shutdown().await;
}

#[tokio::test]
async fn api_key_auth_scopes_namespaces() {
    let fx = fixture();

    let keys = ApiKeySet::new(HashMap::from([(
        "sekrit".to_string(),
        Identity::new("ci", ["team-a".to_string()]),
    )]));

    let server =
        RpcServer::new().http_only(true).auth(keys).module(fx.module.clone()).unwrap();
    let handle = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let url = format!("http://{}", handle.addr());

    fn code_of(err: RpcError) -> i32 {
        match err {
            RpcError::Call(jsonrpsee::types::error::CallError::Custom(object)) => object.code(),
            other => panic!("expected a call error, got {other:?}"),
        }
    }

    fn devnet_ref(namespace: &str) -> DevnetRef {
        DevnetRef { namespace: namespace.into(), name: "d1".into() }
    }

    // No key at all: rejected.
    let anonymous = HttpClientBuilder::default().build(&url).unwrap();
    let err = anonymous
        .request::<serde_json::Value, _>("devnet_getDevnet", rpc_params![devnet_ref("team-a")])
        .await
        .unwrap_err();
    assert_eq!(code_of(err), 4, "PermissionDenied code");

    // With the key: in-scope namespace reaches the handler (NotFound, since
    // nothing was created), out-of-scope is denied by the layer.
    let mut headers = HeaderMap::new();
    headers.insert("x-api-key", "sekrit".parse().unwrap());
    let client = HttpClientBuilder::default().set_headers(headers).build(&url).unwrap();

    let err = client
        .request::<serde_json::Value, _>("devnet_getDevnet", rpc_params![devnet_ref("team-a")])
        .await
        .unwrap_err();
    assert_eq!(code_of(err), 1, "in-scope call reached the handler");

    let err = client
        .request::<serde_json::Value, _>("devnet_getDevnet", rpc_params![devnet_ref("team-b")])
        .await
        .unwrap_err();
    assert_eq!(code_of(err), 4, "out-of-scope call is denied");

    // whoAmI is answered by the layer with the key's identity.
    let me: serde_json::Value =
        client.request("devnet_whoAmI", rpc_params![]).await.unwrap();
    assert_eq!(me["identity"], "ci");
    assert_eq!(me["namespaces"], serde_json::json!(["team-a"]));

    handle.stop().unwrap();
    fx.manager.shutdown().await;
}

#[tokio::test]
async fn node_log_subscription_replays_tail_then_follows() {
    let fx = fixture();
    let server = RpcServer::new().module(fx.module.clone()).unwrap();
    let handle = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let key = LogBus::node_key("default", "d1", 0);
    fx.bus.publish_node_line(&key, LogLine::new(LogStream::Stdout, "one"));
    fx.bus.publish_node_line(&key, LogLine::new(LogStream::Stdout, "two"));
    fx.bus.publish_node_line(&key, LogLine::new(LogStream::Stdout, "three"));

    let url = format!("ws://{}", handle.addr());
    let client = WsClientBuilder::default().build(&url).await.unwrap();

    let mut sub = client
        .subscribe_node_logs(StreamNodeLogsRequest {
            namespace: "default".into(),
            devnet: "d1".into(),
            index: 0,
            follow: true,
            since: None,
            tail: Some(2),
        })
        .await
        .unwrap();

    let first: LogLine = sub.next().await.unwrap().unwrap();
    let second: LogLine = sub.next().await.unwrap().unwrap();
    assert_eq!(first.message, "two", "tail=2 starts at the second-to-last line");
    assert_eq!(second.message, "three");

    fx.bus.publish_node_line(&key, LogLine::new(LogStream::Stderr, "four"));
    let third: LogLine = sub.next().await.unwrap().unwrap();
    assert_eq!(third.message, "four");
    assert_eq!(third.stream, LogStream::Stderr);

    handle.stop().unwrap();
    fx.manager.shutdown().await;
}
