//! Handlers of the devnet API, backed by the controller.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use devnet_build::Builder;
use devnet_controller::{ControllerError, DataDir, DevnetController};
use devnet_log::{LogBus, SubscriptionEvent};
use devnet_primitives::{DesiredPhase, DevnetName, Namespace};
use devnet_rpc_api::{ApiError, DevnetApiServer, ErrorCode};
use devnet_rpc_types::{
    ApplyDevnetRequest, ApplyDevnetResponse, DevnetRef, DevnetResponse, ExecInNodeRequest,
    ExecInNodeResponse, ListBinaryVersionsRequest, ListBinaryVersionsResponse,
    ListDevnetsRequest, ListDevnetsResponse, ListNetworksResponse, ListNodesResponse,
    NetworkInfo, NodeHealthResponse, NodePortsResponse, NodeRef, NodeResponse, PingResponse,
    WhoAmIResponse,
};
use jsonrpsee::core::server::rpc_module::SubscriptionSink;
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::types::SubscriptionResult;
use tokio_util::sync::CancellationToken;

use crate::auth::Identity;

/// How much of the daemon log a new subscriber receives as back-fill.
const DAEMON_LOG_TAIL: usize = 50;

pub struct DevnetApi {
    controller: Arc<DevnetController>,
    builder: Arc<Builder>,
    bus: Arc<LogBus>,
    data_dir: DataDir,
    /// The ambient identity of this listener (the loopback listener is fully
    /// trusted; remote callers are answered by the auth layer instead).
    identity: Identity,
    version: String,
}

impl DevnetApi {
    pub fn new(
        controller: Arc<DevnetController>,
        builder: Arc<Builder>,
        bus: Arc<LogBus>,
        data_dir: DataDir,
        identity: Identity,
        version: impl Into<String>,
    ) -> Self {
        Self { controller, builder, bus, data_dir, identity, version: version.into() }
    }

    fn names(&self, namespace: &str, name: &str) -> RpcResult<(Namespace, DevnetName)> {
        let namespace = namespace
            .parse::<Namespace>()
            .map_err(|err| ApiError::invalid_argument(err.to_string()))?;
        let name =
            name.parse::<DevnetName>().map_err(|err| ApiError::invalid_argument(err.to_string()))?;
        Ok((namespace, name))
    }
}

/// Maps controller failures onto the wire taxonomy.
fn map_controller_error(err: ControllerError) -> jsonrpsee::core::Error {
    use devnet_runtime::RuntimeError;

    let api = match &err {
        ControllerError::Validation(_) => ApiError::new(ErrorCode::InvalidArgument, err.to_string()),
        ControllerError::Plugin(_) => ApiError::new(ErrorCode::InvalidArgument, err.to_string()),
        ControllerError::NotFound { .. } | ControllerError::NodeNotFound { .. } => {
            ApiError::new(ErrorCode::NotFound, err.to_string())
        }
        ControllerError::AlreadyExists { .. } => {
            ApiError::new(ErrorCode::AlreadyExists, err.to_string())
        }
        ControllerError::NodeNotRunning { .. } => {
            ApiError::new(ErrorCode::FailedPrecondition, err.to_string())
        }
        ControllerError::Runtime(runtime) => match runtime {
            RuntimeError::ExecTimeout { .. } => {
                ApiError::new(ErrorCode::DeadlineExceeded, err.to_string())
            }
            RuntimeError::NotRunning { .. } => {
                ApiError::new(ErrorCode::FailedPrecondition, err.to_string())
            }
            _ => ApiError::new(ErrorCode::Internal, err.to_string()),
        },
    };
    api.into()
}

#[async_trait]
impl DevnetApiServer for DevnetApi {
    async fn ping(&self) -> RpcResult<PingResponse> {
        let trust_level =
            if self.identity.is_wildcard() { "trusted" } else { "restricted" }.to_string();
        Ok(PingResponse { version: self.version.clone(), time: Utc::now(), trust_level })
    }

    async fn who_am_i(&self) -> RpcResult<WhoAmIResponse> {
        Ok(WhoAmIResponse {
            identity: self.identity.name.clone(),
            namespaces: self.identity.namespace_list(),
        })
    }

    async fn list_networks(&self) -> RpcResult<ListNetworksResponse> {
        let networks = self
            .controller
            .registry()
            .list()
            .into_iter()
            .map(|info| NetworkInfo {
                name: info.name,
                display_name: info.display_name,
                binary_name: info.binary_name,
                default_version: info.default_version,
                available_networks: info
                    .available_networks
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            })
            .collect();
        Ok(ListNetworksResponse { networks })
    }

    async fn list_binary_versions(
        &self,
        request: ListBinaryVersionsRequest,
    ) -> RpcResult<ListBinaryVersionsResponse> {
        let plugin = self
            .controller
            .registry()
            .get(&request.network)
            .map_err(|err| ApiError::invalid_argument(err.to_string()))?;

        let versions = self
            .builder
            .list_refs(plugin.default_repo(), &CancellationToken::new())
            .await
            .map_err(|err| ApiError::new(ErrorCode::Unavailable, err.to_string()))?;

        Ok(ListBinaryVersionsResponse { versions })
    }

    async fn apply_devnet(&self, request: ApplyDevnetRequest) -> RpcResult<ApplyDevnetResponse> {
        let (namespace, name) = self.names(&request.namespace, &request.name)?;

        let mut spec = request.spec;
        merge_meta(&mut spec.labels, request.labels);
        merge_meta(&mut spec.annotations, request.annotations);

        let (devnet, action) =
            self.controller.apply(namespace, name, spec).map_err(map_controller_error)?;
        Ok(ApplyDevnetResponse { devnet, action: action.to_string() })
    }

    async fn create_devnet(&self, request: ApplyDevnetRequest) -> RpcResult<ApplyDevnetResponse> {
        let (namespace, name) = self.names(&request.namespace, &request.name)?;

        let mut spec = request.spec;
        merge_meta(&mut spec.labels, request.labels);
        merge_meta(&mut spec.annotations, request.annotations);

        let devnet =
            self.controller.create(namespace, name, spec).map_err(map_controller_error)?;
        Ok(ApplyDevnetResponse { devnet, action: "created".to_string() })
    }

    async fn get_devnet(&self, request: DevnetRef) -> RpcResult<DevnetResponse> {
        let (namespace, name) = self.names(&request.namespace, &request.name)?;
        let devnet = self.controller.get(&namespace, &name).map_err(map_controller_error)?;
        Ok(DevnetResponse { devnet })
    }

    async fn list_devnets(&self, request: ListDevnetsRequest) -> RpcResult<ListDevnetsResponse> {
        let namespace = if request.namespace.is_empty() {
            None
        } else {
            Some(
                request
                    .namespace
                    .parse::<Namespace>()
                    .map_err(|err| ApiError::invalid_argument(err.to_string()))?,
            )
        };
        Ok(ListDevnetsResponse { devnets: self.controller.list(namespace.as_ref()) })
    }

    async fn delete_devnet(&self, request: DevnetRef) -> RpcResult<()> {
        let (namespace, name) = self.names(&request.namespace, &request.name)?;
        self.controller.delete(&namespace, &name).await.map_err(map_controller_error)
    }

    async fn start_devnet(&self, request: DevnetRef) -> RpcResult<DevnetResponse> {
        let (namespace, name) = self.names(&request.namespace, &request.name)?;
        let devnet =
            self.controller.start_devnet(&namespace, &name).map_err(map_controller_error)?;
        Ok(DevnetResponse { devnet })
    }

    async fn stop_devnet(&self, request: DevnetRef) -> RpcResult<DevnetResponse> {
        let (namespace, name) = self.names(&request.namespace, &request.name)?;
        let devnet =
            self.controller.stop_devnet(&namespace, &name).map_err(map_controller_error)?;
        Ok(DevnetResponse { devnet })
    }

    async fn list_nodes(&self, request: DevnetRef) -> RpcResult<ListNodesResponse> {
        let (namespace, name) = self.names(&request.namespace, &request.name)?;
        let devnet = self.controller.get(&namespace, &name).map_err(map_controller_error)?;
        Ok(ListNodesResponse { nodes: devnet.nodes })
    }

    async fn get_node(&self, request: NodeRef) -> RpcResult<NodeResponse> {
        let (namespace, name) = self.names(&request.namespace, &request.devnet)?;
        let devnet = self.controller.get(&namespace, &name).map_err(map_controller_error)?;
        let node = devnet
            .node(request.index)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("node {} not found", request.index)))?;
        Ok(NodeResponse { node })
    }

    async fn start_node(&self, request: NodeRef) -> RpcResult<NodeResponse> {
        let (namespace, name) = self.names(&request.namespace, &request.devnet)?;
        let node = self
            .controller
            .set_node_desired(&namespace, &name, request.index, DesiredPhase::Running)
            .map_err(map_controller_error)?;
        Ok(NodeResponse { node })
    }

    async fn stop_node(&self, request: NodeRef) -> RpcResult<NodeResponse> {
        let (namespace, name) = self.names(&request.namespace, &request.devnet)?;
        let node = self
            .controller
            .set_node_desired(&namespace, &name, request.index, DesiredPhase::Stopped)
            .map_err(map_controller_error)?;
        Ok(NodeResponse { node })
    }

    async fn restart_node(&self, request: NodeRef) -> RpcResult<NodeResponse> {
        let (namespace, name) = self.names(&request.namespace, &request.devnet)?;
        let node = self
            .controller
            .restart_node(&namespace, &name, request.index)
            .await
            .map_err(map_controller_error)?;
        Ok(NodeResponse { node })
    }

    async fn get_node_health(&self, request: NodeRef) -> RpcResult<NodeHealthResponse> {
        let (namespace, name) = self.names(&request.namespace, &request.devnet)?;
        let health = self
            .controller
            .node_health(&namespace, &name, request.index)
            .map_err(map_controller_error)?;
        Ok(NodeHealthResponse { health })
    }

    async fn get_node_ports(&self, request: NodeRef) -> RpcResult<NodePortsResponse> {
        let (namespace, name) = self.names(&request.namespace, &request.devnet)?;
        let ports = self
            .controller
            .node_ports(&namespace, &name, request.index)
            .map_err(map_controller_error)?;
        Ok(NodePortsResponse { ports: ports.into_iter().collect::<BTreeMap<_, _>>() })
    }

    async fn exec_in_node(&self, request: ExecInNodeRequest) -> RpcResult<ExecInNodeResponse> {
        let (namespace, name) = self.names(&request.namespace, &request.devnet)?;
        let result = self
            .controller
            .exec_in_node(
                &namespace,
                &name,
                request.index,
                request.argv,
                Duration::from_secs(request.timeout_seconds),
            )
            .await
            .map_err(map_controller_error)?;
        Ok(ExecInNodeResponse {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
        })
    }

    fn subscribe_node_logs(
        &self,
        mut sink: SubscriptionSink,
        request: devnet_rpc_types::StreamNodeLogsRequest,
    ) -> SubscriptionResult {
        // Validate the target before anything touches the filesystem.
        let (namespace, name) = match self.names(&request.namespace, &request.devnet) {
            Ok(names) => names,
            Err(err) => {
                sink.reject(jsonrpsee::types::ErrorObjectOwned::from(ApiError::invalid_argument(
                    err.to_string(),
                )))?;
                return Ok(());
            }
        };

        sink.accept()?;

        let key = LogBus::node_key(&request.namespace, &request.devnet, request.index);
        let mut subscription = self.bus.subscribe_node(&key, request.tail);
        let mut replay = subscription.take_replay();

        // A freshly restarted daemon has an empty ring; back-fill the tail
        // from the node's on-disk log, located through the usual discovery
        // candidates with symlink-escape checks.
        if replay.is_empty() {
            if let Ok(devnet) = self.controller.get(&namespace, &name) {
                if let Some(node) = devnet.node(request.index) {
                    let home = self.data_dir.node_home(name.as_str(), &node.name.to_string());
                    if let Some(log_file) = devnet_utils::fs::discover_log_file(&home) {
                        if let Ok(content) = std::fs::read_to_string(&log_file) {
                            let lines: Vec<&str> = content.lines().collect();
                            let start =
                                lines.len().saturating_sub(request.tail.unwrap_or(lines.len()));
                            replay = lines[start..]
                                .iter()
                                .map(|l| {
                                    devnet_primitives::LogLine::new(
                                        devnet_primitives::LogStream::Stdout,
                                        *l,
                                    )
                                })
                                .collect();
                        }
                    }
                }
            }
        }

        tokio::spawn(async move {
            // Replay the requested tail first, then follow if asked to.
            for line in replay {
                if request.since.is_some_and(|since| line.timestamp < since) {
                    continue;
                }
                if !matches!(sink.send(&line), Ok(true)) {
                    return;
                }
            }
            if !request.follow {
                return;
            }

            loop {
                match subscription.recv().await {
                    SubscriptionEvent::Entry(line) => {
                        if !matches!(sink.send(&line), Ok(true)) {
                            return;
                        }
                    }
                    SubscriptionEvent::Lagged(missed) => {
                        tracing::warn!(target: "rpc", %key, missed, "Dropping slow log subscriber.");
                        return;
                    }
                    SubscriptionEvent::Closed => return,
                }
            }
        });

        Ok(())
    }

    fn subscribe_provision_logs(
        &self,
        mut sink: SubscriptionSink,
        request: devnet_rpc_types::StreamProvisionLogsRequest,
    ) -> SubscriptionResult {
        sink.accept()?;

        let key = LogBus::devnet_key(&request.namespace, &request.devnet);
        let mut subscription = self.bus.subscribe_provision(&key);

        tokio::spawn(async move {
            for entry in subscription.take_replay() {
                if !matches!(sink.send(&entry), Ok(true)) {
                    return;
                }
            }
            loop {
                match subscription.recv().await {
                    SubscriptionEvent::Entry(entry) => {
                        if !matches!(sink.send(&entry), Ok(true)) {
                            return;
                        }
                    }
                    SubscriptionEvent::Lagged(missed) => {
                        tracing::warn!(target: "rpc", %key, missed, "Dropping slow provision subscriber.");
                        return;
                    }
                    SubscriptionEvent::Closed => return,
                }
            }
        });

        Ok(())
    }

    fn subscribe_daemon_logs(&self, mut sink: SubscriptionSink) -> SubscriptionResult {
        sink.accept()?;

        let path = self.data_dir.daemon_log();
        tokio::spawn(async move {
            let Ok(content) = tokio::fs::read_to_string(&path).await else { return };

            let lines: Vec<&str> = content.lines().collect();
            let tail_start = lines.len().saturating_sub(DAEMON_LOG_TAIL);
            for line in &lines[tail_start..] {
                if !matches!(sink.send(&line.to_string()), Ok(true)) {
                    return;
                }
            }

            // Follow appended content by polling the file length.
            let mut offset = content.len() as u64;
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let Ok(metadata) = tokio::fs::metadata(&path).await else { return };
                if metadata.len() <= offset {
                    continue;
                }

                use tokio::io::{AsyncReadExt, AsyncSeekExt};
                let Ok(mut file) = tokio::fs::File::open(&path).await else { return };
                if file.seek(std::io::SeekFrom::Start(offset)).await.is_err() {
                    return;
                }
                let mut fresh = String::new();
                if file.read_to_string(&mut fresh).await.is_err() {
                    return;
                }
                offset += fresh.len() as u64;

                for line in fresh.lines() {
                    if !matches!(sink.send(&line.to_string()), Ok(true)) {
                        return;
                    }
                }
            }
        });

        Ok(())
    }
}

fn merge_meta(into: &mut BTreeMap<String, String>, from: BTreeMap<String, String>) {
    for (key, value) in from {
        into.insert(key, value);
    }
}
