//! RPC API trait and error taxonomy.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod error;

use devnet_rpc_types::{
    ApplyDevnetRequest, ApplyDevnetResponse, DevnetRef, DevnetResponse, ExecInNodeRequest,
    ExecInNodeResponse, ListBinaryVersionsRequest, ListBinaryVersionsResponse,
    ListDevnetsRequest, ListDevnetsResponse, ListNetworksResponse, ListNodesResponse, LogLine,
    NodeHealthResponse, NodePortsResponse, NodeRef, NodeResponse, PingResponse,
    ProvisionLogEntry, StreamNodeLogsRequest, StreamProvisionLogsRequest, WhoAmIResponse,
};
pub use error::{ApiError, ErrorCode};
use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;

/// The devnet control API, served on the daemon's local socket and (behind
/// API-key auth) its remote listener.
#[cfg_attr(feature = "client", rpc(server, client, namespace = "devnet"))]
#[cfg_attr(not(feature = "client"), rpc(server, namespace = "devnet"))]
pub trait DevnetApi {
    #[method(name = "ping")]
    async fn ping(&self) -> RpcResult<PingResponse>;

    #[method(name = "whoAmI")]
    async fn who_am_i(&self) -> RpcResult<WhoAmIResponse>;

    #[method(name = "listNetworks")]
    async fn list_networks(&self) -> RpcResult<ListNetworksResponse>;

    #[method(name = "listBinaryVersions")]
    async fn list_binary_versions(
        &self,
        request: ListBinaryVersionsRequest,
    ) -> RpcResult<ListBinaryVersionsResponse>;

    #[method(name = "applyDevnet")]
    async fn apply_devnet(&self, request: ApplyDevnetRequest) -> RpcResult<ApplyDevnetResponse>;

    #[method(name = "createDevnet")]
    async fn create_devnet(&self, request: ApplyDevnetRequest) -> RpcResult<ApplyDevnetResponse>;

    #[method(name = "getDevnet")]
    async fn get_devnet(&self, request: DevnetRef) -> RpcResult<DevnetResponse>;

    #[method(name = "listDevnets")]
    async fn list_devnets(&self, request: ListDevnetsRequest) -> RpcResult<ListDevnetsResponse>;

    #[method(name = "deleteDevnet")]
    async fn delete_devnet(&self, request: DevnetRef) -> RpcResult<()>;

    #[method(name = "startDevnet")]
    async fn start_devnet(&self, request: DevnetRef) -> RpcResult<DevnetResponse>;

    #[method(name = "stopDevnet")]
    async fn stop_devnet(&self, request: DevnetRef) -> RpcResult<DevnetResponse>;

    #[method(name = "listNodes")]
    async fn list_nodes(&self, request: DevnetRef) -> RpcResult<ListNodesResponse>;

    #[method(name = "getNode")]
    async fn get_node(&self, request: NodeRef) -> RpcResult<NodeResponse>;

    #[method(name = "startNode")]
    async fn start_node(&self, request: NodeRef) -> RpcResult<NodeResponse>;

    #[method(name = "stopNode")]
    async fn stop_node(&self, request: NodeRef) -> RpcResult<NodeResponse>;

    #[method(name = "restartNode")]
    async fn restart_node(&self, request: NodeRef) -> RpcResult<NodeResponse>;

    #[method(name = "getNodeHealth")]
    async fn get_node_health(&self, request: NodeRef) -> RpcResult<NodeHealthResponse>;

    #[method(name = "getNodePorts")]
    async fn get_node_ports(&self, request: NodeRef) -> RpcResult<NodePortsResponse>;

    #[method(name = "execInNode")]
    async fn exec_in_node(&self, request: ExecInNodeRequest) -> RpcResult<ExecInNodeResponse>;

    #[subscription(name = "subscribeNodeLogs" => "nodeLog", unsubscribe = "unsubscribeNodeLogs", item = LogLine)]
    fn subscribe_node_logs(&self, request: StreamNodeLogsRequest);

    #[subscription(name = "subscribeProvisionLogs" => "provisionLog", unsubscribe = "unsubscribeProvisionLogs", item = ProvisionLogEntry)]
    fn subscribe_provision_logs(&self, request: StreamProvisionLogsRequest);

    #[subscription(name = "subscribeDaemonLogs" => "daemonLog", unsubscribe = "unsubscribeDaemonLogs", item = String)]
    fn subscribe_daemon_logs(&self);
}
