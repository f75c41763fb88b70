//! RPC server assembly.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod api;
pub mod auth;
pub mod health;

use std::net::SocketAddr;
use std::time::Duration;

use jsonrpsee::server::{AllowHosts, ServerBuilder, ServerHandle};
use jsonrpsee::RpcModule;
use tower::ServiceBuilder;
use tracing::info;

use auth::ApiKeySet;
use health::HealthCheck;

/// The default maximum number of concurrent RPC connections.
pub const DEFAULT_RPC_MAX_CONNECTIONS: u32 = 100;
/// The default timeout for an RPC request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Jsonrpsee(#[from] jsonrpsee::core::Error),

    #[error("RPC server has already been stopped")]
    AlreadyStopped,
}

/// The RPC server handle.
#[derive(Debug, Clone)]
pub struct RpcServerHandle {
    /// The actual address that the server is bound to.
    addr: SocketAddr,
    /// The handle to the spawned [`jsonrpsee::server::Server`].
    handle: ServerHandle,
}

impl RpcServerHandle {
    /// Tell the server to stop without waiting for the server to stop.
    pub fn stop(&self) -> Result<(), Error> {
        self.handle.stop().map_err(|_| Error::AlreadyStopped)
    }

    /// Wait until the server has stopped.
    pub async fn stopped(self) {
        self.handle.stopped().await
    }

    /// Returns the socket address the server is listening on.
    pub fn addr(&self) -> &SocketAddr {
        &self.addr
    }
}

#[derive(Debug)]
pub struct RpcServer {
    health_check: bool,
    module: RpcModule<()>,
    max_connections: u32,
    timeout: Duration,
    /// Remote listeners only serve HTTP; subscriptions stay on the trusted
    /// loopback listener.
    http_only: bool,
    auth: Option<ApiKeySet>,
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcServer {
    pub fn new() -> Self {
        Self {
            health_check: false,
            module: RpcModule::new(()),
            max_connections: DEFAULT_RPC_MAX_CONNECTIONS,
            timeout: DEFAULT_TIMEOUT,
            http_only: false,
            auth: None,
        }
    }

    /// Set the maximum number of connections allowed. Default is 100.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the timeout for the server. Default is 20 seconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enables health checking endpoint via HTTP `GET /health`.
    pub fn health_check(mut self, enable: bool) -> Self {
        self.health_check = enable;
        self
    }

    /// Serve HTTP only, rejecting websocket upgrades.
    pub fn http_only(mut self, enable: bool) -> Self {
        self.http_only = enable;
        self
    }

    /// Require an API key and enforce per-identity namespaces.
    pub fn auth(mut self, keys: ApiKeySet) -> Self {
        self.auth = Some(keys);
        self
    }

    /// Adds a new RPC module to the server.
    ///
    /// This can be chained with other calls to `module` to add multiple modules.
    pub fn module(mut self, module: RpcModule<()>) -> Result<Self, Error> {
        self.module.merge(module)?;
        Ok(self)
    }

    pub async fn start(&self, addr: SocketAddr) -> Result<RpcServerHandle, Error> {
        let mut modules = self.module.clone();

        let health_check_proxy = if self.health_check {
            modules.merge(HealthCheck)?;
            Some(HealthCheck::proxy())
        } else {
            None
        };

        let auth_layer = self.auth.clone().map(auth::ApiKeyLayer::new);

        let middleware = ServiceBuilder::new()
            .option_layer(health_check_proxy)
            .option_layer(auth_layer)
            .timeout(self.timeout);

        let mut builder = ServerBuilder::new()
            .set_middleware(middleware)
            .set_host_filtering(AllowHosts::Any)
            .max_connections(self.max_connections);

        if self.http_only {
            builder = builder.http_only();
        }

        let server = builder.build(addr).await?;
        let addr = server.local_addr()?;
        let handle = server.start(modules)?;
        let handle = RpcServerHandle { addr, handle };

        // The socket address that we log out must be from the RPC handle, in
        // the case that the `addr` passed to this method has port number 0,
        // which gets resolved to a free port during `build`.
        info!(target: "rpc", addr = %handle.addr, "RPC server started.");

        Ok(handle)
    }
}
