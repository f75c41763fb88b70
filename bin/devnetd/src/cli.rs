use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use devnet_build::{BinaryCache, Builder};
use devnet_controller::{
    ControllerConfig, DataDir, DevnetController, Provisioner, ProvisionerConfig,
};
use devnet_genesis::GenesisForker;
use devnet_log::{LogBus, LogFormat};
use devnet_plugin::PluginRegistry;
use devnet_rpc::api::DevnetApi;
use devnet_rpc::auth::Identity;
use devnet_rpc::RpcServer;
use devnet_rpc_api::DevnetApiServer;
use devnet_runtime::Runtime;
use devnet_tasks::TaskManager;
use tracing::info;

/// Default port of the loopback RPC listener.
pub const DEFAULT_RPC_PORT: u16 = 7433;

/// How often unused binary cache entries are swept, and how long an entry
/// may stay unused before the sweep removes it.
const CACHE_GC_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
const CACHE_MAX_AGE: Duration = Duration::from_secs(14 * 24 * 60 * 60);

#[derive(Debug, Parser)]
#[command(name = "devnetd", version, about = "Devnet control plane daemon")]
pub struct Cli {
    /// Data root holding devnet homes, the binary cache and the daemon log.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Address of the trusted loopback listener.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    addr: IpAddr,

    #[arg(long, default_value_t = DEFAULT_RPC_PORT)]
    port: u16,

    /// Optional remote listener; requires --api-keys. Expects a TLS
    /// terminating proxy in front of it.
    #[arg(long, value_name = "ADDR")]
    remote_addr: Option<SocketAddr>,

    /// TOML file mapping API keys to identities, for the remote listener.
    #[arg(long, value_name = "FILE")]
    api_keys: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Full)]
    log_format: LogFormat,

    /// Verbose developer logging.
    #[arg(long)]
    dev: bool,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to build tokio runtime")?;
        runtime.block_on(self.serve())
    }

    async fn serve(self) -> Result<()> {
        let data_root = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::home_dir()
                .context("cannot determine home directory; pass --data-dir")?
                .join(".devnet-builder"),
        };
        std::fs::create_dir_all(&data_root)
            .with_context(|| format!("failed to create data dir {}", data_root.display()))?;
        let data_dir = DataDir::new(&data_root);

        devnet_log::init(self.log_format, self.dev, Some(&data_dir.daemon_log()))?;
        info!(version = env!("CARGO_PKG_VERSION"), data = %data_root.display(), "devnetd starting.");

        let manager = TaskManager::current();
        let bus = Arc::new(LogBus::new());
        let registry = PluginRegistry::default();

        let builder = Arc::new(Builder::new(BinaryCache::new(data_dir.bin_cache())));
        let forker = Arc::new(GenesisForker::new(data_dir.bin_cache()));
        let runtime = Arc::new(Runtime::new(bus.clone()));

        let provisioner = Arc::new(Provisioner::new(
            registry.clone(),
            builder.clone(),
            forker,
            runtime.clone(),
            bus.clone(),
            data_dir.clone(),
            ProvisionerConfig::default(),
        ));

        let controller = Arc::new(DevnetController::new(
            registry,
            provisioner,
            runtime.clone(),
            bus.clone(),
            data_dir.clone(),
            manager.task_spawner(),
            ControllerConfig::default(),
        ));

        // --- rpc listeners

        let api = DevnetApi::new(
            controller.clone(),
            builder.clone(),
            bus,
            data_dir,
            Identity::trusted(),
            env!("CARGO_PKG_VERSION"),
        );
        let mut module = jsonrpsee::RpcModule::new(());
        module.merge(api.into_rpc()).expect("api methods are disjoint");

        let local = RpcServer::new()
            .health_check(true)
            .module(module.clone())?
            .start(SocketAddr::new(self.addr, self.port))
            .await?;

        let remote = match self.remote_addr {
            Some(addr) => {
                let keys_path = self
                    .api_keys
                    .as_ref()
                    .context("--remote-addr requires --api-keys")?;
                let keys = keys::load(keys_path)?;
                let handle = RpcServer::new()
                    .http_only(true)
                    .auth(keys)
                    .module(module)?
                    .start(addr)
                    .await?;
                Some(handle)
            }
            None => None,
        };

        // --- background cache GC

        let gc_builder = builder.clone();
        manager.task_spawner().build_task().name("cache-gc").spawn(async move {
            let mut tick = tokio::time::interval(CACHE_GC_INTERVAL);
            loop {
                tick.tick().await;
                match gc_builder.clean(CACHE_MAX_AGE) {
                    Ok(removed) if !removed.is_empty() => {
                        info!(target: "builder", count = removed.len(), "Swept binary cache.");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(target: "builder", %err, "Binary cache sweep failed.");
                    }
                }
            }
        });

        // --- run until interrupted

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down.");
            }
            _ = manager.cancelled() => {
                info!("Critical task failed, shutting down.");
            }
        }

        controller.shutdown();
        runtime.cleanup().await.ok();
        local.stop().ok();
        if let Some(remote) = remote {
            remote.stop().ok();
        }
        manager.shutdown().await;

        info!("devnetd stopped.");
        Ok(())
    }
}

mod keys {
    use std::collections::HashMap;
    use std::path::Path;

    use anyhow::{Context, Result};
    use devnet_rpc::auth::{ApiKeySet, Identity};
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct KeyFile {
        #[serde(default)]
        identities: Vec<IdentityEntry>,
    }

    #[derive(Debug, Deserialize)]
    struct IdentityEntry {
        name: String,
        key: String,
        namespaces: Vec<String>,
    }

    /// Loads the API key file:
    ///
    /// ```toml
    /// [[identities]]
    /// name = "ci"
    /// key = "..."
    /// namespaces = ["team-a"]
    /// ```
    pub fn load(path: &Path) -> Result<ApiKeySet> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read API key file {}", path.display()))?;
        let file: KeyFile = toml::from_str(&raw)
            .with_context(|| format!("invalid API key file {}", path.display()))?;

        let mut keys = HashMap::new();
        for entry in file.identities {
            keys.insert(entry.key, Identity::new(entry.name, entry.namespaces));
        }
        Ok(ApiKeySet::new(keys))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_identities() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("keys.toml");
            std::fs::write(
                &path,
                "[[identities]]\nname = \"ci\"\nkey = \"k1\"\nnamespaces = [\"team-a\"]\n\n\
                 [[identities]]\nname = \"ops\"\nkey = \"k2\"\nnamespaces = [\"*\"]\n",
            )
            .unwrap();

            let keys = load(&path).unwrap();
            let ci = keys.resolve("k1").unwrap();
            assert_eq!(ci.name, "ci");
            assert!(ci.allows("team-a"));
            assert!(!ci.allows("team-b"));

            let ops = keys.resolve("k2").unwrap();
            assert!(ops.is_wildcard());

            assert!(keys.resolve("nope").is_none());
        }
    }
}
