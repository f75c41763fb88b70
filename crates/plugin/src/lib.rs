//! Network plugin capability set.
//!
//! A plugin is a bundle of pure functions describing how one network family
//! is built, initialized and run. Everything downstream of the registry
//! (builder, forker, initializer, runtime) is network-agnostic and consumes
//! plugins only through the [`NetworkPlugin`] trait; supporting a new network
//! means registering a new bundle.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod cosmos;
mod patch;
mod registry;
mod stable;

use std::path::{Path, PathBuf};

pub use cosmos::CosmosPlugin;
use devnet_primitives::{Mode, NetworkType};
pub use patch::{GenesisPatch, PatchError};
pub use registry::PluginRegistry;
pub use stable::StablePlugin;
use url::Url;

/// Base port numbers. A node at index `i` gets `base + i * PORT_STRIDE`.
pub const RPC_PORT_BASE: u16 = 26657;
pub const P2P_PORT_BASE: u16 = 26656;
pub const REST_PORT_BASE: u16 = 1317;
pub const GRPC_PORT_BASE: u16 = 9090;
pub const PORT_STRIDE: u16 = 100;

/// An external command a plugin asks the daemon to run: argv plus environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new(), env: Vec::new() }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("unknown plugin {0:?}")]
    UnknownPlugin(String),

    #[error("plugin {plugin:?} has no RPC endpoint for network type {network_type}")]
    NoRpcEndpoint { plugin: String, network_type: NetworkType },

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("invalid endpoint url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Descriptive metadata surfaced by `ListNetworks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub display_name: String,
    pub binary_name: String,
    pub default_version: String,
    pub available_networks: Vec<NetworkType>,
}

/// The capability bundle for one network family.
///
/// All methods are pure: given the same inputs they return the same commands,
/// which is what makes build outputs content-addressable.
pub trait NetworkPlugin: Send + Sync {
    /// Canonical name of this plugin, eg. `stable`.
    fn name(&self) -> &str;

    fn info(&self) -> PluginInfo;

    /// Canonical executable name, eg. `stabled`.
    fn binary_name(&self) -> &str;

    /// Source repository the chain binary is built from.
    fn default_repo(&self) -> &str;

    /// Command line + environment for compiling the chain binary inside a
    /// checked-out working tree.
    fn build_args(&self, repo: &str, git_ref: &str, go_version: &str, flags: &[String])
        -> CommandSpec;

    /// Command emitting a current-state genesis from a local data directory,
    /// used by snapshot forking.
    fn genesis_export(&self, binary_path: &Path, data_dir: &Path) -> CommandSpec;

    /// Endpoint serving the genesis JSON for a public network.
    fn genesis_fetch_rpc(
        &self,
        network_type: NetworkType,
        override_url: Option<&str>,
    ) -> Result<Url, PluginError>;

    /// Rewrites `chain_id`, governance voting period and staking unbonding
    /// time in a raw genesis. Idempotent.
    fn genesis_patch(&self, raw: &[u8], opts: &GenesisPatch) -> Result<Vec<u8>, PluginError> {
        Ok(patch::patch_genesis(raw, opts)?)
    }

    /// Command initializing a node home directory.
    fn init_args(&self, node_dir: &Path, moniker: &str, chain_id: &str) -> CommandSpec;

    /// Where the node keeps its config files under its home directory.
    fn config_dir(&self, node_dir: &Path) -> PathBuf {
        node_dir.join("config")
    }

    fn show_node_id_args(&self, node_dir: &Path) -> CommandSpec;

    fn keys_add_args(&self, keyring_dir: &Path, key_name: &str, recover: bool) -> CommandSpec;

    /// Funds an account in a fresh genesis.
    fn add_genesis_account_args(&self, node_dir: &Path, address: &str, amount: &str)
        -> CommandSpec;

    /// Produces a validator's genesis transaction.
    fn gentx_args(
        &self,
        node_dir: &Path,
        key_name: &str,
        amount: &str,
        chain_id: &str,
    ) -> CommandSpec;

    /// Folds collected gentxs into the final genesis.
    fn collect_gentxs_args(&self, node_dir: &Path) -> CommandSpec;

    /// Command to run the node. `None` means the runtime uses its default
    /// (`<binary> start --home <dir>`).
    fn runtime_command(&self, node_dir: &Path, index: u32, mode: Mode) -> Option<CommandSpec> {
        let _ = (node_dir, index, mode);
        None
    }

    fn rpc_port(&self, index: u32) -> u16 {
        RPC_PORT_BASE + index as u16 * PORT_STRIDE
    }

    fn p2p_port(&self, index: u32) -> u16 {
        P2P_PORT_BASE + index as u16 * PORT_STRIDE
    }

    fn rest_port(&self, index: u32) -> u16 {
        REST_PORT_BASE + index as u16 * PORT_STRIDE
    }

    fn grpc_port(&self, index: u32) -> u16 {
        GRPC_PORT_BASE + index as u16 * PORT_STRIDE
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn port_arithmetic_uses_index_stride() {
        let registry = PluginRegistry::default();
        let plugin = registry.get("stable").unwrap();

        assert_eq!(plugin.rpc_port(0), 26657);
        assert_eq!(plugin.rpc_port(1), 26757);
        assert_eq!(plugin.p2p_port(2), 26856);
        assert_eq!(plugin.rest_port(1), 1417);
        assert_eq!(plugin.grpc_port(3), 9390);
    }

    #[test]
    fn build_args_are_deterministic() {
        let registry = PluginRegistry::default();
        let plugin = registry.get("stable").unwrap();

        let flags = vec!["-tags=netgo".to_string()];
        let a = plugin.build_args("github.com/altuslabsxyz/stable", "v1.2.0", "1.22", &flags);
        let b = plugin.build_args("github.com/altuslabsxyz/stable", "v1.2.0", "1.22", &flags);
        assert_eq!(a, b);
    }
}
