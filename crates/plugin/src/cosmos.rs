use std::path::Path;

use devnet_primitives::{Mode, NetworkType};
use url::Url;

use crate::{CommandSpec, NetworkPlugin, PluginError, PluginInfo};

const BINARY: &str = "gaiad";
const REPO: &str = "github.com/cosmos/gaia";
const DEFAULT_VERSION: &str = "v18.1.0";

const MAINNET_RPC: &str = "https://rpc.cosmos.network";
const TESTNET_RPC: &str = "https://rpc.sentry-01.theta-testnet.polypore.xyz";

/// Plugin bundle for the Cosmos Hub.
#[derive(Debug, Default)]
pub struct CosmosPlugin;

impl NetworkPlugin for CosmosPlugin {
    fn name(&self) -> &str {
        "cosmos"
    }

    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: "cosmos".to_string(),
            display_name: "Cosmos Hub".to_string(),
            binary_name: BINARY.to_string(),
            default_version: DEFAULT_VERSION.to_string(),
            available_networks: vec![NetworkType::Mainnet, NetworkType::Testnet],
        }
    }

    fn binary_name(&self) -> &str {
        BINARY
    }

    fn default_repo(&self) -> &str {
        REPO
    }

    fn build_args(
        &self,
        _repo: &str,
        _git_ref: &str,
        go_version: &str,
        flags: &[String],
    ) -> CommandSpec {
        let mut cmd = CommandSpec::new("go")
            .args(["build", "-mod=readonly", "-o", &format!("build/{BINARY}")])
            .env("CGO_ENABLED", "0");
        if !go_version.is_empty() {
            cmd = cmd.env("GOTOOLCHAIN", format!("go{go_version}"));
        }
        cmd.args(flags.iter().cloned()).arg(format!("./cmd/{BINARY}"))
    }

    fn genesis_export(&self, binary_path: &Path, data_dir: &Path) -> CommandSpec {
        CommandSpec::new(binary_path.display().to_string())
            .arg("export")
            .args(["--home", &data_dir.display().to_string()])
    }

    fn genesis_fetch_rpc(
        &self,
        network_type: NetworkType,
        override_url: Option<&str>,
    ) -> Result<Url, PluginError> {
        let base = match (override_url, network_type) {
            (Some(url), _) => url,
            (None, NetworkType::Mainnet) => MAINNET_RPC,
            (None, NetworkType::Testnet) => TESTNET_RPC,
            (None, NetworkType::None) => {
                return Err(PluginError::NoRpcEndpoint {
                    plugin: self.name().to_string(),
                    network_type,
                })
            }
        };
        Ok(Url::parse(base)?.join("genesis")?)
    }

    fn init_args(&self, node_dir: &Path, moniker: &str, chain_id: &str) -> CommandSpec {
        CommandSpec::new(BINARY)
            .args(["init", moniker])
            .args(["--chain-id", chain_id])
            .args(["--home", &node_dir.display().to_string()])
    }

    fn show_node_id_args(&self, node_dir: &Path) -> CommandSpec {
        CommandSpec::new(BINARY)
            .args(["tendermint", "show-node-id"])
            .args(["--home", &node_dir.display().to_string()])
    }

    fn keys_add_args(&self, keyring_dir: &Path, key_name: &str, recover: bool) -> CommandSpec {
        let mut cmd = CommandSpec::new(BINARY)
            .args(["keys", "add", key_name])
            .args(["--keyring-backend", "test"])
            .args(["--keyring-dir", &keyring_dir.display().to_string()])
            .args(["--output", "json"]);
        if recover {
            cmd = cmd.arg("--recover");
        }
        cmd
    }

    fn add_genesis_account_args(
        &self,
        node_dir: &Path,
        address: &str,
        amount: &str,
    ) -> CommandSpec {
        CommandSpec::new(BINARY)
            .args(["genesis", "add-genesis-account", address, amount])
            .args(["--home", &node_dir.display().to_string()])
    }

    fn gentx_args(
        &self,
        node_dir: &Path,
        key_name: &str,
        amount: &str,
        chain_id: &str,
    ) -> CommandSpec {
        CommandSpec::new(BINARY)
            .args(["genesis", "gentx", key_name, amount])
            .args(["--chain-id", chain_id])
            .args(["--keyring-backend", "test"])
            .args(["--home", &node_dir.display().to_string()])
    }

    fn collect_gentxs_args(&self, node_dir: &Path) -> CommandSpec {
        CommandSpec::new(BINARY)
            .args(["genesis", "collect-gentxs"])
            .args(["--home", &node_dir.display().to_string()])
    }

    fn runtime_command(&self, node_dir: &Path, index: u32, mode: Mode) -> Option<CommandSpec> {
        match mode {
            Mode::Docker => None,
            Mode::Local => Some(
                CommandSpec::new(BINARY)
                    .arg("start")
                    .args(["--home", &node_dir.display().to_string()])
                    .args(["--rpc.laddr", &format!("tcp://127.0.0.1:{}", self.rpc_port(index))])
                    .args(["--p2p.laddr", &format!("tcp://127.0.0.1:{}", self.p2p_port(index))])
                    .args(["--grpc.address", &format!("127.0.0.1:{}", self.grpc_port(index))]),
            ),
        }
    }
}
