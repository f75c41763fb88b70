//! Shared fixtures: a scriptable network plugin whose chain binary is
//! `/bin/sh`, and a minimal HTTP responder standing in for a node's RPC
//! `/status` endpoint.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;

use devnet_plugin::{CommandSpec, NetworkPlugin, PluginError, PluginInfo};
use devnet_primitives::{Mode, NetworkType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

/// A plugin whose every command is a small shell script, so provisioning can
/// run end-to-end without a real chain binary.
pub struct ScriptedPlugin {
    pub rpc_base: u16,
}

impl NetworkPlugin for ScriptedPlugin {
    fn name(&self) -> &str {
        "fakechain"
    }

    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: "fakechain".into(),
            display_name: "Fake Chain".into(),
            binary_name: "fakechaind".into(),
            default_version: "v0.1.0".into(),
            available_networks: vec![],
        }
    }

    fn binary_name(&self) -> &str {
        "fakechaind"
    }

    fn default_repo(&self) -> &str {
        "example.com/fake/chain"
    }

    fn build_args(&self, _: &str, _: &str, _: &str, _: &[String]) -> CommandSpec {
        CommandSpec::new("true")
    }

    fn genesis_export(&self, _: &Path, _: &Path) -> CommandSpec {
        CommandSpec::new("sh").args(["-c", "echo '{\"chain_id\":\"exported\"}'"])
    }

    fn genesis_fetch_rpc(
        &self,
        _network_type: NetworkType,
        override_url: Option<&str>,
    ) -> Result<Url, PluginError> {
        Ok(Url::parse(override_url.unwrap_or("http://127.0.0.1:1/genesis"))?)
    }

    fn init_args(&self, node_dir: &Path, _moniker: &str, _chain_id: &str) -> CommandSpec {
        let home = node_dir.display();
        CommandSpec::new("sh").args([
            "-c".to_string(),
            format!(
                "mkdir -p {home}/config && \
                 echo '{{\"chain_id\":\"fresh\"}}' > {home}/config/genesis.json && \
                 echo '{{\"id\":\"nodeid{home}\"}}' > {home}/config/node_key.json && \
                 printf 'persistent_peers = \"\"\\n' > {home}/config/config.toml"
            ),
        ])
    }

    fn show_node_id_args(&self, _node_dir: &Path) -> CommandSpec {
        CommandSpec::new("sh").args(["-c", "echo stubnodeid"])
    }

    fn keys_add_args(&self, _keyring_dir: &Path, key_name: &str, _recover: bool) -> CommandSpec {
        CommandSpec::new("sh").args([
            "-c".to_string(),
            format!(
                "cat > /dev/null; echo '{{\"name\":\"{key_name}\",\"address\":\"fake1{key_name}\"}}'"
            ),
        ])
    }

    fn add_genesis_account_args(&self, _node_dir: &Path, _address: &str, _amount: &str) -> CommandSpec {
        CommandSpec::new("true")
    }

    fn gentx_args(&self, node_dir: &Path, key_name: &str, _amount: &str, _chain_id: &str) -> CommandSpec {
        let home = node_dir.display();
        CommandSpec::new("sh").args([
            "-c".to_string(),
            format!("mkdir -p {home}/config/gentx && echo gentx > {home}/config/gentx/{key_name}.json"),
        ])
    }

    fn collect_gentxs_args(&self, _node_dir: &Path) -> CommandSpec {
        CommandSpec::new("true")
    }

    fn runtime_command(&self, _node_dir: &Path, _index: u32, _mode: Mode) -> Option<CommandSpec> {
        Some(CommandSpec::new("/bin/sh").args(["-c", "sleep 60"]))
    }

    // Every node shares one status endpoint; the fixture only ever binds a
    // single stub server.
    fn rpc_port(&self, _index: u32) -> u16 {
        self.rpc_base
    }

    fn p2p_port(&self, index: u32) -> u16 {
        self.rpc_base + 1000 + index as u16
    }

    fn rest_port(&self, index: u32) -> u16 {
        self.rpc_base + 2000 + index as u16
    }

    fn grpc_port(&self, index: u32) -> u16 {
        self.rpc_base + 3000 + index as u16
    }
}

/// Serves a canned comet `/status` body on an OS-assigned port; returns the
/// bound address. Runs until the test process exits.
pub async fn spawn_status_server(height: u64) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind status stub");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;

                let body = format!(
                    "{{\"result\":{{\"sync_info\":{{\"latest_block_height\":\"{height}\"}}}}}}"
                );
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });

    addr
}
