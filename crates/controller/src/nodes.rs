//! Node layout helpers shared by the orchestrator and the reconcile loop.

use std::path::Path;

use devnet_plugin::NetworkPlugin;
use devnet_primitives::{Devnet, Mode, Node, NodeRole};
use devnet_runtime::NodeContext;

use crate::store::DataDir;

const DEFAULT_HOST: &str = "127.0.0.1";

/// The role a node index maps to under a spec: validators first, then full
/// nodes.
pub fn role_of_index(validators: u32, index: u32) -> NodeRole {
    if index < validators {
        NodeRole::Validator
    } else {
        NodeRole::Fullnode
    }
}

/// Builds the runtime context for one node of a devnet.
pub fn node_context(
    devnet: &Devnet,
    node: &Node,
    plugin: &dyn NetworkPlugin,
    data_dir: &DataDir,
    binary_path: &Path,
) -> NodeContext {
    let home = data_dir.node_home(devnet.name.as_str(), &node.name.to_string());
    let index = node.index;

    let command = plugin.runtime_command(&home, index, devnet.spec.mode).unwrap_or_else(|| {
        devnet_plugin::CommandSpec::new(plugin.binary_name())
            .arg("start")
            .args(["--home", &home.display().to_string()])
    });

    let host = if node.spec.address.is_empty() {
        DEFAULT_HOST.to_string()
    } else {
        node.spec.address.clone()
    };

    NodeContext {
        namespace: devnet.namespace.to_string(),
        devnet: devnet.name.to_string(),
        node: node.name.to_string(),
        index,
        home,
        command,
        host,
        rpc_port: plugin.rpc_port(index),
        p2p_port: plugin.p2p_port(index),
        rest_port: plugin.rest_port(index),
        grpc_port: plugin.grpc_port(index),
        binary_path: binary_path.to_path_buf(),
    }
}

/// Rewrites a `key = value` line in a TOML config file in place.
///
/// Chain binaries generate their own config files on init; only individual
/// values (eg. `persistent_peers`) are adjusted, everything else is left as
/// the binary wrote it.
pub fn set_config_value(path: &Path, key: &str, value: &str) -> std::io::Result<()> {
    let content = std::fs::read_to_string(path)?;
    let prefix = format!("{key} =");
    let mut replaced = false;

    let updated: Vec<String> = content
        .lines()
        .map(|line| {
            if !replaced && line.trim_start().starts_with(&prefix) {
                replaced = true;
                format!("{key} = \"{value}\"")
            } else {
                line.to_string()
            }
        })
        .collect();

    let mut out = updated.join("\n");
    if !replaced {
        out.push_str(&format!("\n{key} = \"{value}\""));
    }
    out.push('\n');
    std::fs::write(path, out)
}

/// Whether the devnet mode runs nodes as containers.
pub fn is_docker(mode: Mode) -> bool {
    matches!(mode, Mode::Docker)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn roles_split_at_validator_count() {
        assert_eq!(role_of_index(2, 0), NodeRole::Validator);
        assert_eq!(role_of_index(2, 1), NodeRole::Validator);
        assert_eq!(role_of_index(2, 2), NodeRole::Fullnode);
    }

    #[test]
    fn config_value_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "moniker = \"validator-0\"\npersistent_peers = \"\"\nseeds = \"\"\n",
        )
        .unwrap();

        set_config_value(&path, "persistent_peers", "id@127.0.0.1:26656").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("persistent_peers = \"id@127.0.0.1:26656\""));
        assert!(content.contains("moniker = \"validator-0\""), "other keys untouched");
    }

    #[test]
    fn config_value_appends_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "moniker = \"x\"\n").unwrap();

        set_config_value(&path, "persistent_peers", "p").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with("persistent_peers = \"p\"\n"));
    }
}
