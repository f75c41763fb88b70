//! Node home initialization and key management.

use std::path::{Path, PathBuf};

use devnet_plugin::NetworkPlugin;
use devnet_utils::{run_command, run_command_with_stdin};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::RuntimeError;

/// Deterministic test mnemonics, indexed by validator number.
///
/// Key material derived from these is stable across runs, which lets
/// genesis-dependent artifacts (gentxs, account addresses) be pre-derived.
/// They are only ever used with the `test` keyring backend.
pub const TEST_MNEMONICS: &[&str] = &[
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon \
     abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon \
     abandon art",
    "legal winner thank year wave sausage worth useful legal winner thank year wave sausage \
     worth useful legal winner thank year wave sausage worth title",
    "letter advice cage absurd amount doctor acoustic avoid letter advice cage absurd amount \
     doctor acoustic avoid letter advice cage absurd amount doctor acoustic bless",
    "zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo \
     zoo vote",
    "ozone drill grab fiber curtain grace pudding thank cruise elder eight picnic ordinary \
     feature picnic prepare lecture hollow stand amazing coconut gossip calm absent",
    "gravity machine north sort system female filter attitude volume fold club stay feature \
     office ecology stable narrow fence scout proud patrol regular sunset heavy",
    "hamster diagram private dutch cause delay private meat slide toddler razor book happy \
     fancy gospel tennis maple dilemma loan word shrug inflict delay length",
    "panda eyebrow bullet gorilla call smoke muffin taste mesh discover soft ostrich alcohol \
     speed nation flash devote level hobby quick inner drive ghost inside",
    "all hour make first leader extend hole alien behind guard gospel lava path output census \
     museum junior mass reopen famous sing advance salt reform",
    "void come effort suffer camp survey warrior heavy shoot primary clutch crush open amazing \
     screen patrol group space point ten exist slush involve unfold",
];

/// Returns the deterministic mnemonic for a validator index, cycling past the
/// end of the table.
pub fn test_mnemonic(index: u32) -> &'static str {
    TEST_MNEMONICS[index as usize % TEST_MNEMONICS.len()]
}

/// Key metadata parsed from the chain binary's `keys add` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub name: String,
    pub address: String,
}

/// Initializes node home directories via the plugin's chain binary.
#[derive(Debug, Clone)]
pub struct Initializer {
    binary_path: PathBuf,
}

impl Initializer {
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self { binary_path: binary_path.into() }
    }

    fn with_binary(&self, mut cmd: devnet_plugin::CommandSpec) -> devnet_plugin::CommandSpec {
        cmd.program = self.binary_path.display().to_string();
        cmd
    }

    /// Runs `init` for a node home and verifies the plugin's config directory
    /// actually appeared.
    pub async fn init_home(
        &self,
        plugin: &dyn NetworkPlugin,
        node_dir: &Path,
        moniker: &str,
        chain_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        std::fs::create_dir_all(node_dir)?;

        let cmd = self.with_binary(plugin.init_args(node_dir, moniker, chain_id));
        let out = run_command(&cmd, node_dir, cancel, |_| {}).await?;
        if !out.success {
            return Err(RuntimeError::Backend {
                context: format!("init {moniker}"),
                stderr: out.stderr(),
            });
        }

        let config_dir = plugin.config_dir(node_dir);
        if !config_dir.is_dir() {
            return Err(RuntimeError::InitVerification { path: config_dir });
        }

        debug!(target: "runtime", node = moniker, "Node home initialized.");
        Ok(())
    }

    /// Reads the node's p2p identity: `config/node_key.json` when present,
    /// falling back to the binary's `show-node-id`.
    pub async fn node_id(
        &self,
        plugin: &dyn NetworkPlugin,
        node_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, RuntimeError> {
        let key_file = plugin.config_dir(node_dir).join("node_key.json");
        if let Ok(raw) = std::fs::read(&key_file) {
            if let Some(id) = node_id_from_key_file(&raw) {
                return Ok(id);
            }
        }

        let cmd = self.with_binary(plugin.show_node_id_args(node_dir));
        let out = run_command(&cmd, node_dir, cancel, |_| {}).await?;
        if !out.success {
            return Err(RuntimeError::Backend {
                context: "show-node-id".to_string(),
                stderr: out.stderr(),
            });
        }
        Ok(out.stdout.trim().to_string())
    }

    /// Creates (or deterministically recovers) a key in the keyring.
    ///
    /// When `validator_index` is set, the key is recovered from the
    /// well-known mnemonic table so addresses are stable across runs.
    pub async fn create_key(
        &self,
        plugin: &dyn NetworkPlugin,
        keyring_dir: &Path,
        key_name: &str,
        validator_index: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<KeyInfo, RuntimeError> {
        std::fs::create_dir_all(keyring_dir)?;

        let recover = validator_index.is_some();
        let cmd = self.with_binary(plugin.keys_add_args(keyring_dir, key_name, recover));

        let out = match validator_index {
            Some(index) => {
                let mnemonic = format!("{}\n", test_mnemonic(index));
                run_command_with_stdin(&cmd, keyring_dir, &mnemonic, cancel).await?
            }
            None => run_command(&cmd, keyring_dir, cancel, |_| {}).await?,
        };

        if !out.success {
            return Err(RuntimeError::Backend {
                context: format!("keys add {key_name}"),
                stderr: out.stderr(),
            });
        }

        // `keys add --output json` writes the record to stderr on some SDK
        // versions and stdout on others; try both.
        let parsed = parse_key_output(&out.stdout)
            .or_else(|| parse_key_output(&out.stderr()))
            .unwrap_or_else(|| KeyInfo { name: key_name.to_string(), address: String::new() });
        Ok(parsed)
    }
}

fn node_id_from_key_file(raw: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(raw).ok()?;
    value.get("id").and_then(|v| v.as_str()).map(str::to_string)
}

fn parse_key_output(raw: &str) -> Option<KeyInfo> {
    let value: serde_json::Value = serde_json::from_str(raw.trim()).ok()?;
    Some(KeyInfo {
        name: value.get("name")?.as_str()?.to_string(),
        address: value.get("address")?.as_str()?.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn mnemonics_are_deterministic_and_cycle() {
        assert_eq!(test_mnemonic(0), TEST_MNEMONICS[0]);
        assert_eq!(test_mnemonic(3), test_mnemonic(3));
        assert_eq!(test_mnemonic(TEST_MNEMONICS.len() as u32), TEST_MNEMONICS[0]);
    }

    #[test]
    fn key_output_parsing() {
        let json = r#"{"name":"validator-0","type":"local","address":"stable1abcd","mnemonic":""}"#;
        let info = parse_key_output(json).unwrap();
        assert_eq!(info.name, "validator-0");
        assert_eq!(info.address, "stable1abcd");

        assert!(parse_key_output("not json").is_none());
    }

    #[test]
    fn node_id_prefers_key_file() {
        let raw = br#"{"id":"deadbeefcafe","priv_key":{}}"#;
        assert_eq!(node_id_from_key_file(raw).unwrap(), "deadbeefcafe");
    }
}
