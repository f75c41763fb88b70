//! Genesis forker.
//!
//! Obtains a source genesis from a local file, a chain snapshot or a public
//! RPC endpoint (in that order of precedence), then rewrites chain id and
//! governance/staking parameters through the plugin's patch capability.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod snapshot;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use devnet_log::StepSink;
use devnet_plugin::{GenesisPatch, NetworkPlugin, PluginError};
use devnet_primitives::{DevnetSpec, ProvisionPhase, StepEvent};
pub use snapshot::snapshot_cache_key;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ForkError {
    #[error("failed to read genesis file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("snapshot checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("snapshot extraction failed: {0}")]
    Extract(std::io::Error),

    #[error("snapshot export failed: {stderr}")]
    Export { stderr: String },

    #[error("genesis endpoint returned no usable document")]
    EmptyGenesis,

    #[error("fork cancelled")]
    Cancelled,

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Command(#[from] devnet_utils::CommandError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Where the source genesis comes from. Precedence when deriving from a spec:
/// local path, then snapshot URL, then RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkSource {
    LocalFile { path: PathBuf },
    Snapshot { url: String, binary_path: PathBuf, checksum: Option<String> },
    Rpc { network_type: devnet_primitives::NetworkType, override_url: Option<String> },
}

impl ForkSource {
    /// Derives the fork source from a devnet spec. `None` means the devnet
    /// starts from a fresh genesis (no forking at all).
    ///
    /// Snapshot mode needs the built binary to run the export, so it is only
    /// selected when a binary path is available.
    pub fn from_spec(spec: &DevnetSpec, binary_path: Option<&Path>) -> Option<Self> {
        if !spec.genesis_path.is_empty() {
            return Some(Self::LocalFile { path: PathBuf::from(&spec.genesis_path) });
        }
        if !spec.snapshot_url.is_empty() {
            if let Some(binary) = binary_path {
                return Some(Self::Snapshot {
                    url: spec.snapshot_url.clone(),
                    binary_path: binary.to_path_buf(),
                    checksum: None,
                });
            }
        }
        if !spec.fork_network.is_empty() || !spec.rpc_url.is_empty() {
            let override_url =
                if spec.rpc_url.is_empty() { None } else { Some(spec.rpc_url.clone()) };
            return Some(Self::Rpc { network_type: spec.network_type, override_url });
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SourceMode {
    File,
    Snapshot,
    Rpc,
}

/// Options of one fork invocation.
#[derive(Debug, Clone)]
pub struct ForkOptions {
    pub source: ForkSource,
    pub patch: GenesisPatch,
    pub no_cache: bool,
}

/// The product of a fork: patched genesis bytes plus provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct ForkedGenesis {
    pub bytes: Vec<u8>,
    pub source_chain_id: String,
    pub new_chain_id: String,
    pub source_mode: SourceMode,
    pub fetched_at: DateTime<Utc>,
}

/// Fetches and patches genesis documents.
#[derive(Debug)]
pub struct GenesisForker {
    client: reqwest::Client,
    cache_dir: PathBuf,
}

impl GenesisForker {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self { client: reqwest::Client::new(), cache_dir: cache_dir.into() }
    }

    pub async fn fork(
        &self,
        plugin: &dyn NetworkPlugin,
        opts: &ForkOptions,
        sink: &dyn StepSink,
        cancel: &CancellationToken,
    ) -> Result<ForkedGenesis, ForkError> {
        let (raw, source_mode) = match &opts.source {
            ForkSource::LocalFile { path } => {
                sink.step(
                    ProvisionPhase::Forking,
                    StepEvent::running("read").detail(path.display().to_string()),
                );
                let raw = std::fs::read(path)
                    .map_err(|source| ForkError::ReadFile { path: path.clone(), source })?;
                sink.step(ProvisionPhase::Forking, StepEvent::completed("read"));
                (raw, SourceMode::File)
            }
            ForkSource::Snapshot { url, binary_path, checksum } => {
                let raw = snapshot::fork_from_snapshot(
                    &self.client,
                    &self.cache_dir,
                    plugin,
                    url,
                    binary_path,
                    checksum.as_deref(),
                    opts.no_cache,
                    sink,
                    cancel,
                )
                .await?;
                (raw, SourceMode::Snapshot)
            }
            ForkSource::Rpc { network_type, override_url } => {
                let url = plugin.genesis_fetch_rpc(*network_type, override_url.as_deref())?;
                sink.step(
                    ProvisionPhase::Forking,
                    StepEvent::running("fetch").detail(url.to_string()),
                );
                let body = self.client.get(url).send().await?.error_for_status()?.bytes().await?;
                let raw = extract_genesis_document(&body)?;
                sink.step(ProvisionPhase::Forking, StepEvent::completed("fetch"));
                (raw, SourceMode::Rpc)
            }
        };

        if cancel.is_cancelled() {
            return Err(ForkError::Cancelled);
        }

        let source_chain_id = chain_id_of(&raw).unwrap_or_default();

        sink.step(ProvisionPhase::Forking, StepEvent::running("patch"));
        let bytes = plugin.genesis_patch(&raw, &opts.patch)?;
        sink.step(ProvisionPhase::Forking, StepEvent::completed("patch"));

        let new_chain_id = if opts.patch.chain_id.is_empty() {
            source_chain_id.clone()
        } else {
            opts.patch.chain_id.clone()
        };

        info!(
            target: "provisioner",
            source = %source_mode,
            from = %source_chain_id,
            to = %new_chain_id,
            "Genesis forked.",
        );

        Ok(ForkedGenesis { bytes, source_chain_id, new_chain_id, source_mode, fetched_at: Utc::now() })
    }
}

/// Unwraps a genesis document out of a JSON-RPC response body.
///
/// Accepts the node envelope (`{"result":{"genesis":…}}`), a bare
/// `{"genesis":…}` wrapper, or an unwrapped genesis document.
fn extract_genesis_document(body: &[u8]) -> Result<Vec<u8>, ForkError> {
    let value: serde_json::Value = serde_json::from_slice(body)?;

    let genesis = if let Some(genesis) = value.pointer("/result/genesis") {
        genesis
    } else if let Some(genesis) = value.get("genesis") {
        genesis
    } else if value.get("chain_id").is_some() {
        &value
    } else {
        return Err(ForkError::EmptyGenesis);
    };

    Ok(serde_json::to_vec(genesis)?)
}

/// Reads `chain_id` out of raw genesis bytes.
fn chain_id_of(raw: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(raw).ok()?;
    value.get("chain_id")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use devnet_primitives::NetworkType;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn spec() -> DevnetSpec {
        DevnetSpec { plugin: "stable".into(), ..Default::default() }
    }

    #[test]
    fn source_precedence_is_file_snapshot_rpc() {
        let binary = PathBuf::from("/tmp/stabled");

        let all = DevnetSpec {
            genesis_path: "/tmp/genesis.json".into(),
            snapshot_url: "https://snaps.example/latest.tar.gz".into(),
            rpc_url: "https://rpc.example".into(),
            ..spec()
        };
        assert_matches::assert_matches!(
            ForkSource::from_spec(&all, Some(binary.as_path())),
            Some(ForkSource::LocalFile { .. })
        );

        let no_file = DevnetSpec { genesis_path: String::new(), ..all.clone() };
        assert_matches::assert_matches!(
            ForkSource::from_spec(&no_file, Some(binary.as_path())),
            Some(ForkSource::Snapshot { .. })
        );

        let rpc_only = DevnetSpec {
            genesis_path: String::new(),
            snapshot_url: String::new(),
            ..all.clone()
        };
        assert_matches::assert_matches!(
            ForkSource::from_spec(&rpc_only, Some(binary.as_path())),
            Some(ForkSource::Rpc { .. })
        );

        assert_eq!(ForkSource::from_spec(&spec(), Some(binary.as_path())), None);
    }

    #[test]
    fn snapshot_without_binary_falls_through() {
        let s = DevnetSpec {
            snapshot_url: "https://snaps.example/latest.tar.gz".into(),
            fork_network: "mainnet".into(),
            network_type: NetworkType::Mainnet,
            ..spec()
        };
        assert_matches::assert_matches!(
            ForkSource::from_spec(&s, None),
            Some(ForkSource::Rpc { network_type: NetworkType::Mainnet, .. })
        );
    }

    #[test]
    fn genesis_envelope_unwrapping() {
        let doc = json!({ "chain_id": "x-1", "app_state": {} });

        let enveloped = serde_json::to_vec(&json!({ "result": { "genesis": doc } })).unwrap();
        let wrapped = serde_json::to_vec(&json!({ "genesis": doc })).unwrap();
        let bare = serde_json::to_vec(&doc).unwrap();

        let expected = serde_json::to_vec(&doc).unwrap();
        assert_eq!(extract_genesis_document(&enveloped).unwrap(), expected);
        assert_eq!(extract_genesis_document(&wrapped).unwrap(), expected);
        assert_eq!(extract_genesis_document(&bare).unwrap(), expected);

        let junk = serde_json::to_vec(&json!({ "not": "genesis" })).unwrap();
        assert_matches::assert_matches!(
            extract_genesis_document(&junk),
            Err(ForkError::EmptyGenesis)
        );
    }

    #[test]
    fn chain_id_extraction() {
        let raw = serde_json::to_vec(&json!({ "chain_id": "mainnet-1" })).unwrap();
        assert_eq!(chain_id_of(&raw).unwrap(), "mainnet-1");
        assert_eq!(chain_id_of(b"not json"), None);
    }
}
