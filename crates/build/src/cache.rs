//! Content-addressed binary cache.
//!
//! Each entry lives under `<root>/<key>/` as the binary (`bin`) plus a
//! `meta.json` sidecar. Entries are immutable once written: insertion goes
//! through a temp directory and an atomic rename, readers never observe a
//! partially written entry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::BuildError;

const BINARY_FILE: &str = "bin";
const META_FILE: &str = "meta.json";

/// Computes the cache key for a build input set.
///
/// The key covers everything that can change the produced binary; build flags
/// are sorted so flag order does not defeat the cache.
pub fn cache_key(
    plugin: &str,
    repo: &str,
    commit: &str,
    go_version: &str,
    build_flags: &[String],
) -> String {
    let mut flags: Vec<&str> = build_flags.iter().map(String::as_str).collect();
    flags.sort_unstable();

    let mut hasher = Sha256::new();
    for part in [plugin, repo, commit, go_version] {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    for flag in flags {
        hasher.update(flag.as_bytes());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}

/// Sidecar metadata stored next to each cached binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMeta {
    pub git_commit: String,
    pub git_ref: String,
    pub built_at: DateTime<Utc>,
}

/// A resolved cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub binary_path: PathBuf,
    pub meta: CacheMeta,
}

#[derive(Debug, Clone)]
pub struct BinaryCache {
    root: PathBuf,
}

impl BinaryCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Looks up an entry. A directory without readable metadata is treated as
    /// absent rather than an error so that a torn write never wedges a build.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let dir = self.entry_dir(key);
        let binary_path = dir.join(BINARY_FILE);
        if !binary_path.is_file() {
            return None;
        }
        let meta = std::fs::read(dir.join(META_FILE)).ok()?;
        let meta: CacheMeta = serde_json::from_slice(&meta).ok()?;
        Some(CacheEntry { key: key.to_string(), binary_path, meta })
    }

    /// Moves `binary` into the cache under `key`.
    ///
    /// The entry is assembled in a scratch sibling and renamed into place, so
    /// concurrent readers see either nothing or the complete entry. An entry
    /// that already exists wins; the new candidate is discarded.
    pub fn insert(&self, key: &str, binary: &Path, meta: CacheMeta) -> Result<CacheEntry, BuildError> {
        std::fs::create_dir_all(&self.root)?;

        let staging = tempfile::tempdir_in(&self.root)?;
        std::fs::copy(binary, staging.path().join(BINARY_FILE))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                staging.path().join(BINARY_FILE),
                std::fs::Permissions::from_mode(0o755),
            )?;
        }
        std::fs::write(staging.path().join(META_FILE), serde_json::to_vec_pretty(&meta)?)?;

        let dir = self.entry_dir(key);
        match std::fs::rename(staging.into_path(), &dir) {
            Ok(()) => {}
            // Lost the race; the existing entry is authoritative.
            Err(err) if dir.join(BINARY_FILE).is_file() => {
                debug!(target: "builder", %key, %err, "Cache entry already present.");
            }
            Err(err) => return Err(err.into()),
        }

        self.get(key).ok_or(BuildError::CacheCorrupt { key: key.to_string() })
    }

    /// Removes entries built longer than `max_age` ago. Returns the removed keys.
    pub fn clean(&self, max_age: Duration) -> Result<Vec<String>, BuildError> {
        let mut removed = Vec::new();
        let cutoff =
            Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::max_value());

        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let entry = entry?;
            let key = entry.file_name().to_string_lossy().to_string();
            match self.get(&key) {
                Some(cached) if cached.meta.built_at < cutoff => {
                    std::fs::remove_dir_all(entry.path())?;
                    removed.push(key);
                }
                Some(_) => {}
                // Not a valid entry (eg. leftover staging dir); sweep it.
                None => {
                    let _ = std::fs::remove_dir_all(entry.path());
                }
            }
        }
        Ok(removed)
    }
}
