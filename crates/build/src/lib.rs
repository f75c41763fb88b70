//! Chain binary builder.
//!
//! Builds a network's binary from a `(repo, ref)` pair: resolve the ref to a
//! commit, clone into a scratch directory, compile with the plugin's build
//! command and move the result into the content-addressed [`BinaryCache`].
//! Builds of the same cache key are coalesced; distinct keys build in
//! parallel.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod cache;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub use cache::{cache_key, BinaryCache, CacheEntry, CacheMeta};
use chrono::{DateTime, Utc};
use devnet_log::StepSink;
use devnet_plugin::{CommandSpec, NetworkPlugin};
use devnet_primitives::{ProvisionPhase, StepEvent};
use devnet_utils::{run_command, CommandError};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("failed to resolve ref {git_ref:?} in {repo}: {stderr}")]
    RefResolve { repo: String, git_ref: String, stderr: String },

    #[error("{step} failed: {stderr}")]
    StepFailed { step: &'static str, stderr: String },

    #[error("build produced no binary at {path}")]
    MissingArtifact { path: PathBuf },

    #[error("cache entry {key} is unreadable after insert")]
    CacheCorrupt { key: String },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BuildError {
    /// True when the build stopped because the caller cancelled it.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BuildError::Command(CommandError::Cancelled))
    }
}

/// Inputs of one build request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildSpec {
    pub repo: String,
    pub git_ref: String,
    pub go_version: String,
    pub build_flags: Vec<String>,
    pub no_cache: bool,
}

/// What a successful build hands back.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutput {
    pub binary_path: PathBuf,
    pub commit: String,
    pub git_ref: String,
    pub cache_key: String,
    pub built_at: DateTime<Utc>,
}

impl BuildOutput {
    fn from_entry(entry: CacheEntry) -> Self {
        Self {
            binary_path: entry.binary_path,
            commit: entry.meta.git_commit,
            git_ref: entry.meta.git_ref,
            cache_key: entry.key,
            built_at: entry.meta.built_at,
        }
    }
}

/// Builds and caches chain binaries.
#[derive(Debug)]
pub struct Builder {
    cache: BinaryCache,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Builder {
    pub fn new(cache: BinaryCache) -> Self {
        Self { cache, locks: Mutex::new(HashMap::new()) }
    }

    pub fn cache(&self) -> &BinaryCache {
        &self.cache
    }

    /// Removes cache entries older than `max_age`.
    pub fn clean(&self, max_age: std::time::Duration) -> Result<Vec<String>, BuildError> {
        self.cache.clean(max_age)
    }

    /// The per-key build lock; one lock instance per cache key for the
    /// lifetime of the process.
    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(key.to_string()).or_default().clone()
    }

    /// Builds the binary described by `spec`, or returns the cached result.
    pub async fn build(
        &self,
        plugin: &dyn NetworkPlugin,
        spec: &BuildSpec,
        sink: &dyn StepSink,
        cancel: &CancellationToken,
    ) -> Result<BuildOutput, BuildError> {
        let repo = if spec.repo.is_empty() { plugin.default_repo() } else { spec.repo.as_str() };
        let git_ref =
            if spec.git_ref.is_empty() { plugin.info().default_version } else { spec.git_ref.clone() };

        sink.step(ProvisionPhase::Building, StepEvent::running("fetch").detail(git_ref.clone()));
        let commit = self.resolve_ref(repo, &git_ref, cancel).await?;
        sink.step(ProvisionPhase::Building, StepEvent::completed("fetch").detail(commit.clone()));

        let key = cache_key(plugin.name(), repo, &commit, &spec.go_version, &spec.build_flags);

        if !spec.no_cache {
            if let Some(entry) = self.cache.get(&key) {
                debug!(target: "builder", key = %key, "Binary cache hit.");
                sink.step(
                    ProvisionPhase::Building,
                    StepEvent::completed("build").detail("cached"),
                );
                return Ok(BuildOutput::from_entry(entry));
            }
        }

        // Coalesce concurrent builds of the same key: the first caller does
        // the work, later callers block here and then take the cache hit.
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        if !spec.no_cache {
            if let Some(entry) = self.cache.get(&key) {
                sink.step(
                    ProvisionPhase::Building,
                    StepEvent::completed("build").detail("cached"),
                );
                return Ok(BuildOutput::from_entry(entry));
            }
        }

        let scratch = tempfile::tempdir()?;
        let workdir = scratch.path().join("src");

        sink.step(ProvisionPhase::Building, StepEvent::running("clone").detail(repo.to_string()));
        let clone = CommandSpec::new("git").args([
            "clone",
            &clone_url(repo),
            &workdir.display().to_string(),
        ]);
        let out = run_command(&clone, scratch.path(), cancel, |_| {}).await?;
        if !out.success {
            return Err(BuildError::StepFailed { step: "clone", stderr: out.stderr_tail.join("\n") });
        }

        let checkout = CommandSpec::new("git").args(["checkout", "--detach", &commit]);
        let out = run_command(&checkout, &workdir, cancel, |_| {}).await?;
        if !out.success {
            return Err(BuildError::StepFailed {
                step: "checkout",
                stderr: out.stderr_tail.join("\n"),
            });
        }
        sink.step(ProvisionPhase::Building, StepEvent::completed("clone"));

        info!(target: "builder", %repo, %commit, "Compiling chain binary.");
        sink.step(ProvisionPhase::Building, StepEvent::running("build").detail(commit.clone()));
        let build = plugin.build_args(repo, &git_ref, &spec.go_version, &spec.build_flags);
        let out = run_command(&build, &workdir, cancel, |line| {
            sink.step(
                ProvisionPhase::Building,
                StepEvent::running("build").detail(line.to_string()),
            );
        })
        .await?;
        if !out.success {
            return Err(BuildError::StepFailed { step: "build", stderr: out.stderr_tail.join("\n") });
        }

        let produced = workdir.join("build").join(plugin.binary_name());
        if !produced.is_file() {
            return Err(BuildError::MissingArtifact { path: produced });
        }

        let meta = CacheMeta { git_commit: commit, git_ref, built_at: Utc::now() };
        let entry = self.cache.insert(&key, &produced, meta)?;
        sink.step(ProvisionPhase::Building, StepEvent::completed("build"));

        Ok(BuildOutput::from_entry(entry))
    }

    /// Resolves a symbolic ref to a commit hash via the remote. A full commit
    /// hash is accepted as-is so the cache key is computable offline.
    pub async fn resolve_ref(
        &self,
        repo: &str,
        git_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<String, BuildError> {
        if git_ref.len() == 40 && git_ref.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(git_ref.to_ascii_lowercase());
        }

        let ls = CommandSpec::new("git").args(["ls-remote", &clone_url(repo), git_ref]);
        let cwd = std::env::temp_dir();
        let out = run_command(&ls, &cwd, cancel, |_| {}).await?;
        if !out.success {
            return Err(BuildError::RefResolve {
                repo: repo.to_string(),
                git_ref: git_ref.to_string(),
                stderr: out.stderr_tail.join("\n"),
            });
        }

        parse_ls_remote(&out.stdout, git_ref).ok_or_else(|| BuildError::RefResolve {
            repo: repo.to_string(),
            git_ref: git_ref.to_string(),
            stderr: "no matching ref".to_string(),
        })
    }

    /// Lists the tags of a plugin's source repo, newest-name-last, for
    /// `ListBinaryVersions`.
    pub async fn list_refs(
        &self,
        repo: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, BuildError> {
        let ls = CommandSpec::new("git").args(["ls-remote", "--tags", "--refs", &clone_url(repo)]);
        let cwd = std::env::temp_dir();
        let out = run_command(&ls, &cwd, cancel, |_| {}).await?;
        if !out.success {
            return Err(BuildError::RefResolve {
                repo: repo.to_string(),
                git_ref: "--tags".to_string(),
                stderr: out.stderr_tail.join("\n"),
            });
        }

        let mut tags: Vec<String> = out
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .filter_map(|r| r.strip_prefix("refs/tags/"))
            .map(str::to_string)
            .collect();
        tags.sort();
        Ok(tags)
    }
}

fn clone_url(repo: &str) -> String {
    if repo.starts_with("http://") || repo.starts_with("https://") || repo.starts_with("git@") {
        repo.to_string()
    } else {
        format!("https://{repo}")
    }
}

/// Picks the commit for `git_ref` out of `git ls-remote` output, preferring
/// the peeled tag object over the tag ref itself.
fn parse_ls_remote(stdout: &str, git_ref: &str) -> Option<String> {
    let mut fallback = None;
    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        let (Some(hash), Some(name)) = (parts.next(), parts.next()) else { continue };

        if name == format!("refs/tags/{git_ref}^{{}}") {
            return Some(hash.to_string());
        }
        if fallback.is_none()
            && (name == format!("refs/tags/{git_ref}")
                || name == format!("refs/heads/{git_ref}")
                || name == git_ref)
        {
            fallback = Some(hash.to_string());
        }
    }
    fallback.or_else(|| {
        stdout.lines().next().and_then(|l| l.split_whitespace().next()).map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn full_hash_refs_resolve_offline() {
        let hash = "a".repeat(40);
        let builder = Builder::new(BinaryCache::new(std::env::temp_dir()));
        let resolved = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(builder.resolve_ref("repo", &hash, &CancellationToken::new()))
            .unwrap();
        assert_eq!(resolved, hash);
    }

    #[test]
    fn ls_remote_parsing_prefers_peeled_tags() {
        let stdout = "\
1111111111111111111111111111111111111111\trefs/tags/v1.0.0\n\
2222222222222222222222222222222222222222\trefs/tags/v1.0.0^{}\n";
        assert_eq!(
            parse_ls_remote(stdout, "v1.0.0").unwrap(),
            "2222222222222222222222222222222222222222"
        );
    }

    #[test]
    fn ls_remote_parsing_falls_back_to_branch() {
        let stdout = "3333333333333333333333333333333333333333\trefs/heads/main\n";
        assert_eq!(
            parse_ls_remote(stdout, "main").unwrap(),
            "3333333333333333333333333333333333333333"
        );
    }

    #[test]
    fn same_key_shares_one_build_lock() {
        let builder = Builder::new(BinaryCache::new(std::env::temp_dir()));
        let a = builder.key_lock("k");
        let b = builder.key_lock("k");
        assert!(Arc::ptr_eq(&a, &b));

        let c = builder.key_lock("other");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn clone_urls_are_normalized() {
        assert_eq!(clone_url("github.com/foo/bar"), "https://github.com/foo/bar");
        assert_eq!(clone_url("https://github.com/foo/bar"), "https://github.com/foo/bar");
        assert_eq!(clone_url("git@github.com:foo/bar.git"), "git@github.com:foo/bar.git");
    }
}
