//! In-memory devnet registry and on-disk layout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use devnet_primitives::{Devnet, DevnetName, DevnetSpec, Namespace};
use parking_lot::RwLock;

/// How `ApplyDevnet` resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ApplyAction {
    Created,
    Configured,
    Unchanged,
}

/// Layout of the daemon's data root (default `~/.devnet-builder`).
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn devnet_dir(&self, name: &str) -> PathBuf {
        self.root.join("devnets").join(name)
    }

    pub fn node_home(&self, devnet: &str, node: &str) -> PathBuf {
        self.devnet_dir(devnet).join("nodes").join(node)
    }

    pub fn bin_cache(&self) -> PathBuf {
        self.root.join("bin-cache")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.root.join("daemon.log")
    }
}

/// Provisioning bookkeeping for one devnet, outside the resource itself.
#[derive(Debug, Default, Clone)]
pub struct ProvisionState {
    pub provisioning: bool,
    pub provisioned: bool,
    /// Set when the last provisioning run failed; cleared by the next run.
    pub failed: bool,
    /// Set by an explicit stop; keeps the reconcile loop from launching a
    /// fresh provisioning run until a start or re-apply lifts it.
    pub halted: bool,
    /// Cancels the in-flight provisioning run, when there is one.
    pub cancel: Option<tokio_util::sync::CancellationToken>,
    pub binary_path: Option<PathBuf>,
    pub chain_id: String,
}

/// One registered devnet. The lock covers spec and status together; the
/// reconcile task is the only status writer, RPC handlers snapshot.
#[derive(Debug)]
pub struct DevnetRecord {
    pub devnet: RwLock<Devnet>,
    pub provision: RwLock<ProvisionState>,
}

pub type DevnetKey = (Namespace, DevnetName);

/// The daemon's authoritative set of devnets.
#[derive(Debug, Default)]
pub struct Store {
    devnets: RwLock<HashMap<DevnetKey, Arc<DevnetRecord>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &Namespace, name: &DevnetName) -> Option<Arc<DevnetRecord>> {
        self.devnets.read().get(&(namespace.clone(), name.clone())).cloned()
    }

    /// Lists devnets, optionally restricted to one namespace. Results are
    /// ordered by `(namespace, name)` for stable output.
    pub fn list(&self, namespace: Option<&Namespace>) -> Vec<Arc<DevnetRecord>> {
        let devnets = self.devnets.read();
        let mut entries: Vec<_> = devnets
            .iter()
            .filter(|((ns, _), _)| namespace.map_or(true, |want| ns == want))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, record)| record.clone()).collect()
    }

    /// Idempotent upsert. A spec byte-equal (after normalization) to the
    /// stored one is `Unchanged` and mutates nothing; otherwise the last
    /// writer wins and the overwrite is visible to the reconcile loop.
    pub fn apply(
        &self,
        namespace: Namespace,
        name: DevnetName,
        spec: DevnetSpec,
    ) -> (Arc<DevnetRecord>, ApplyAction) {
        let spec = spec.normalized();
        let key = (namespace.clone(), name.clone());

        let mut devnets = self.devnets.write();
        match devnets.get(&key) {
            Some(record) => {
                let mut devnet = record.devnet.write();
                if devnet.spec == spec {
                    drop(devnet);
                    (record.clone(), ApplyAction::Unchanged)
                } else {
                    devnet.spec = spec;
                    drop(devnet);
                    (record.clone(), ApplyAction::Configured)
                }
            }
            None => {
                let record = Arc::new(DevnetRecord {
                    devnet: RwLock::new(Devnet::new(namespace, name, spec)),
                    provision: RwLock::new(ProvisionState::default()),
                });
                devnets.insert(key, record.clone());
                (record, ApplyAction::Created)
            }
        }
    }

    pub fn remove(&self, namespace: &Namespace, name: &DevnetName) -> Option<Arc<DevnetRecord>> {
        self.devnets.write().remove(&(namespace.clone(), name.clone()))
    }

    pub fn contains(&self, namespace: &Namespace, name: &DevnetName) -> bool {
        self.devnets.read().contains_key(&(namespace.clone(), name.clone()))
    }
}
