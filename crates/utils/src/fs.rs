//! Filesystem helpers shared by the runtime and the log plane.

use std::path::{Path, PathBuf};

/// Candidate log file locations relative to a node home, in discovery order.
/// The first existing match wins.
pub const LOG_FILE_CANDIDATES: &[&str] = &["node.log", "stdout.log", "output.log", "data/node.log"];

/// Resolves the log file for a node home, refusing anything that escapes
/// `root` through symlinks.
pub fn discover_log_file(root: &Path) -> Option<PathBuf> {
    for candidate in LOG_FILE_CANDIDATES {
        let path = root.join(candidate);
        if !path.is_file() {
            continue;
        }
        if path_escapes(root, &path) {
            continue;
        }
        return Some(path);
    }
    None
}

/// True when `path`, after resolving symlinks, no longer lives under `root`.
pub fn path_escapes(root: &Path, path: &Path) -> bool {
    let Ok(canonical_root) = root.canonicalize() else { return true };
    match path.canonicalize() {
        Ok(resolved) => !resolved.starts_with(&canonical_root),
        Err(_) => true,
    }
}
