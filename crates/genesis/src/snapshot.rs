//! Snapshot-based forking: download, verify, extract, export.

use std::io::Write;
use std::path::{Path, PathBuf};

use devnet_log::StepSink;
use devnet_plugin::NetworkPlugin;
use devnet_primitives::{ProvisionPhase, StepEvent};
use devnet_utils::run_command;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ForkError;

/// Emit a progress event at most every this many bytes.
const PROGRESS_GRANULARITY: u64 = 4 << 20;

/// Cache key for an exported snapshot genesis. Entries are immutable; the
/// pair fully determines the export output, so the key never needs to change
/// for an existing entry.
pub fn snapshot_cache_key(url: &str, binary_path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update([0]);
    hasher.update(binary_path.display().to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn fork_from_snapshot(
    client: &reqwest::Client,
    cache_dir: &Path,
    plugin: &dyn NetworkPlugin,
    url: &str,
    binary_path: &Path,
    checksum: Option<&str>,
    no_cache: bool,
    sink: &dyn StepSink,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, ForkError> {
    let key = snapshot_cache_key(url, binary_path);
    let cached = cache_dir.join("snapshots").join(format!("{key}.genesis.json"));

    if !no_cache {
        if let Ok(raw) = std::fs::read(&cached) {
            debug!(target: "provisioner", %key, "Snapshot genesis cache hit.");
            sink.step(
                ProvisionPhase::Forking,
                StepEvent::completed("download").detail("cached"),
            );
            return Ok(raw);
        }
    }

    let scratch = tempfile::tempdir()?;
    let archive_path = scratch.path().join("snapshot.tar.gz");

    download(client, url, &archive_path, checksum, sink, cancel).await?;

    sink.step(ProvisionPhase::Forking, StepEvent::running("extract"));
    let data_dir = scratch.path().join("data");
    extract_archive(&archive_path, &data_dir).map_err(ForkError::Extract)?;
    sink.step(ProvisionPhase::Forking, StepEvent::completed("extract"));

    if cancel.is_cancelled() {
        return Err(ForkError::Cancelled);
    }

    sink.step(ProvisionPhase::Forking, StepEvent::running("export"));
    let export = plugin.genesis_export(binary_path, &data_dir);
    let out = run_command(&export, scratch.path(), cancel, |_| {}).await?;
    if !out.success {
        return Err(ForkError::Export { stderr: out.stderr() });
    }
    sink.step(ProvisionPhase::Forking, StepEvent::completed("export"));

    let raw = out.stdout.into_bytes();

    // Populate the cache; failure to cache is not a fork failure.
    if let Some(parent) = cached.parent() {
        if std::fs::create_dir_all(parent).is_ok() {
            let _ = std::fs::write(&cached, &raw);
        }
    }

    Ok(raw)
}

/// Streams `url` into `dest`, emitting monotonic byte-progress events and
/// verifying the optional sha256 checksum.
async fn download(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    checksum: Option<&str>,
    sink: &dyn StepSink,
    cancel: &CancellationToken,
) -> Result<(), ForkError> {
    let response = client.get(url).send().await?.error_for_status()?;
    let total = response.content_length();

    sink.step(
        ProvisionPhase::Forking,
        StepEvent::running("download").progress(0, total, "bytes").detail(url.to_string()),
    );

    let mut file = std::fs::File::create(dest)?;
    let mut hasher = Sha256::new();
    let mut current: u64 = 0;
    let mut last_emitted: u64 = 0;
    let started = std::time::Instant::now();

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(ForkError::Cancelled);
        }
        let chunk = chunk?;
        file.write_all(&chunk)?;
        hasher.update(&chunk);
        current += chunk.len() as u64;

        if current - last_emitted >= PROGRESS_GRANULARITY {
            last_emitted = current;
            let speed = render_speed(current, started.elapsed());
            let mut step = StepEvent::running("download").progress(current, total, "bytes");
            step.speed = speed;
            sink.step(ProvisionPhase::Forking, step);
        }
    }
    file.flush()?;

    if let Some(expected) = checksum {
        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(ForkError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
    }

    // The terminal event reports the full size even when the server did not
    // announce a content length.
    sink.step(
        ProvisionPhase::Forking,
        StepEvent::completed("download").progress(current, Some(total.unwrap_or(current)), "bytes"),
    );
    Ok(())
}

/// Unpacks a `.tar.gz` archive under `dest`, refusing entries that would
/// escape it.
fn extract_archive(archive: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    let file = std::fs::File::open(archive)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);
    // `unpack` already rejects paths that traverse outside of `dest`.
    tar.unpack(dest)
}

fn render_speed(bytes: u64, elapsed: std::time::Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return String::new();
    }
    let rate = bytes as f64 / secs;
    if rate >= 1e6 {
        format!("{:.1} MB/s", rate / 1e6)
    } else {
        format!("{:.0} KB/s", rate / 1e3)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn cache_key_depends_on_url_and_binary() {
        let a = snapshot_cache_key("https://snaps/x.tar.gz", Path::new("/cache/k1/bin"));
        let b = snapshot_cache_key("https://snaps/x.tar.gz", Path::new("/cache/k1/bin"));
        let c = snapshot_cache_key("https://snaps/y.tar.gz", Path::new("/cache/k1/bin"));
        let d = snapshot_cache_key("https://snaps/x.tar.gz", Path::new("/cache/k2/bin"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn tar_gz_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        // Build a small archive: data/app.db with known content.
        let archive_path = dir.path().join("snap.tar.gz");
        {
            let file = std::fs::File::create(&archive_path).unwrap();
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);

            let content = b"snapshot-bytes";
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "data/app.db", content.as_slice()).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dest = dir.path().join("out");
        extract_archive(&archive_path, &dest).unwrap();
        assert_eq!(std::fs::read(dest.join("data/app.db")).unwrap(), b"snapshot-bytes");
    }

    #[test]
    fn speed_rendering() {
        assert_eq!(render_speed(2_000_000, std::time::Duration::from_secs(1)), "2.0 MB/s");
        assert_eq!(render_speed(500_000, std::time::Duration::from_secs(1)), "500 KB/s");
    }
}
