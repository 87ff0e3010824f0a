//! # Snapshot Persistence
//!
//! Each store persists a **versioned whole-map snapshot**: a magic number,
//! a format version, and the bincode-encoded body. Snapshots are loaded once
//! at startup and replaced wholesale on each flush; there is no incremental
//! log.
//!
//! Writes go to a temp file in the same directory and are renamed into
//! place, so a crash mid-write leaves the previous snapshot intact.
//!
//! ## Flush batching
//!
//! Mutation throughput is decoupled from disk throughput: actors mark their
//! state dirty on every mutation and a [`FlushGate`] decides, on each
//! maintenance tick, whether enough time has passed since the last write
//! (≥ 1 s). Bursts of mutations collapse into a single snapshot write.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Identifies veilnet snapshot files.
const SNAPSHOT_MAGIC: u32 = 0x564C_4E53;

/// Snapshot format version; bumped on incompatible layout changes.
const SNAPSHOT_VERSION: u32 = 1;

/// Maximum snapshot size accepted at load time.
/// SECURITY: Bounds deserialization of a corrupted or hostile state file.
const MAX_SNAPSHOT_SIZE: u64 = 64 * 1024 * 1024;

/// Minimum spacing between snapshot writes of one store.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Serialize, Deserialize)]
struct SnapshotEnvelope<T> {
    magic: u32,
    version: u32,
    body: T,
}

fn snapshot_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_SNAPSHOT_SIZE)
        .with_fixint_encoding()
}

/// One snapshot file on disk.
#[derive(Clone, Debug)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot body, or `None` if no snapshot exists yet.
    ///
    /// # Errors
    /// Fails on unreadable files, magic/version mismatch, or a body that
    /// does not decode. Callers treat this as a fresh start after logging.
    pub async fn load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading snapshot {}", self.path.display()))
            }
        };

        let envelope: SnapshotEnvelope<T> = snapshot_options()
            .deserialize(&bytes)
            .with_context(|| format!("decoding snapshot {}", self.path.display()))?;

        if envelope.magic != SNAPSHOT_MAGIC {
            bail!("snapshot {} has wrong magic", self.path.display());
        }
        if envelope.version != SNAPSHOT_VERSION {
            bail!(
                "snapshot {} has unsupported version {}",
                self.path.display(),
                envelope.version
            );
        }

        debug!(path = %self.path.display(), bytes = bytes.len(), "snapshot loaded");
        Ok(Some(envelope.body))
    }

    /// Write a snapshot atomically: serialize, write to a temp file next to
    /// the target, rename into place.
    pub async fn write<T: Serialize>(&self, body: &T) -> Result<()> {
        let envelope = SnapshotEnvelope {
            magic: SNAPSHOT_MAGIC,
            version: SNAPSHOT_VERSION,
            body,
        };
        let bytes = bincode::serialize(&envelope).context("encoding snapshot")?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating snapshot dir {}", parent.display()))?;
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing snapshot temp {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("renaming snapshot into {}", self.path.display()))?;

        debug!(path = %self.path.display(), bytes = bytes.len(), "snapshot written");
        Ok(())
    }

    /// Load, logging and discarding a corrupt snapshot instead of failing.
    pub async fn load_or_default<T: DeserializeOwned + Default>(&self) -> T {
        match self.load().await {
            Ok(Some(body)) => body,
            Ok(None) => T::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "discarding unreadable snapshot");
                T::default()
            }
        }
    }
}

/// Tracks whether a store's in-memory state is ahead of its snapshot and
/// rate-limits how often it may be flushed.
#[derive(Debug)]
pub struct FlushGate {
    dirty: bool,
    last_flush: Instant,
    min_interval: Duration,
}

impl FlushGate {
    pub fn new() -> Self {
        Self::with_interval(MIN_FLUSH_INTERVAL)
    }

    pub fn with_interval(min_interval: Duration) -> Self {
        Self {
            dirty: false,
            // Start in the past so the first mutation can flush promptly.
            last_flush: Instant::now()
                .checked_sub(min_interval)
                .unwrap_or_else(Instant::now),
            min_interval,
        }
    }

    /// Record that the in-memory state changed.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether a flush is due now. Claims the flush slot when it returns
    /// true: the gate becomes clean and the interval restarts, so the caller
    /// must actually write.
    pub fn take_due(&mut self) -> bool {
        if self.dirty && self.last_flush.elapsed() >= self.min_interval {
            self.dirty = false;
            self.last_flush = Instant::now();
            true
        } else {
            false
        }
    }
}

impl Default for FlushGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn missing_snapshot_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("absent.bin"));
        let loaded: Option<HashMap<String, u64>> = file.load().await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("state.bin"));

        let mut body = HashMap::new();
        body.insert("k".to_string(), 42u64);
        file.write(&body).await.unwrap();

        let loaded: HashMap<String, u64> = file.load().await.unwrap().expect("snapshot exists");
        assert_eq!(loaded, body);
    }

    #[tokio::test]
    async fn replaced_snapshot_reflects_latest_write() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("state.bin"));

        file.write(&vec![1u32, 2, 3]).await.unwrap();
        file.write(&vec![9u32]).await.unwrap();

        let loaded: Vec<u32> = file.load().await.unwrap().unwrap();
        assert_eq!(loaded, vec![9]);
    }

    #[tokio::test]
    async fn garbage_snapshot_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        tokio::fs::write(&path, b"not a snapshot").await.unwrap();

        let file = SnapshotFile::new(&path);
        let result: Result<Option<Vec<u32>>> = file.load().await;
        assert!(result.is_err());

        // load_or_default shrugs it off.
        let fallback: Vec<u32> = file.load_or_default().await;
        assert!(fallback.is_empty());
    }

    #[test]
    fn flush_gate_batches_writes() {
        let mut gate = FlushGate::with_interval(Duration::from_millis(50));
        assert!(!gate.take_due(), "clean gate never flushes");

        gate.mark_dirty();
        assert!(gate.take_due(), "first flush is prompt");
        assert!(!gate.take_due(), "flush slot was claimed");

        gate.mark_dirty();
        assert!(
            !gate.take_due(),
            "second flush must wait out the interval"
        );
        std::thread::sleep(Duration::from_millis(60));
        assert!(gate.take_due());
    }
}
