//! Persistent tier (L3): disk-backed store with an embedded index.
//!
//! Payloads live in blob files named by the SHA-256 of the logical key;
//! metadata (size, timestamps, TTL, tags, compression flag) lives in an
//! in-memory index checkpointed to `index.json` in the same directory.
//! Index mutations are serialized behind a single async mutex, so a key
//! never gets duplicate or orphaned blob files. Blob files are written
//! once per key-version and never mutated in place.
//!
//! A stale index row (blob file missing) is self-healed: the row is dropped
//! and the read reported as a miss.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::codec::{decompress, maybe_compress};
use crate::config::{CompressionConfig, PersistentConfig};
use crate::tier::EntryInfo;

#[derive(Error, Debug)]
pub enum PersistentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O timed out after {0:?}")]
    Timeout(Duration),

    #[error("index checkpoint failed: {0}")]
    Checkpoint(#[source] serde_json::Error),
}

/// Durable metadata for one cached entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRecord {
    /// Blob file name within the storage directory.
    pub file: String,

    /// Stored payload size in bytes (after compression).
    pub size: u64,

    /// Creation time, epoch milliseconds.
    pub created_at_ms: u64,

    /// Last access time, epoch milliseconds.
    pub last_accessed_ms: u64,

    /// Number of reads served.
    pub access_count: u64,

    /// TTL in seconds, if any.
    pub ttl_secs: Option<u64>,

    /// Tags attached at set time.
    pub tags: Vec<String>,

    /// Whether the blob holds zstd-compressed bytes.
    pub compressed: bool,
}

impl IndexRecord {
    fn expired(&self, now_ms: u64) -> bool {
        match self.ttl_secs {
            Some(ttl) => now_ms.saturating_sub(self.created_at_ms) >= ttl * 1_000,
            None => false,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    entries: HashMap<String, IndexRecord>,
}

#[derive(Debug, Default)]
struct IndexState {
    index: Index,
    /// Mutations since the last checkpoint.
    dirty: u64,
    /// Last key examined by the expiry sweep; the next run resumes after
    /// it, so successive runs rotate through the whole index.
    sweep_cursor: Option<String>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Disk-backed store: hash-named blobs plus a checkpointed index.
pub struct PersistentTier {
    dir: PathBuf,
    state: tokio::sync::Mutex<IndexState>,
    config: PersistentConfig,
    compression: CompressionConfig,
}

impl PersistentTier {
    /// Open (or create) the storage directory and load the index checkpoint.
    /// A corrupt checkpoint is discarded; blobs without a row are garbage
    /// collected lazily by the next sweep.
    pub async fn open(
        config: PersistentConfig,
        compression: CompressionConfig,
    ) -> Result<Self, PersistentError> {
        fs::create_dir_all(&config.path).await?;

        let index_path = config.path.join("index.json");
        let index = if index_path.exists() {
            match fs::read(&index_path).await {
                Ok(data) => match serde_json::from_slice::<Index>(&data) {
                    Ok(index) => index,
                    Err(e) => {
                        warn!(error = %e, "Corrupt index checkpoint, starting empty");
                        Index::default()
                    }
                },
                Err(e) => {
                    warn!(error = %e, "Failed to read index checkpoint, starting empty");
                    Index::default()
                }
            }
        } else {
            Index::default()
        };

        debug!(path = %config.path.display(), entries = index.entries.len(), "Persistent tier opened");

        Ok(Self {
            dir: config.path.clone(),
            state: tokio::sync::Mutex::new(IndexState {
                index,
                dirty: 0,
                sweep_cursor: None,
            }),
            config,
            compression,
        })
    }

    fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.config.io_timeout_ms)
    }

    /// Deterministic blob file name for a logical key.
    fn blob_name(key: &str) -> String {
        let digest = Sha256::digest(key.as_bytes());
        format!("{:x}.blob", digest)
    }

    fn blob_path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Store a serialized value: write the blob, then upsert the index row.
    pub async fn set(
        &self,
        key: &str,
        raw: &[u8],
        ttl: Option<Duration>,
        tags: Vec<String>,
    ) -> bool {
        let (payload, compressed) = maybe_compress(raw, &self.compression);
        let file = Self::blob_name(key);
        let path = self.blob_path(&file);

        let mut state = self.state.lock().await;

        let write = tokio::time::timeout(self.io_timeout(), fs::write(&path, &payload)).await;
        match write {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(key, error = %e, "L3 blob write failed");
                return false;
            }
            Err(_) => {
                warn!(key, timeout_ms = self.config.io_timeout_ms, "L3 blob write timed out");
                return false;
            }
        }

        let now = now_ms();
        state.index.entries.insert(
            key.to_string(),
            IndexRecord {
                file,
                size: payload.len() as u64,
                created_at_ms: now,
                last_accessed_ms: now,
                access_count: 0,
                ttl_secs: ttl.map(|t| t.as_secs().max(1)),
                tags,
                compressed,
            },
        );
        state.dirty += 1;
        self.maybe_checkpoint(&mut state).await;

        debug!(key, size = payload.len(), compressed, "L3 set");
        true
    }

    /// Read a value and its stored metadata. Expired or stale rows are
    /// removed on the way (lazy expiry, index self-heal).
    pub async fn get(&self, key: &str) -> Option<(Bytes, EntryInfo)> {
        let mut state = self.state.lock().await;

        let record = state.index.entries.get(key)?.clone();
        let now = now_ms();

        if record.expired(now) {
            self.drop_entry(&mut state, key, &record).await;
            return None;
        }

        let path = self.blob_path(&record.file);
        let data = match tokio::time::timeout(self.io_timeout(), fs::read(&path)).await {
            Ok(Ok(data)) => data,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(key, "L3 index row points at a missing blob, self-healing");
                state.index.entries.remove(key);
                state.dirty += 1;
                return None;
            }
            Ok(Err(e)) => {
                warn!(key, error = %e, "L3 blob read failed");
                return None;
            }
            Err(_) => {
                warn!(key, timeout_ms = self.config.io_timeout_ms, "L3 blob read timed out");
                return None;
            }
        };

        let payload = if record.compressed {
            match decompress(&data) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(key, error = %e, "L3 blob is corrupt, dropping entry");
                    self.drop_entry(&mut state, key, &record).await;
                    return None;
                }
            }
        } else {
            Bytes::from(data)
        };

        if let Some(row) = state.index.entries.get_mut(key) {
            row.last_accessed_ms = now;
            row.access_count += 1;
        }
        state.dirty += 1;
        self.maybe_checkpoint(&mut state).await;

        let info = EntryInfo {
            ttl_secs: record.ttl_secs,
            tags: record.tags,
        };
        Some((payload, info))
    }

    /// Remove a key's row and blob. Returns true when the row existed.
    pub async fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock().await;
        let record = match state.index.entries.get(key) {
            Some(record) => record.clone(),
            None => return false,
        };
        self.drop_entry(&mut state, key, &record).await;
        self.maybe_checkpoint(&mut state).await;
        true
    }

    /// Whether a live (non-expired) row exists for a key.
    pub async fn contains(&self, key: &str) -> bool {
        let state = self.state.lock().await;
        state
            .index
            .entries
            .get(key)
            .map(|r| !r.expired(now_ms()))
            .unwrap_or(false)
    }

    /// Keys whose tag set intersects `tags`.
    pub async fn keys_with_any_tag(&self, tags: &[String]) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .index
            .entries
            .iter()
            .filter(|(_, record)| record.tags.iter().any(|t| tags.contains(t)))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Delete expired rows and their blobs, examining at most `budget`
    /// rows per run. A cursor rotates through the key space across runs,
    /// so every row is eventually examined even on a quiet store. Returns
    /// the number of entries removed.
    pub async fn sweep_expired(&self, budget: usize) -> usize {
        let mut state = self.state.lock().await;
        let now = now_ms();

        let mut keys: Vec<String> = state.index.entries.keys().cloned().collect();
        if keys.is_empty() {
            return 0;
        }
        keys.sort();

        let start = match &state.sweep_cursor {
            Some(cursor) => keys.partition_point(|k| k <= cursor),
            None => 0,
        };
        let examined: Vec<String> = keys
            .iter()
            .cycle()
            .skip(start)
            .take(budget.min(keys.len()))
            .cloned()
            .collect();
        state.sweep_cursor = examined.last().cloned();

        let mut removed = 0usize;
        for key in &examined {
            let record = match state.index.entries.get(key) {
                Some(record) if record.expired(now) => record.clone(),
                _ => continue,
            };
            self.drop_entry(&mut state, key, &record).await;
            removed += 1;
        }

        if removed > 0 {
            debug!(removed, "L3 expiry sweep removed entries");
            if let Err(e) = self.checkpoint_locked(&mut state).await {
                warn!(error = %e, "L3 index checkpoint failed after sweep");
            }
        }
        removed
    }

    /// Total stored blob bytes according to the index.
    pub async fn usage_bytes(&self) -> u64 {
        let state = self.state.lock().await;
        state.index.entries.values().map(|r| r.size).sum()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.index.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove every row and blob.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        let all: Vec<(String, IndexRecord)> = state
            .index
            .entries
            .iter()
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect();
        for (key, record) in all {
            self.drop_entry(&mut state, &key, &record).await;
        }
        if let Err(e) = self.checkpoint_locked(&mut state).await {
            warn!(error = %e, "L3 index checkpoint failed after clear");
        }
    }

    /// Force an index checkpoint. Called at shutdown.
    pub async fn checkpoint(&self) -> Result<(), PersistentError> {
        let mut state = self.state.lock().await;
        self.checkpoint_locked(&mut state).await
    }

    async fn drop_entry(&self, state: &mut IndexState, key: &str, record: &IndexRecord) {
        state.index.entries.remove(key);
        state.dirty += 1;
        let path = self.blob_path(&record.file);
        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(key, error = %e, "L3 blob removal failed");
            }
        }
    }

    async fn maybe_checkpoint(&self, state: &mut IndexState) {
        if state.dirty >= self.config.checkpoint_every {
            if let Err(e) = self.checkpoint_locked(state).await {
                warn!(error = %e, "L3 index checkpoint failed");
            }
        }
    }

    async fn checkpoint_locked(&self, state: &mut IndexState) -> Result<(), PersistentError> {
        let data = serde_json::to_vec(&state.index).map_err(PersistentError::Checkpoint)?;
        let final_path = self.dir.join("index.json");
        let tmp_path = self.dir.join("index.json.tmp");

        // Write-then-rename keeps the checkpoint atomic on crash.
        fs::write(&tmp_path, &data).await?;
        fs::rename(&tmp_path, &final_path).await?;

        state.dirty = 0;
        debug!(entries = state.index.entries.len(), "L3 index checkpointed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_tier(tmp: &TempDir) -> PersistentTier {
        let config = PersistentConfig {
            path: tmp.path().join("store"),
            checkpoint_every: 2,
            io_timeout_ms: 2_000,
        };
        PersistentTier::open(config, CompressionConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let tier = open_tier(&tmp).await;

        assert!(tier.set("k", b"hello", None, vec!["t".into()]).await);
        let (data, info) = tier.get("k").await.unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(info.tags, vec!["t".to_string()]);
    }

    #[tokio::test]
    async fn test_expired_entry_removed_on_read() {
        let tmp = TempDir::new().unwrap();
        let tier = open_tier(&tmp).await;

        assert!(tier.set("k", b"v", Some(Duration::from_millis(1)), vec![]).await);
        // TTL rounds up to 1s; fake expiry by backdating the row.
        {
            let mut state = tier.state.lock().await;
            let row = state.index.entries.get_mut("k").unwrap();
            row.created_at_ms -= 10_000;
        }
        assert!(tier.get("k").await.is_none());
        assert_eq!(tier.len().await, 0);
    }

    #[tokio::test]
    async fn test_missing_blob_self_heals() {
        let tmp = TempDir::new().unwrap();
        let tier = open_tier(&tmp).await;

        assert!(tier.set("k", b"v", None, vec![]).await);
        let path = tier.blob_path(&PersistentTier::blob_name("k"));
        std::fs::remove_file(&path).unwrap();

        assert!(tier.get("k").await.is_none());
        assert_eq!(tier.len().await, 0, "stale row was dropped");
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let config = PersistentConfig {
            path: tmp.path().join("store"),
            checkpoint_every: 1, // checkpoint on every mutation
            io_timeout_ms: 2_000,
        };

        {
            let tier = PersistentTier::open(config.clone(), CompressionConfig::default())
                .await
                .unwrap();
            assert!(tier.set("k", b"persisted", None, vec![]).await);
        }

        let tier = PersistentTier::open(config, CompressionConfig::default())
            .await
            .unwrap();
        let (data, _) = tier.get("k").await.unwrap();
        assert_eq!(&data[..], b"persisted");
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_only() {
        let tmp = TempDir::new().unwrap();
        let tier = open_tier(&tmp).await;

        assert!(tier.set("dead", b"1", Some(Duration::from_secs(1)), vec![]).await);
        assert!(tier.set("live", b"2", None, vec![]).await);
        {
            let mut state = tier.state.lock().await;
            let row = state.index.entries.get_mut("dead").unwrap();
            row.created_at_ms -= 10_000;
        }

        let removed = tier.sweep_expired(100).await;
        assert_eq!(removed, 1);
        assert!(tier.get("dead").await.is_none());
        assert!(tier.get("live").await.is_some());
    }

    #[tokio::test]
    async fn test_sweep_cursor_covers_whole_index() {
        let tmp = TempDir::new().unwrap();
        let tier = open_tier(&tmp).await;

        for key in ["a", "b", "c", "d", "e"] {
            assert!(tier.set(key, b"v", Some(Duration::from_secs(1)), vec![]).await);
        }
        {
            let mut state = tier.state.lock().await;
            for row in state.index.entries.values_mut() {
                row.created_at_ms -= 10_000;
            }
        }

        // Budget below the row count: successive runs resume where the
        // previous one stopped instead of re-examining the same window.
        let mut removed = 0;
        for _ in 0..3 {
            removed += tier.sweep_expired(2).await;
        }
        assert_eq!(removed, 5);
        assert_eq!(tier.len().await, 0);
    }

    #[tokio::test]
    async fn test_compression_flag_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let tier = open_tier(&tmp).await;

        let big = vec![3u8; 64 * 1024];
        assert!(tier.set("big", &big, None, vec![]).await);
        assert!(tier.usage_bytes().await < big.len() as u64);

        let (data, _) = tier.get("big").await.unwrap();
        assert_eq!(&data[..], &big[..]);
    }
}
