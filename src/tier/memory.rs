//! Memory tier (L1): bounded in-process store with LRU eviction.
//!
//! Entries and total stored bytes are both capped; inserting past either
//! bound evicts from the least-recently-used end until both bounds hold.
//! All mutation happens inside one short mutex-guarded critical section,
//! never across an await point.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::codec::{decompress, maybe_compress};
use crate::config::{CompressionConfig, MemoryConfig};

#[derive(Debug)]
struct MemoryEntry {
    /// Stored payload, possibly compressed.
    data: Bytes,
    compressed: bool,
    created: Instant,
    last_access: Instant,
    access_count: u64,
    ttl: Option<Duration>,
    tags: Vec<String>,
    /// Position in the access-order map.
    seq: u64,
}

impl MemoryEntry {
    fn expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(self.created) >= ttl,
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, MemoryEntry>,
    /// seq → key, least-recently-used first. Touching an entry moves it to
    /// a fresh (highest) seq.
    access_order: BTreeMap<u64, String>,
    next_seq: u64,
    bytes_used: usize,
}

impl MemoryState {
    fn bump(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            self.access_order.remove(&entry.seq);
            entry.seq = self.next_seq;
            self.next_seq += 1;
            self.access_order.insert(entry.seq, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<MemoryEntry> {
        let entry = self.entries.remove(key)?;
        self.access_order.remove(&entry.seq);
        self.bytes_used -= entry.data.len();
        Some(entry)
    }
}

/// Bounded in-process LRU store.
pub struct MemoryTier {
    state: Mutex<MemoryState>,
    config: MemoryConfig,
    compression: CompressionConfig,
}

impl MemoryTier {
    pub fn new(config: MemoryConfig, compression: CompressionConfig) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            config,
            compression,
        }
    }

    /// Store a serialized value. Returns the number of entries evicted to
    /// make room, or `None` when the value cannot fit at all.
    pub fn set(
        &self,
        key: &str,
        raw: &[u8],
        ttl: Option<Duration>,
        tags: Vec<String>,
    ) -> Option<u64> {
        let (data, compressed) = maybe_compress(raw, &self.compression);
        let stored_size = data.len();

        if stored_size > self.config.max_bytes {
            warn!(key, size = stored_size, "Value exceeds memory tier capacity, not cached");
            return None;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        state.remove(key);

        // Evict from the LRU end until both bounds hold for the new entry.
        let mut evicted = 0u64;
        while state.entries.len() + 1 > self.config.max_entries
            || state.bytes_used + stored_size > self.config.max_bytes
        {
            let victim = match state.access_order.keys().next().copied() {
                Some(seq) => state.access_order[&seq].clone(),
                None => break,
            };
            state.remove(&victim);
            evicted += 1;
            debug!(key = %victim, "Evicted from memory tier");
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let now = Instant::now();
        state.access_order.insert(seq, key.to_string());
        state.bytes_used += stored_size;
        state.entries.insert(
            key.to_string(),
            MemoryEntry {
                data,
                compressed,
                created: now,
                last_access: now,
                access_count: 0,
                ttl,
                tags,
                seq,
            },
        );

        Some(evicted)
    }

    /// Fetch and decompress a value, refreshing its recency. Expired
    /// entries are dropped lazily here.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        let expired = match state.entries.get(key) {
            Some(entry) => entry.expired(now),
            None => return None,
        };
        if expired {
            state.remove(key);
            return None;
        }

        state.bump(key);
        let entry = state.entries.get_mut(key)?;
        entry.last_access = now;
        entry.access_count += 1;

        if entry.compressed {
            let data = entry.data.clone();
            drop(state);
            match decompress(&data) {
                Ok(raw) => Some(raw),
                Err(e) => {
                    warn!(key, error = %e, "Corrupt compressed entry in memory tier, dropping");
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.remove(key);
                    None
                }
            }
        } else {
            Some(entry.data.clone())
        }
    }

    /// Whether a live (non-expired) entry exists, without refreshing recency.
    pub fn contains(&self, key: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .entries
            .get(key)
            .map(|e| !e.expired(Instant::now()))
            .unwrap_or(false)
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.remove(key).is_some()
    }

    /// Keys whose tag set intersects `tags`.
    pub fn keys_with_any_tag(&self, tags: &[String]) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .entries
            .iter()
            .filter(|(_, entry)| entry.tags.iter().any(|t| tags.contains(t)))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn usage_bytes(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .bytes_used
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = MemoryState::default();
    }
}
