//! Distributed tier (L2): thin adapter over a Redis-compatible store.
//!
//! The external store owns expiry (every key is written with a TTL) and all
//! concurrency safety. Every call carries an explicit network timeout; a
//! timeout or connection failure is a tier-local miss, never an error the
//! caller sees.
//!
//! Tag invalidation is supported without a full key scan: `set` adds the
//! logical key to one marker set per tag (`<ns>:tag:<tag>`), expired along
//! with the entries it points at.

use std::time::Duration;

use bytes::Bytes;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::{decode_payload, maybe_compress};
use crate::config::{CompressionConfig, DistributedConfig};

/// Expiry for a tag marker set holding a member with this TTL: slightly
/// past the member so a scan never misses a live entry.
fn marker_expiry_secs(ttl_secs: u64) -> i64 {
    ttl_secs as i64 + 60
}

/// Whether a marker set's expiry should be replaced. `current` follows
/// redis TTL semantics: -2 missing, -1 no expiry (a set created by the
/// SADD just before this check). The expiry is only ever extended.
fn marker_needs_extension(current: i64, desired: i64) -> bool {
    current < desired
}

#[derive(Error, Debug)]
pub enum DistributedError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Adapter over an external Redis-compatible store.
pub struct DistributedTier {
    conn: redis::aio::MultiplexedConnection,
    config: DistributedConfig,
    compression: CompressionConfig,
}

impl DistributedTier {
    /// Connect and ping the store. Failure here means the tier is
    /// unavailable; the coordinator degrades to L1+L3.
    pub async fn connect(
        config: DistributedConfig,
        compression: CompressionConfig,
    ) -> Result<Self, DistributedError> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let client = redis::Client::open(config.url.as_str())?;

        let mut conn = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| DistributedError::Timeout(timeout))??;

        let _: String = tokio::time::timeout(timeout, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| DistributedError::Timeout(timeout))??;

        info!(url = %config.url, namespace = %config.namespace, "Distributed tier connected");

        Ok(Self {
            conn,
            config,
            compression,
        })
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{}:k:{}", self.config.namespace, key)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}:tag:{}", self.config.namespace, tag)
    }

    /// Store a serialized value with the given TTL. Returns false on any
    /// network failure or timeout.
    pub async fn set(
        &self,
        key: &str,
        raw: &[u8],
        ttl: Option<Duration>,
        tags: &[String],
    ) -> bool {
        let (payload, compressed) = maybe_compress(raw, &self.compression);
        let ttl_secs = ttl
            .map(|t| t.as_secs().max(1))
            .unwrap_or(self.config.default_ttl_secs);

        match self.try_set(key, &payload, ttl_secs, tags).await {
            Ok(()) => {
                debug!(key, size = payload.len(), compressed, ttl_secs, "L2 set");
                true
            }
            Err(e) => {
                warn!(key, error = %e, "L2 set failed");
                false
            }
        }
    }

    async fn try_set(
        &self,
        key: &str,
        payload: &[u8],
        ttl_secs: u64,
        tags: &[String],
    ) -> Result<(), DistributedError> {
        let timeout = self.timeout();
        let mut conn = self.conn.clone();
        let entry_key = self.entry_key(key);

        tokio::time::timeout(timeout, async {
            conn.set_ex::<_, _, ()>(&entry_key, payload, ttl_secs).await?;
            for tag in tags {
                let tag_key = self.tag_key(tag);
                conn.sadd::<_, _, ()>(&tag_key, key).await?;
                // The marker must outlive its longest-lived member, so a
                // short-TTL write never shortens it.
                let desired = marker_expiry_secs(ttl_secs);
                let current: i64 = conn.ttl(&tag_key).await?;
                if marker_needs_extension(current, desired) {
                    conn.expire::<_, ()>(&tag_key, desired).await?;
                }
            }
            Ok::<(), redis::RedisError>(())
        })
        .await
        .map_err(|_| DistributedError::Timeout(timeout))??;

        Ok(())
    }

    /// Fetch a value and its remaining TTL in seconds. The payload is
    /// decompressed if it was stored compressed (detected by attempting
    /// decompression, falling back to the raw bytes).
    pub async fn get(&self, key: &str) -> Option<(Bytes, Option<u64>)> {
        match self.try_get(key).await {
            Ok(Some((payload, ttl))) => Some((decode_payload(&payload), ttl)),
            Ok(None) => None,
            Err(e) => {
                debug!(key, error = %e, "L2 get failed, treating as miss");
                None
            }
        }
    }

    async fn try_get(&self, key: &str) -> Result<Option<(Vec<u8>, Option<u64>)>, DistributedError> {
        let timeout = self.timeout();
        let mut conn = self.conn.clone();
        let entry_key = self.entry_key(key);

        let result = tokio::time::timeout(timeout, async {
            let payload: Option<Vec<u8>> = conn.get(&entry_key).await?;
            match payload {
                Some(bytes) => {
                    // -2 = missing, -1 = no expiry.
                    let ttl: i64 = conn.ttl(&entry_key).await?;
                    let remaining = (ttl > 0).then_some(ttl as u64);
                    Ok::<_, redis::RedisError>(Some((bytes, remaining)))
                }
                None => Ok(None),
            }
        })
        .await
        .map_err(|_| DistributedError::Timeout(timeout))??;

        Ok(result)
    }

    /// Delete a key. Returns true when the store held it.
    pub async fn delete(&self, key: &str) -> bool {
        let timeout = self.timeout();
        let mut conn = self.conn.clone();
        let entry_key = self.entry_key(key);

        let deleted = tokio::time::timeout(timeout, conn.del::<_, i64>(&entry_key)).await;
        match deleted {
            Ok(Ok(n)) => n > 0,
            Ok(Err(e)) => {
                warn!(key, error = %e, "L2 delete failed");
                false
            }
            Err(_) => {
                warn!(key, timeout_ms = self.config.timeout_ms, "L2 delete timed out");
                false
            }
        }
    }

    /// Whether the store currently holds a key.
    pub async fn contains(&self, key: &str) -> bool {
        let timeout = self.timeout();
        let mut conn = self.conn.clone();
        let entry_key = self.entry_key(key);

        matches!(
            tokio::time::timeout(timeout, conn.exists::<_, bool>(&entry_key)).await,
            Ok(Ok(true))
        )
    }

    /// Logical keys whose tag set intersects `tags`, from the marker sets.
    pub async fn keys_with_any_tag(&self, tags: &[String]) -> Vec<String> {
        let timeout = self.timeout();
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();

        for tag in tags {
            let tag_key = self.tag_key(tag);
            match tokio::time::timeout(timeout, conn.smembers::<_, Vec<String>>(&tag_key)).await {
                Ok(Ok(members)) => keys.extend(members),
                Ok(Err(e)) => warn!(tag, error = %e, "L2 tag scan failed"),
                Err(_) => warn!(tag, "L2 tag scan timed out"),
            }
        }

        keys.sort();
        keys.dedup();
        keys
    }

    /// Drop the marker sets for fully-invalidated tags.
    pub async fn remove_tag_sets(&self, tags: &[String]) {
        let timeout = self.timeout();
        let mut conn = self.conn.clone();

        for tag in tags {
            let tag_key = self.tag_key(tag);
            if let Err(e) = tokio::time::timeout(timeout, conn.del::<_, i64>(&tag_key))
                .await
                .map_err(|_| DistributedError::Timeout(timeout))
                .and_then(|r| r.map_err(DistributedError::from))
            {
                warn!(tag, error = %e, "L2 tag set removal failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_expiry_only_ever_extended() {
        // A freshly created set (no expiry yet) gets one.
        assert!(marker_needs_extension(-1, marker_expiry_secs(60)));
        // A longer-lived member pushes the marker out.
        assert!(marker_needs_extension(120, marker_expiry_secs(3_600)));
        // A short-TTL member added later leaves a long-lived marker alone;
        // otherwise the marker could expire while that member is still
        // live and a tag scan would miss it.
        assert!(!marker_needs_extension(
            marker_expiry_secs(3_600),
            marker_expiry_secs(60)
        ));
    }
}
