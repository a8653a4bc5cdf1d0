//! The coordinator: top-level facade composing the three tiers, the
//! access-pattern analyzer and the metrics registry.
//!
//! Reads probe L1 → L2 → L3 and promote hits into the faster tiers; writes
//! go to a single tier chosen by a size/TTL heuristic (or forced by the
//! caller). Per-tier failures never reach the caller: public operations
//! return `Option`, `bool` or counts. Only construction-time configuration
//! errors are fatal.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::analyzer::AccessPatternAnalyzer;
use crate::codec::{Codec, JsonCodec};
use crate::config::{CacheConfig, ConfigError};
use crate::maintenance::{MaintenanceContext, MaintenanceScheduler};
use crate::metrics::{MetricsRegistry, TierMetricSnapshot};
use crate::tier::distributed::DistributedTier;
use crate::tier::memory::MemoryTier;
use crate::tier::persistent::PersistentTier;
use crate::tier::TierLevel;

/// Fatal construction-time failures. The engine never starts in an
/// inconsistent state.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("persistent tier failed to open: {0}")]
    Persistent(#[from] crate::tier::persistent::PersistentError),
}

/// Per-call options for [`CacheCoordinator::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// TTL for this entry; the configured default applies when absent.
    pub ttl: Option<Duration>,

    /// Tags enabling bulk invalidation.
    pub tags: Vec<String>,

    /// Bypass the tier-selection heuristic.
    pub force_tier: Option<TierLevel>,
}

impl SetOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn force_tier(mut self, tier: TierLevel) -> Self {
        self.force_tier = Some(tier);
        self
    }
}

/// A key ranked by observed access frequency.
#[derive(Debug, Clone, Serialize)]
pub struct HotKey {
    pub key: String,
    pub frequency_per_hour: f64,
}

/// Snapshot returned by [`CacheCoordinator::statistics`].
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatistics {
    /// One snapshot per tier, L1 first.
    pub tiers: Vec<TierMetricSnapshot>,

    /// Hottest keys by access frequency.
    pub hot_keys: Vec<HotKey>,

    /// Bytes held across all local tiers (L1 + L3; L2 memory belongs to
    /// the external store).
    pub total_memory_bytes: u64,

    /// Keys currently tracked by the pattern analyzer.
    pub tracked_patterns: usize,
}

/// One read-only tuning suggestion.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub area: String,
    pub message: String,
}

/// Output of [`CacheCoordinator::optimize_configuration`].
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationReport {
    pub recommendations: Vec<Recommendation>,
}

/// Multi-tier cache engine facade.
///
/// Construct once, share by reference (or `Arc`), call
/// [`initialize`](Self::initialize) to start background maintenance and
/// [`shutdown`](Self::shutdown) before dropping for a clean index
/// checkpoint.
pub struct CacheCoordinator<C: Codec = JsonCodec> {
    config: CacheConfig,
    codec: C,
    memory: Arc<MemoryTier>,
    distributed: Option<Arc<DistributedTier>>,
    persistent: Arc<PersistentTier>,
    analyzer: Arc<AccessPatternAnalyzer>,
    metrics: Arc<MetricsRegistry>,
    maintenance: tokio::sync::Mutex<Option<MaintenanceScheduler>>,
}

impl CacheCoordinator<JsonCodec> {
    /// Build an engine with the default JSON codec.
    pub async fn new(config: CacheConfig) -> Result<Self, StartupError> {
        Self::with_codec(config, JsonCodec).await
    }
}

impl<C: Codec> CacheCoordinator<C> {
    /// Build an engine with a caller-supplied codec. Validates the
    /// configuration, opens the persistent tier, and attempts the
    /// distributed tier connection; an unreachable distributed store
    /// degrades the engine to L1+L3 rather than failing startup.
    pub async fn with_codec(config: CacheConfig, codec: C) -> Result<Self, StartupError> {
        config.validate()?;

        let memory = Arc::new(MemoryTier::new(
            config.memory.clone(),
            config.compression.clone(),
        ));
        let persistent = Arc::new(
            PersistentTier::open(config.persistent.clone(), config.compression.clone()).await?,
        );

        let distributed = match &config.distributed {
            Some(dist_config) => {
                match DistributedTier::connect(dist_config.clone(), config.compression.clone())
                    .await
                {
                    Ok(tier) => Some(Arc::new(tier)),
                    Err(e) => {
                        warn!(url = %dist_config.url, error = %e,
                            "Distributed tier unreachable, running on L1+L3 only");
                        None
                    }
                }
            }
            None => None,
        };

        info!(
            l1_max_entries = config.memory.max_entries,
            l1_max_bytes = config.memory.max_bytes,
            l2 = distributed.is_some(),
            l3_path = %config.persistent.path.display(),
            "Cache engine constructed"
        );

        Ok(Self {
            analyzer: Arc::new(AccessPatternAnalyzer::new(config.analysis.clone())),
            metrics: Arc::new(MetricsRegistry::new()),
            maintenance: tokio::sync::Mutex::new(None),
            memory,
            distributed,
            persistent,
            codec,
            config,
        })
    }

    /// Start background maintenance (pattern refresh, expiry sweep,
    /// predictive preload). Idempotent.
    pub async fn initialize(&self) {
        let mut guard = self.maintenance.lock().await;
        if guard.is_some() {
            warn!("initialize() called twice, maintenance already running");
            return;
        }
        *guard = Some(MaintenanceScheduler::spawn(MaintenanceContext {
            analyzer: self.analyzer.clone(),
            memory: self.memory.clone(),
            distributed: self.distributed.clone(),
            persistent: self.persistent.clone(),
            metrics: self.metrics.clone(),
            refresh_interval: Duration::from_secs(self.config.analysis.refresh_interval_secs),
            config: self.config.maintenance.clone(),
        }));
    }

    /// Stop maintenance and checkpoint the persistent index.
    pub async fn shutdown(&self) {
        if let Some(scheduler) = self.maintenance.lock().await.take() {
            scheduler.shutdown().await;
        }
        if let Err(e) = self.persistent.checkpoint().await {
            warn!(error = %e, "Final index checkpoint failed");
        }
        info!("Cache engine shut down");
    }

    /// Fetch a value, probing L1 → L2 → L3. A hit at a lower tier is
    /// promoted (copied) into the faster tiers; the lower-tier copy stays.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        // L1
        let start = Instant::now();
        if let Some(raw) = self.memory.get(key) {
            self.metrics
                .tier(TierLevel::Memory)
                .record_hit(start.elapsed());
            self.analyzer.record(key, raw.len());
            return self.decode_value(key, TierLevel::Memory, &raw);
        }
        self.metrics
            .tier(TierLevel::Memory)
            .record_miss(start.elapsed());

        // L2
        if let Some(l2) = &self.distributed {
            let start = Instant::now();
            if let Some((raw, remaining_secs)) = l2.get(key).await {
                self.metrics
                    .tier(TierLevel::Distributed)
                    .record_hit(start.elapsed());
                self.analyzer.record(key, raw.len());

                // Lazy promotion into L1 with the TTL the store reports.
                let ttl = remaining_secs.map(Duration::from_secs);
                if let Some(evicted) = self.memory.set(key, &raw, ttl, Vec::new()) {
                    self.metrics
                        .tier(TierLevel::Memory)
                        .record_evictions(evicted);
                    debug!(key, from = %TierLevel::Distributed, "Promoted to L1");
                }

                return self.decode_value(key, TierLevel::Distributed, &raw);
            }
            self.metrics
                .tier(TierLevel::Distributed)
                .record_miss(start.elapsed());
        }

        // L3
        let start = Instant::now();
        if let Some((raw, info)) = self.persistent.get(key).await {
            self.metrics
                .tier(TierLevel::Persistent)
                .record_hit(start.elapsed());
            self.analyzer.record(key, raw.len());

            let ttl = info.ttl_secs.map(Duration::from_secs);
            if let Some(evicted) = self.memory.set(key, &raw, ttl, info.tags.clone()) {
                self.metrics
                    .tier(TierLevel::Memory)
                    .record_evictions(evicted);
            }
            if let Some(l2) = &self.distributed {
                l2.set(key, &raw, ttl, &info.tags).await;
            }
            debug!(key, from = %TierLevel::Persistent, "Promoted to faster tiers");

            return self.decode_value(key, TierLevel::Persistent, &raw);
        }
        self.metrics
            .tier(TierLevel::Persistent)
            .record_miss(start.elapsed());

        self.analyzer.record(key, 0);
        None
    }

    /// Store a value. The target tier comes from `force_tier` or the
    /// size/TTL heuristic; a write to L2/L3 is not mirrored into L1 (lazy
    /// promotion happens on the next read). Returns false only when the
    /// value cannot be serialized or the chosen tier rejects the write.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, options: SetOptions) -> bool {
        let raw = match self.codec.encode(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "Value cannot be serialized, not cached");
                return false;
            }
        };

        let ttl = options
            .ttl
            .unwrap_or(Duration::from_secs(self.config.default_ttl_secs));
        let target = options
            .force_tier
            .unwrap_or_else(|| self.select_tier(raw.len(), ttl));

        self.analyzer.record(key, raw.len());
        debug!(key, size = raw.len(), tier = %target, "Cache write");

        match target {
            TierLevel::Memory => self.store_in_memory(key, &raw, ttl, options.tags),
            TierLevel::Distributed => {
                if let Some(l2) = &self.distributed {
                    if l2.set(key, &raw, Some(ttl), &options.tags).await {
                        return true;
                    }
                    warn!(key, "L2 write failed, falling back to memory tier");
                }
                self.store_in_memory(key, &raw, ttl, options.tags)
            }
            TierLevel::Persistent => self.persistent.set(key, &raw, Some(ttl), options.tags).await,
        }
    }

    /// L1 write with eviction accounting. False when the tier rejects the
    /// value (it would never fit), so the caller is not told an
    /// unretrievable write succeeded.
    fn store_in_memory(&self, key: &str, raw: &[u8], ttl: Duration, tags: Vec<String>) -> bool {
        match self.memory.set(key, raw, Some(ttl), tags) {
            Some(evicted) => {
                self.metrics
                    .tier(TierLevel::Memory)
                    .record_evictions(evicted);
                true
            }
            None => false,
        }
    }

    /// Remove a key from every tier. Returns true when at least one tier
    /// held it.
    pub async fn delete(&self, key: &str) -> bool {
        let in_l1 = self.memory.delete(key);
        let (in_l2, in_l3) = futures::join!(
            async {
                match &self.distributed {
                    Some(l2) => l2.delete(key).await,
                    None => false,
                }
            },
            self.persistent.delete(key),
        );
        in_l1 || in_l2 || in_l3
    }

    /// Remove every entry whose tag set intersects `tags`, from every tier
    /// it lives in. Returns the number of distinct keys removed.
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> usize {
        let mut keys: BTreeSet<String> = BTreeSet::new();
        keys.extend(self.memory.keys_with_any_tag(tags));
        if let Some(l2) = &self.distributed {
            keys.extend(l2.keys_with_any_tag(tags).await);
        }
        keys.extend(self.persistent.keys_with_any_tag(tags).await);

        let mut removed = 0usize;
        for key in &keys {
            if self.delete(key).await {
                removed += 1;
            }
        }

        if let Some(l2) = &self.distributed {
            l2.remove_tag_sets(tags).await;
        }

        info!(?tags, removed, "Tag invalidation complete");
        removed
    }

    /// Whether any tier currently holds a live entry for the key.
    pub async fn contains(&self, key: &str) -> bool {
        if self.memory.contains(key) {
            return true;
        }
        if let Some(l2) = &self.distributed {
            if l2.contains(key).await {
                return true;
            }
        }
        self.persistent.contains(key).await
    }

    /// Remove everything from every tier.
    pub async fn clear(&self) {
        self.memory.clear();
        self.persistent.clear().await;
        // L2 entries expire on their own; their tag sets do too.
    }

    /// Snapshot of per-tier metrics, hot keys, and aggregate memory usage.
    pub async fn statistics(&self) -> CacheStatistics {
        let l1_bytes = self.memory.usage_bytes() as u64;
        let l3_bytes = self.persistent.usage_bytes().await;
        self.metrics.tier(TierLevel::Memory).set_memory(l1_bytes);
        self.metrics
            .tier(TierLevel::Persistent)
            .set_memory(l3_bytes);

        let hot_keys = self
            .analyzer
            .top_patterns(self.config.analysis.top_n)
            .into_iter()
            .map(|p| HotKey {
                key: p.key,
                frequency_per_hour: p.frequency_per_hour,
            })
            .collect();

        CacheStatistics {
            tiers: self.metrics.snapshot_all(),
            hot_keys,
            total_memory_bytes: l1_bytes + l3_bytes,
            tracked_patterns: self.analyzer.tracked_keys(),
        }
    }

    /// Read-only analysis of observed traffic producing tuning
    /// recommendations. Never mutates live configuration.
    pub async fn optimize_configuration(&self) -> OptimizationReport {
        let stats = self.statistics().await;
        let mut recommendations = Vec::new();

        let l1 = &stats.tiers[0];
        let l1_traffic = l1.hits + l1.misses;
        if l1_traffic >= 100 && l1.hit_rate < 0.5 && l1.evictions > 0 {
            recommendations.push(Recommendation {
                area: "memory".into(),
                message: format!(
                    "L1 hit rate is {:.0}% with {} evictions; raise max_bytes ({}) or max_entries ({})",
                    l1.hit_rate * 100.0,
                    l1.evictions,
                    self.config.memory.max_bytes,
                    self.config.memory.max_entries,
                ),
            });
        }

        let patterns = self.analyzer.top_patterns(self.config.analysis.top_n);
        let pinnable: Vec<&str> = patterns
            .iter()
            .filter(|p| p.predictability > 0.7 && p.frequency_per_hour > 5.0)
            .filter(|p| !self.memory.contains(&p.key))
            .map(|p| p.key.as_str())
            .collect();
        if !pinnable.is_empty() {
            recommendations.push(Recommendation {
                area: "preload".into(),
                message: format!(
                    "{} hot predictable key(s) not resident in L1 (e.g. {:?}); consider pinning or a shorter preload interval",
                    pinnable.len(),
                    &pinnable[..pinnable.len().min(3)],
                ),
            });
        }

        let l3 = &stats.tiers[2];
        if self.distributed.is_none() && l3.hits > l1.hits {
            recommendations.push(Recommendation {
                area: "distributed".into(),
                message: "Most hits are served from disk; configuring a distributed tier would cut read latency".into(),
            });
        }

        let total_hits: u64 = stats.tiers.iter().map(|t| t.hits).sum();
        let total_misses: u64 = stats.tiers.iter().map(|t| t.misses).sum();
        if total_hits + total_misses >= 100
            && (total_hits as f64) / ((total_hits + total_misses) as f64) < 0.3
        {
            recommendations.push(Recommendation {
                area: "ttl".into(),
                message: format!(
                    "Overall hit rate is low; entries may expire before reuse — consider raising default_ttl_secs ({})",
                    self.config.default_ttl_secs,
                ),
            });
        }

        OptimizationReport { recommendations }
    }

    /// Size/TTL heuristic used when the caller does not force a tier:
    /// small short-lived values go to memory, medium values to the
    /// distributed store when present, everything else to disk.
    fn select_tier(&self, size: usize, ttl: Duration) -> TierLevel {
        const KIB: usize = 1024;
        const MIB: usize = 1024 * 1024;

        if size < KIB && ttl < Duration::from_secs(300) {
            TierLevel::Memory
        } else if size < 10 * MIB && ttl < Duration::from_secs(3_600) {
            if self.distributed.is_some() {
                TierLevel::Distributed
            } else {
                TierLevel::Memory
            }
        } else {
            TierLevel::Persistent
        }
    }

    fn decode_value<T: DeserializeOwned>(
        &self,
        key: &str,
        tier: TierLevel,
        raw: &[u8],
    ) -> Option<T> {
        match self.codec.decode(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, %tier, error = %e, "Cached bytes failed to decode, treating as miss");
                None
            }
        }
    }

    /// The analyzer, for callers that want raw pattern data.
    pub fn analyzer(&self) -> &AccessPatternAnalyzer {
        &self.analyzer
    }

    /// Whether the distributed tier is connected.
    pub fn distributed_available(&self) -> bool {
        self.distributed.is_some()
    }
}
