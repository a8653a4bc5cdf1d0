//! Runtime configuration for the cache engine.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All tier-related knobs (capacities, thresholds, intervals) live here.
//! Invalid values are rejected at construction time; the engine never starts
//! in an inconsistent state.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised when a configuration value would put the engine in an
/// inconsistent state. Fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid capacity: {0}")]
    InvalidCapacity(String),

    #[error("invalid TTL: {0}")]
    InvalidTtl(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),

    #[error("invalid compression setting: {0}")]
    InvalidCompression(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Memory tier (L1) settings.
    pub memory: MemoryConfig,

    /// Distributed tier (L2) settings. `None` disables the tier.
    pub distributed: Option<DistributedConfig>,

    /// Persistent tier (L3) settings.
    pub persistent: PersistentConfig,

    /// Access-pattern analysis settings.
    pub analysis: AnalysisConfig,

    /// Background maintenance settings.
    pub maintenance: MaintenanceConfig,

    /// Compression settings.
    pub compression: CompressionConfig,

    /// TTL applied when a `set` carries no explicit TTL, in seconds.
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::default(),
            distributed: None,
            persistent: PersistentConfig::default(),
            analysis: AnalysisConfig::default(),
            maintenance: MaintenanceConfig::default(),
            compression: CompressionConfig::default(),
            default_ttl_secs: 300,
        }
    }
}

/// Memory tier (L1) capacity bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Maximum number of entries held in memory.
    pub max_entries: usize,

    /// Maximum total bytes held in memory (stored size, after compression).
    pub max_bytes: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 64 * 1024 * 1024, // 64 MiB
        }
    }
}

/// Distributed tier (L2) connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Connection URL (e.g. "redis://127.0.0.1:6379").
    pub url: String,

    /// Logical namespace prefixed to every key.
    pub namespace: String,

    /// Network timeout applied to every call, in milliseconds.
    pub timeout_ms: u64,

    /// TTL used when an entry carries none, in seconds. The external store
    /// requires an expiry on every key.
    pub default_ttl_secs: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            namespace: "tiercache".to_string(),
            timeout_ms: 500,
            default_ttl_secs: 3_600,
        }
    }
}

/// Persistent tier (L3) storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentConfig {
    /// Directory holding blob files and the index checkpoint.
    pub path: PathBuf,

    /// Number of index mutations between checkpoints to disk.
    pub checkpoint_every: u64,

    /// Upper bound on a single blob read/write, in milliseconds.
    pub io_timeout_ms: u64,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/tiercache"),
            checkpoint_every: 64,
            io_timeout_ms: 2_000,
        }
    }
}

/// Access-pattern analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Rolling window over which per-key frequency is computed, in seconds.
    pub window_secs: u64,

    /// Keys with no access for this long are pruned, in seconds.
    pub prune_after_secs: u64,

    /// Interval between pattern recomputes, in seconds.
    pub refresh_interval_secs: u64,

    /// Number of top keys (by frequency) kept fully scored.
    pub top_n: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            window_secs: 3_600,
            prune_after_secs: 86_400,
            refresh_interval_secs: 300,
            top_n: 20,
        }
    }
}

/// Background maintenance intervals and budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Interval between expired-entry sweeps of the persistent tier, in seconds.
    pub sweep_interval_secs: u64,

    /// Interval between predictive-preload passes, in seconds.
    pub preload_interval_secs: u64,

    /// Maximum index rows examined per sweep run.
    pub sweep_budget: usize,

    /// Minimum predictability score for a preload candidate.
    pub preload_min_score: f64,

    /// Minimum access frequency (events/hour) for a preload candidate.
    pub preload_min_freq_per_hour: f64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            preload_interval_secs: 600,
            sweep_budget: 1_024,
            preload_min_score: 0.7,
            preload_min_freq_per_hour: 5.0,
        }
    }
}

/// Compression settings shared by all tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Values at or above this serialized size are candidates for compression.
    pub threshold_bytes: usize,

    /// zstd compression level (1-22).
    pub zstd_level: i32,

    /// Required size reduction for the compressed form to be kept
    /// (0.20 = at least 20% smaller).
    pub min_gain: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 4_096,
            zstd_level: 3,
            min_gain: 0.20,
        }
    }
}

impl CacheConfig {
    /// Load configuration from a JSON file, falling back to defaults when
    /// the file is absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: CacheConfig = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(CacheConfig::default())
        }
    }

    /// Validate every knob. Called by the coordinator constructor; any error
    /// here is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory.max_entries == 0 {
            return Err(ConfigError::InvalidCapacity(
                "memory.max_entries must be > 0".into(),
            ));
        }
        if self.memory.max_bytes == 0 {
            return Err(ConfigError::InvalidCapacity(
                "memory.max_bytes must be > 0".into(),
            ));
        }
        if self.default_ttl_secs == 0 {
            return Err(ConfigError::InvalidTtl(
                "default_ttl_secs must be > 0".into(),
            ));
        }
        if self.persistent.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidPath(
                "persistent.path must not be empty".into(),
            ));
        }
        if self.persistent.io_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout(
                "persistent.io_timeout_ms must be > 0".into(),
            ));
        }
        if let Some(dist) = &self.distributed {
            if dist.url.is_empty() {
                return Err(ConfigError::InvalidPath(
                    "distributed.url must not be empty".into(),
                ));
            }
            if dist.timeout_ms == 0 {
                return Err(ConfigError::InvalidTimeout(
                    "distributed.timeout_ms must be > 0".into(),
                ));
            }
            if dist.default_ttl_secs == 0 {
                return Err(ConfigError::InvalidTtl(
                    "distributed.default_ttl_secs must be > 0".into(),
                ));
            }
        }
        if !(self.compression.min_gain > 0.0 && self.compression.min_gain < 1.0) {
            return Err(ConfigError::InvalidCompression(
                "compression.min_gain must be in (0, 1)".into(),
            ));
        }
        if !(1..=22).contains(&self.compression.zstd_level) {
            return Err(ConfigError::InvalidCompression(
                "compression.zstd_level must be in 1..=22".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = CacheConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.default_ttl_secs, 300);
        assert_eq!(cfg.compression.threshold_bytes, 4_096);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut cfg = CacheConfig::default();
        cfg.memory.max_entries = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidCapacity(_))
        ));
    }

    #[test]
    fn test_bad_compression_gain_rejected() {
        let mut cfg = CacheConfig::default();
        cfg.compression.min_gain = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidCompression(_))
        ));
    }

    #[test]
    fn test_distributed_timeout_rejected() {
        let mut cfg = CacheConfig::default();
        cfg.distributed = Some(DistributedConfig {
            timeout_ms: 0,
            ..DistributedConfig::default()
        });
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidTimeout(_))));
    }
}
