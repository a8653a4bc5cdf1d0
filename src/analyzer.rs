//! Access-pattern analysis: rolling per-key statistics that drive TTL
//! recommendations and predictive preloading.
//!
//! Every get/set records an event. Frequency is the event count over a
//! rolling window (one hour by default). The predictability score in [0, 1]
//! comes from the coefficient of variation of inter-access intervals: keys
//! requested at regular intervals score high and are worth preloading just
//! before the predicted next access.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::config::AnalysisConfig;

/// Derived statistics for one key.
#[derive(Debug, Clone, Serialize)]
pub struct CachePattern {
    pub key: String,
    /// Accesses per hour over the rolling window.
    pub frequency_per_hour: f64,
    /// Mean observed serialized size in bytes.
    pub avg_size_bytes: f64,
    /// TTL recommendation derived from frequency, in seconds.
    pub recommended_ttl_secs: u64,
    /// Regularity of inter-access intervals, in [0, 1].
    pub predictability: f64,
    /// Events currently inside the window.
    pub samples: usize,
}

#[derive(Debug)]
struct KeyStats {
    /// Access timestamps inside the rolling window, oldest first.
    window: VecDeque<Instant>,
    avg_size: f64,
    size_samples: u64,
    /// Cached score, recomputed by `refresh` for the hottest keys and on
    /// demand elsewhere.
    predictability: f64,
    last_access: Instant,
}

impl KeyStats {
    fn new(now: Instant) -> Self {
        Self {
            window: VecDeque::new(),
            avg_size: 0.0,
            size_samples: 0,
            predictability: 0.0,
            last_access: now,
        }
    }

    fn prune_window(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.window.front() {
            if now.duration_since(oldest) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Mean interval between consecutive accesses in the window.
    fn mean_interval(&self) -> Option<Duration> {
        if self.window.len() < 2 {
            return None;
        }
        let span = self
            .window
            .back()?
            .duration_since(*self.window.front()?);
        Some(span / (self.window.len() as u32 - 1))
    }

    /// `max(0, 1 - stdev/mean)` over inter-access intervals; needs at
    /// least three samples, 0 when the mean interval is 0.
    fn compute_predictability(&self) -> f64 {
        if self.window.len() < 3 {
            return 0.0;
        }
        let intervals: Vec<f64> = self
            .window
            .iter()
            .zip(self.window.iter().skip(1))
            .map(|(a, b)| b.duration_since(*a).as_secs_f64())
            .collect();

        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        if mean == 0.0 {
            return 0.0;
        }
        let variance =
            intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
        let stdev = variance.sqrt();
        (1.0 - stdev / mean).max(0.0)
    }
}

/// Rolling per-key access statistics.
pub struct AccessPatternAnalyzer {
    state: Mutex<HashMap<String, KeyStats>>,
    config: AnalysisConfig,
}

impl AccessPatternAnalyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    /// Frequency scaled to events per hour.
    fn frequency_per_hour(&self, samples: usize) -> f64 {
        samples as f64 * 3_600.0 / self.config.window_secs as f64
    }

    /// TTL recommendation from access frequency.
    pub fn recommended_ttl(frequency_per_hour: f64) -> u64 {
        if frequency_per_hour > 10.0 {
            3_600
        } else if frequency_per_hour >= 1.0 {
            1_800
        } else {
            300
        }
    }

    /// Record one access event. Called on every get and set.
    pub fn record(&self, key: &str, size_bytes: usize) {
        let now = Instant::now();
        let window = self.window();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let stats = state
            .entry(key.to_string())
            .or_insert_with(|| KeyStats::new(now));
        stats.window.push_back(now);
        stats.prune_window(now, window);
        stats.last_access = now;
        if size_bytes > 0 {
            stats.size_samples += 1;
            stats.avg_size += (size_bytes as f64 - stats.avg_size) / stats.size_samples as f64;
        }
    }

    /// Current pattern for a key, if it has any events in the window.
    pub fn pattern(&self, key: &str) -> Option<CachePattern> {
        let now = Instant::now();
        let window = self.window();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let stats = state.get_mut(key)?;
        stats.prune_window(now, window);
        if stats.window.is_empty() {
            return None;
        }

        let frequency = self.frequency_per_hour(stats.window.len());
        Some(CachePattern {
            key: key.to_string(),
            frequency_per_hour: frequency,
            avg_size_bytes: stats.avg_size,
            recommended_ttl_secs: Self::recommended_ttl(frequency),
            predictability: stats.compute_predictability(),
            samples: stats.window.len(),
        })
    }

    /// Top `n` patterns by frequency, hottest first.
    pub fn top_patterns(&self, n: usize) -> Vec<CachePattern> {
        let now = Instant::now();
        let window = self.window();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let mut patterns: Vec<CachePattern> = state
            .iter_mut()
            .filter_map(|(key, stats)| {
                stats.prune_window(now, window);
                if stats.window.is_empty() {
                    return None;
                }
                let frequency = self.frequency_per_hour(stats.window.len());
                Some(CachePattern {
                    key: key.clone(),
                    frequency_per_hour: frequency,
                    avg_size_bytes: stats.avg_size,
                    recommended_ttl_secs: Self::recommended_ttl(frequency),
                    predictability: stats.predictability,
                    samples: stats.window.len(),
                })
            })
            .collect();

        patterns.sort_by(|a, b| {
            b.frequency_per_hour
                .partial_cmp(&a.frequency_per_hour)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        patterns.truncate(n);
        patterns
    }

    /// Periodic recompute: prune idle keys, refresh predictability for the
    /// top-N keys by frequency. Returns the number of keys pruned.
    pub fn refresh(&self) -> usize {
        let now = Instant::now();
        let window = self.window();
        let prune_after = Duration::from_secs(self.config.prune_after_secs);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let before = state.len();
        state.retain(|_, stats| now.duration_since(stats.last_access) < prune_after);
        let pruned = before - state.len();

        // Rank by window size after pruning, then rescore the hottest keys.
        let mut ranked: Vec<(String, usize)> = state
            .iter_mut()
            .map(|(key, stats)| {
                stats.prune_window(now, window);
                (key.clone(), stats.window.len())
            })
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));

        for (key, _) in ranked.into_iter().take(self.config.top_n) {
            if let Some(stats) = state.get_mut(&key) {
                stats.predictability = stats.compute_predictability();
            }
        }

        if pruned > 0 {
            debug!(pruned, tracked = state.len(), "Pattern refresh pruned idle keys");
        }
        pruned
    }

    /// Keys predictable and hot enough to preload: score and frequency
    /// above the thresholds, with the predicted next access close (time
    /// since last access ≥ 80% of the mean inter-access interval).
    pub fn preload_candidates(&self, min_score: f64, min_freq_per_hour: f64) -> Vec<String> {
        let now = Instant::now();
        let window = self.window();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        state
            .iter_mut()
            .filter_map(|(key, stats)| {
                stats.prune_window(now, window);
                if self.frequency_per_hour(stats.window.len()) <= min_freq_per_hour {
                    return None;
                }
                let score = stats.compute_predictability();
                if score <= min_score {
                    return None;
                }
                let mean = stats.mean_interval()?;
                let since_last = now.duration_since(stats.last_access);
                (since_last.as_secs_f64() >= 0.8 * mean.as_secs_f64()).then(|| key.clone())
            })
            .collect()
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
