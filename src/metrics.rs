//! Per-tier cache metrics: hit/miss/eviction counters, memory usage and
//! exponentially-weighted access latency. Pure bookkeeping; shared across
//! tiers and the coordinator via `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::tier::TierLevel;

/// Smoothing factor for the latency moving average.
const LATENCY_EMA_ALPHA: f64 = 0.2;

/// Counters for a single tier.
#[derive(Debug, Default)]
pub struct TierMetric {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    memory_bytes: AtomicU64,
    latency_us: Mutex<f64>,
}

/// Point-in-time view of a tier's counters.
#[derive(Debug, Clone, Serialize)]
pub struct TierMetricSnapshot {
    pub tier: TierLevel,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub avg_latency_us: f64,
    pub memory_bytes: u64,
}

impl TierMetric {
    pub fn record_hit(&self, latency: Duration) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn record_miss(&self, latency: Duration) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_memory(&self, bytes: u64) {
        self.memory_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub_memory(&self, bytes: u64) {
        // Saturating: concurrent removals must never wrap the gauge.
        let mut current = self.memory_bytes.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.memory_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn set_memory(&self, bytes: u64) {
        self.memory_bytes.store(bytes, Ordering::Relaxed);
    }

    fn record_latency(&self, latency: Duration) {
        let us = latency.as_secs_f64() * 1e6;
        let mut ema = self.latency_us.lock().unwrap_or_else(|e| e.into_inner());
        if *ema == 0.0 {
            *ema = us;
        } else {
            *ema = LATENCY_EMA_ALPHA * us + (1.0 - LATENCY_EMA_ALPHA) * *ema;
        }
    }

    pub fn snapshot(&self, tier: TierLevel) -> TierMetricSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };
        TierMetricSnapshot {
            tier,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate,
            avg_latency_us: *self.latency_us.lock().unwrap_or_else(|e| e.into_inner()),
            memory_bytes: self.memory_bytes.load(Ordering::Relaxed),
        }
    }
}

/// One [`TierMetric`] per tier level.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    memory: TierMetric,
    distributed: TierMetric,
    persistent: TierMetric,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tier(&self, level: TierLevel) -> &TierMetric {
        match level {
            TierLevel::Memory => &self.memory,
            TierLevel::Distributed => &self.distributed,
            TierLevel::Persistent => &self.persistent,
        }
    }

    /// Snapshot every tier, L1 first.
    pub fn snapshot_all(&self) -> Vec<TierMetricSnapshot> {
        TierLevel::ALL
            .iter()
            .map(|&level| self.tier(level).snapshot(level))
            .collect()
    }
}
