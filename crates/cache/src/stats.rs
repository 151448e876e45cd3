//! Cache statistics

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Lock-free counters behind [`crate::CacheStore::stats`]
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub writes: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
    pub invalidations: AtomicU64,
    pub corrupted: AtomicU64,
    pub errors: AtomicU64,
    pub entries: AtomicUsize,
    pub bytes: AtomicU64,
}

impl CacheCounters {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_usage(&self, entries: usize, bytes: u64) {
        self.entries.store(entries, Ordering::Relaxed);
        self.bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Point-in-time view of cache usage and effectiveness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_entries: usize,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub writes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub corrupted_removed: u64,
    pub errors: u64,
}

impl CacheStatistics {
    pub(crate) fn snapshot(counters: &CacheCounters, max_entries: usize, max_bytes: u64) -> Self {
        Self {
            entries: counters.entries.load(Ordering::Relaxed),
            total_bytes: counters.bytes.load(Ordering::Relaxed),
            max_entries,
            max_bytes,
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            hit_rate: counters.hit_rate(),
            writes: counters.writes.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            expirations: counters.expirations.load(Ordering::Relaxed),
            invalidations: counters.invalidations.load(Ordering::Relaxed),
            corrupted_removed: counters.corrupted.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
        }
    }

    /// Highest of entry and byte utilization, in `[0, 1]` when within limits
    pub fn utilization(&self) -> f64 {
        let by_entries = self.entries as f64 / self.max_entries.max(1) as f64;
        let by_bytes = self.total_bytes as f64 / self.max_bytes.max(1) as f64;
        by_entries.max(by_bytes)
    }
}
