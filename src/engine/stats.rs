//! Engine statistics
//!
//! Lock-free counters over the engine's hot paths plus a snapshot type for
//! reporting. Counters are advisory: they are updated with relaxed ordering
//! and never gate behavior.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic counters updated by the engine.
#[derive(Debug, Default)]
pub struct EngineCounters {
    /// Allocations served from a sub-allocation pool
    pub pooled_allocs: AtomicU64,
    /// Allocations served verbatim from the reuse cache
    pub reuse_hits: AtomicU64,
    /// Allocations that fell through to the raw allocator
    pub fallback_allocs: AtomicU64,
    /// Frees resolved inside a pool (no OS call)
    pub pooled_frees: AtomicU64,
    /// Released allocations accepted by the reuse cache
    pub reuse_inserts: AtomicU64,
    /// Released allocations handed straight back to the raw allocator
    pub raw_frees: AtomicU64,
    /// Entries trimmed out of reuse caches
    pub trimmed_entries: AtomicU64,
}

impl EngineCounters {
    pub fn snapshot(&self) -> PoolingStats {
        PoolingStats {
            pooled_allocs: self.pooled_allocs.load(Ordering::Relaxed),
            reuse_hits: self.reuse_hits.load(Ordering::Relaxed),
            fallback_allocs: self.fallback_allocs.load(Ordering::Relaxed),
            pooled_frees: self.pooled_frees.load(Ordering::Relaxed),
            reuse_inserts: self.reuse_inserts.load(Ordering::Relaxed),
            raw_frees: self.raw_frees.load(Ordering::Relaxed),
            trimmed_entries: self.trimmed_entries.load(Ordering::Relaxed),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }
}

/// Point-in-time view of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolingStats {
    pub pooled_allocs: u64,
    pub reuse_hits: u64,
    pub fallback_allocs: u64,
    pub pooled_frees: u64,
    pub reuse_inserts: u64,
    pub raw_frees: u64,
    pub trimmed_entries: u64,
}

impl PoolingStats {
    /// Fraction of allocations that avoided the raw allocator.
    pub fn pooling_ratio(&self) -> f64 {
        let total = self.pooled_allocs + self.reuse_hits + self.fallback_allocs;
        if total == 0 {
            return 0.0;
        }
        (self.pooled_allocs + self.reuse_hits) as f64 / total as f64
    }
}
