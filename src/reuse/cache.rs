//! Reuse cache
//!
//! A free-list of whole released allocations kept for verbatim reuse.
//! Entries are sorted by ascending real size for smallest-fit lookup and are
//! handed out with exclusive ownership: an entry is removed the instant it
//! matches, so no two consumers ever share one.
//!
//! The cache never blocks on the device. "Still in use" is a non-blocking
//! poll against the completion marker, re-validated at the moment of reuse;
//! entries inserted with the `completed` flag skip the poll entirely.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::backend::{
    AllocationId, AllocationProperties, MemoryBackend, MemoryRecord, MemoryType,
};

/// Tunable reuse policy.
///
/// The utilization ratio and age cutoffs are policy, not structure; embedders
/// override them per workload.
#[derive(Debug, Clone)]
pub struct ReuseConfig {
    /// Cumulative byte budget across all cached entries
    pub byte_budget: u64,
    /// Largest single allocation the cache will hold
    pub max_cached_size: u64,
    /// Minimum `requested / cached` size ratio for a match
    pub min_alloc_utilization: f64,
    /// Cached sizes below this are exempt from the utilization check
    pub utilization_check_threshold: u64,
    /// Entries older than this are trimmed by the background cleaner
    pub max_age: Duration,
    /// Mint a fresh allocation id on insertion, for consumers that track
    /// allocations by stable identifier
    pub reassign_ids: bool,
}

impl Default for ReuseConfig {
    fn default() -> Self {
        ReuseConfig {
            byte_budget: 256 * 1024 * 1024,
            max_cached_size: 64 * 1024 * 1024,
            min_alloc_utilization: 0.5,
            utilization_check_threshold: 1024 * 1024,
            max_age: Duration::from_secs(10),
            reassign_ids: false,
        }
    }
}

impl ReuseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_byte_budget(mut self, byte_budget: u64) -> Self {
        self.byte_budget = byte_budget;
        self
    }

    pub fn with_max_cached_size(mut self, max_cached_size: u64) -> Self {
        self.max_cached_size = max_cached_size;
        self
    }

    pub fn with_min_alloc_utilization(mut self, ratio: f64) -> Self {
        self.min_alloc_utilization = ratio;
        self
    }

    pub fn with_utilization_check_threshold(mut self, threshold: u64) -> Self {
        self.utilization_check_threshold = threshold;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_reassign_ids(mut self, reassign: bool) -> Self {
        self.reassign_ids = reassign;
        self
    }
}

#[derive(Debug)]
struct ReuseEntry {
    /// Real requested size, not the rounded reservation size
    size: u64,
    record: MemoryRecord,
    /// Releasing operation known finished at insertion time
    completed: bool,
    saved_at: Instant,
}

#[derive(Debug, Default)]
struct CacheInner {
    /// Sorted by ascending `size`
    entries: Vec<ReuseEntry>,
    /// Sum of `record.size` over all entries
    cached_bytes: u64,
}

/// Free-list of released full allocations for one memory type.
#[derive(Debug)]
pub struct ReuseCache {
    memory_type: MemoryType,
    config: ReuseConfig,
    backend: Arc<dyn MemoryBackend>,
    inner: Mutex<CacheInner>,
}

impl ReuseCache {
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        memory_type: MemoryType,
        config: ReuseConfig,
    ) -> Self {
        ReuseCache {
            memory_type,
            config,
            backend,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn max_age(&self) -> Duration {
        self.config.max_age
    }

    /// Offer a released allocation to the cache.
    ///
    /// Returns the record back on rejection so the caller releases it to the
    /// raw allocator instead. Rejected: imported allocations, internal
    /// bookkeeping allocations, wrong memory type, sizes above the per-entry
    /// cap, and entries that would not fit the byte budget even after
    /// trimming older entries.
    pub fn try_insert(
        &self,
        mut record: MemoryRecord,
        requested_size: u64,
        completed: bool,
    ) -> Result<(), MemoryRecord> {
        if record.imported || record.internal {
            return Err(record);
        }
        if record.memory_type != self.memory_type {
            return Err(record);
        }
        if requested_size == 0 || record.size > self.config.max_cached_size {
            return Err(record);
        }

        let evicted = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(_) => return Err(record),
            };

            let mut evicted = Vec::new();
            if inner.cached_bytes + record.size > self.config.byte_budget {
                evicted = Self::evict_for_budget(
                    &mut inner,
                    record.size,
                    self.config.byte_budget,
                );
                if inner.cached_bytes + record.size > self.config.byte_budget {
                    // Budget cannot fit this entry even empty
                    drop(inner);
                    for entry in evicted {
                        self.backend.release(entry.record);
                    }
                    return Err(record);
                }
            }

            if self.config.reassign_ids {
                // Consumers tracking allocations by identifier must see a
                // recycled allocation as a new one
                record.alloc_id = AllocationId::fresh();
            }

            let entry = ReuseEntry {
                size: requested_size,
                record,
                completed,
                saved_at: Instant::now(),
            };
            let at = inner
                .entries
                .partition_point(|e| e.size <= entry.size);
            inner.cached_bytes += entry.record.size;
            trace!(
                size = entry.size,
                cached_bytes = inner.cached_bytes,
                completed,
                "reuse cache insert"
            );
            inner.entries.insert(at, entry);
            evicted
        };

        // Evicted allocations are released outside the cache lock
        for entry in evicted {
            self.backend.release(entry.record);
        }
        Ok(())
    }

    /// Take the smallest cached allocation that satisfies the request.
    ///
    /// A cached entry matches when its real size covers the request, its
    /// utilization is acceptable (exempting small entries), its address
    /// satisfies the requested alignment, its flags match, and no device
    /// work still references it.
    pub fn get(&self, size: u64, props: &AllocationProperties) -> Option<MemoryRecord> {
        if size == 0 {
            return None;
        }
        let mut inner = self.inner.lock().ok()?;

        let start = inner.entries.partition_point(|e| e.size < size);
        let mut matched = None;
        for idx in start..inner.entries.len() {
            let entry = &inner.entries[idx];

            if entry.size >= self.config.utilization_check_threshold
                && (size as f64) < (entry.size as f64) * self.config.min_alloc_utilization
            {
                // Entries only get bigger from here; utilization cannot recover
                break;
            }
            if props.alignment > 1 && entry.record.base.0 % props.alignment != 0 {
                continue;
            }
            if !entry.record.flags.matches(&props.flags) {
                continue;
            }
            // In-use status is re-validated now, at the moment of reuse;
            // the insertion-time `completed` flag short-circuits the poll.
            if !entry.completed && !self.backend.is_completed(&entry.record) {
                continue;
            }

            matched = Some(idx);
            break;
        }

        let entry = inner.entries.remove(matched?);
        inner.cached_bytes -= entry.record.size;
        trace!(
            requested = size,
            cached = entry.size,
            cached_bytes = inner.cached_bytes,
            "reuse cache hit"
        );
        Some(entry.record)
    }

    /// Remove entries saved before `cutoff` and release them to the raw
    /// allocator. Skipped while the deferred-deletion subsystem has pending
    /// work for this memory type, unless `force` is set.
    pub fn trim_old_allocs(&self, cutoff: Instant, force: bool) -> usize {
        if !force && self.backend.has_deferred_frees(self.memory_type) {
            debug!(memory_type = %self.memory_type, "trim skipped: deferred frees pending");
            return 0;
        }

        let stale = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(_) => return 0,
            };
            let mut stale = Vec::new();
            let mut idx = 0;
            while idx < inner.entries.len() {
                if inner.entries[idx].saved_at < cutoff {
                    let entry = inner.entries.remove(idx);
                    inner.cached_bytes -= entry.record.size;
                    stale.push(entry);
                } else {
                    idx += 1;
                }
            }
            stale
        };

        let count = stale.len();
        if count > 0 {
            debug!(count, memory_type = %self.memory_type, "trimmed aged reuse entries");
        }
        for entry in stale {
            self.backend.release(entry.record);
        }
        count
    }

    /// Release every cached entry immediately. Used at teardown and under
    /// device-out-of-memory pressure.
    pub fn trim_all(&self) -> usize {
        self.trim_old_allocs(Instant::now() + Duration::from_secs(1), true)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cached_bytes(&self) -> u64 {
        self.inner.lock().map(|inner| inner.cached_bytes).unwrap_or(0)
    }

    /// Evict entries until `incoming` fits the budget: oldest first,
    /// largest first among equally old.
    fn evict_for_budget(
        inner: &mut CacheInner,
        incoming: u64,
        budget: u64,
    ) -> Vec<ReuseEntry> {
        let mut evicted = Vec::new();
        while inner.cached_bytes + incoming > budget && !inner.entries.is_empty() {
            let victim = inner
                .entries
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.saved_at
                        .cmp(&b.saved_at)
                        .then(b.record.size.cmp(&a.record.size))
                })
                .map(|(idx, _)| idx);
            let Some(idx) = victim else { break };
            let entry = inner.entries.remove(idx);
            inner.cached_bytes -= entry.record.size;
            evicted.push(entry);
        }
        evicted
    }
}

impl Drop for ReuseCache {
    fn drop(&mut self) {
        // Cached records are still live backend allocations
        self.trim_all();
    }
}
