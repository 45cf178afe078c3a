//! Pooling engine facade
//!
//! [`PoolingEngine`] is the entry point the object-handle layer talks to.
//! One engine represents one owner context on a device; engines sharing a
//! [`DeviceContext`] share the device's pool-count budget, its background
//! reuse cleaner, and (in manager mode) its device-wide reuse caches.
//!
//! Allocation order follows the cheap-first rule: reuse cache, then
//! sub-allocation pools, then the raw allocator. Frees mirror it: pool
//! membership is checked first (no OS call), then reuse-cache insertion,
//! then raw release.

pub mod stats;

pub use stats::{EngineCounters, PoolingStats};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::aggregate::{BufferAggregator, OwnerInfo, PackedBuffer};
use crate::backend::{
    AllocationProperties, DeviceAddress, IpcHandle, MemoryBackend, MemoryRecord, MemoryType,
    PlatformCapabilities, ReserveRequest,
};
use crate::config::{EngineConfig, ResolvedPolicy};
use crate::error::{PoolResult, UnipoolError};
use crate::pool::{
    default_ladder, single_pool_info, DevicePoolBudget, PoolsManager, SubAllocationPool,
};
use crate::reuse::{ReuseCache, ReuseCleaner};

/// Device-scoped state shared by every owner context on one device.
#[derive(Debug)]
pub struct DeviceContext {
    budget: Arc<DevicePoolBudget>,
    /// Manager-level reuse caches, one per memory type, created lazily when
    /// an engine running in manager mode attaches
    shared_reuse: Mutex<HashMap<MemoryType, Arc<ReuseCache>>>,
    /// The single background trim thread for this device
    cleaner: Mutex<Option<ReuseCleaner>>,
}

impl DeviceContext {
    /// Derive the pool ceiling from the backend's available device memory.
    pub fn for_backend(backend: &dyn MemoryBackend, pool_size: u64) -> Self {
        let budget = DevicePoolBudget::for_device(backend.available_device_memory(), pool_size);
        Self::from_budget(budget)
    }

    /// Fixed pool ceiling, mainly for embedders that size it themselves.
    pub fn with_max_pools(max_pools: u32) -> Self {
        Self::from_budget(DevicePoolBudget::new(max_pools))
    }

    fn from_budget(budget: DevicePoolBudget) -> Self {
        DeviceContext {
            budget: Arc::new(budget),
            shared_reuse: Mutex::new(HashMap::new()),
            cleaner: Mutex::new(None),
        }
    }

    pub fn budget(&self) -> &Arc<DevicePoolBudget> {
        &self.budget
    }

    fn shared_reuse_cache(
        &self,
        backend: Arc<dyn MemoryBackend>,
        memory_type: MemoryType,
        config: crate::reuse::ReuseConfig,
    ) -> Arc<ReuseCache> {
        let mut map = self
            .shared_reuse
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            map.entry(memory_type)
                .or_insert_with(|| Arc::new(ReuseCache::new(backend, memory_type, config))),
        )
    }

    fn register_for_cleaning(&self, cache: &Arc<ReuseCache>, interval: std::time::Duration) {
        let mut cleaner = self.cleaner.lock().unwrap_or_else(|e| e.into_inner());
        cleaner
            .get_or_insert_with(|| ReuseCleaner::start(interval))
            .register(cache);
    }
}

/// Outcome of a successful engine free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    /// Returned to a sub-allocation pool; no OS call happened
    Pooled,
    /// Returned to an aggregator main storage
    Aggregated,
    /// Whole allocation parked in the reuse cache
    Cached,
    /// Released to the raw allocator
    Released,
}

/// Options for the engine free path.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreeOptions {
    /// Block until the device finishes with the allocation before freeing;
    /// used when the backing object is destroyed outright. Skips further
    /// in-use checks.
    pub wait_for_completion: bool,
    /// Offer the released allocation to the reuse cache
    pub try_cache: bool,
}

impl FreeOptions {
    pub fn cached() -> Self {
        FreeOptions {
            wait_for_completion: false,
            try_cache: true,
        }
    }

    pub fn immediate() -> Self {
        FreeOptions {
            wait_for_completion: false,
            try_cache: false,
        }
    }

    pub fn blocking() -> Self {
        FreeOptions {
            wait_for_completion: true,
            try_cache: true,
        }
    }
}

#[derive(Debug)]
enum PoolSet {
    /// One lazily-created static pool; `failed` latches a reservation
    /// failure so the pool is never re-attempted or queried again
    Single {
        pool: Option<SubAllocationPool>,
        failed: bool,
    },
    Manager(PoolsManager),
}

#[derive(Debug)]
struct MemoryTypeState {
    memory_type: MemoryType,
    pooling_enabled: bool,
    pools: Mutex<PoolSet>,
    reuse: Arc<ReuseCache>,
}

#[derive(Debug)]
struct UnpooledEntry {
    record: MemoryRecord,
    /// Size the caller asked for, which the reuse cache indexes by
    requested: u64,
}

/// Serializable snapshot for diagnostics and the stress CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineReport {
    pub stats: PoolingStats,
    pub host_pool_count: usize,
    pub device_pool_count: usize,
    pub aggregator_pool_count: usize,
    pub host_reuse_entries: usize,
    pub device_reuse_entries: usize,
    pub budget_active: u32,
    pub budget_max: u32,
}

/// The unified-memory pooling engine for one owner context.
#[derive(Debug)]
pub struct PoolingEngine {
    backend: Arc<dyn MemoryBackend>,
    caps: Arc<dyn PlatformCapabilities>,
    config: EngineConfig,
    policy: ResolvedPolicy,
    device: Arc<DeviceContext>,
    host: MemoryTypeState,
    device_mem: MemoryTypeState,
    aggregator: Option<Mutex<BufferAggregator>>,
    unpooled: Mutex<BTreeMap<DeviceAddress, UnpooledEntry>>,
    counters: EngineCounters,
}

impl PoolingEngine {
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        caps: Arc<dyn PlatformCapabilities>,
        config: EngineConfig,
        device: Arc<DeviceContext>,
    ) -> PoolResult<Self> {
        config.validate()?;
        let policy = config.resolve(caps.as_ref());
        info!(?policy, "pooling engine starting");

        let make_state = |memory_type: MemoryType, enabled: bool| -> PoolResult<MemoryTypeState> {
            // Per-owner cache when manager mode is off, device-wide cache
            // when it is on; never both for one memory type
            let reuse = if policy.manager_mode {
                device.shared_reuse_cache(
                    Arc::clone(&backend),
                    memory_type,
                    config.reuse.clone(),
                )
            } else {
                Arc::new(ReuseCache::new(
                    Arc::clone(&backend),
                    memory_type,
                    config.reuse.clone(),
                ))
            };
            if config.start_cleaner {
                device.register_for_cleaning(&reuse, config.cleaner_interval);
            }

            let pools = if policy.manager_mode {
                PoolSet::Manager(PoolsManager::new(
                    Arc::clone(&backend),
                    Arc::clone(&caps),
                    default_ladder(memory_type),
                    Arc::clone(device.budget()),
                    policy.track_residency,
                )?)
            } else {
                PoolSet::Single {
                    pool: None,
                    failed: false,
                }
            };

            Ok(MemoryTypeState {
                memory_type,
                pooling_enabled: enabled,
                pools: Mutex::new(pools),
                reuse,
            })
        };

        let host = make_state(MemoryType::Host, policy.host_pooling)?;
        let device_mem = make_state(MemoryType::Device, policy.device_pooling)?;

        let aggregator = if policy.aggregator {
            let aggregator_config = config.aggregator.clone().with_enabled(true);
            Some(Mutex::new(BufferAggregator::new(
                Arc::clone(&backend),
                caps.as_ref(),
                aggregator_config,
                Arc::clone(device.budget()),
            )?))
        } else {
            None
        };

        Ok(PoolingEngine {
            backend,
            caps,
            config,
            policy,
            device,
            host,
            device_mem,
            aggregator,
            unpooled: Mutex::new(BTreeMap::new()),
            counters: EngineCounters::default(),
        })
    }

    /// The decisions this engine resolved its toggles to.
    pub fn policy(&self) -> ResolvedPolicy {
        self.policy
    }

    // ---- allocation -----------------------------------------------------

    /// Full allocation path: reuse cache, pools, then the raw allocator.
    ///
    /// Pool and cache misses are invisible to the caller; the only error is
    /// genuine allocation failure after cache trimming.
    pub fn allocate(&self, size: u64, props: &AllocationProperties) -> PoolResult<DeviceAddress> {
        if size == 0 {
            return Err(UnipoolError::InvalidConfiguration(
                "zero-size allocation".to_string(),
            ));
        }

        if let Some(state) = self.state_for(props.memory_type) {
            if Self::reusable_request(props) {
                if let Some(record) = state.reuse.get(size, props) {
                    EngineCounters::bump(&self.counters.reuse_hits);
                    let base = record.base;
                    self.track_unpooled(record, size)?;
                    return Ok(base);
                }
            }

            if state.pooling_enabled {
                if let Some(addr) = self.pooled_allocate(state, size, props) {
                    EngineCounters::bump(&self.counters.pooled_allocs);
                    return Ok(addr);
                }
            }
        }

        let record = self.reserve_with_pressure_relief(size, props)?;
        EngineCounters::bump(&self.counters.fallback_allocs);
        let base = record.base;
        self.track_unpooled(record, size)?;
        Ok(base)
    }

    /// Pool-only attempt, the first-line call before a full allocation path
    /// runs. Returns `None` on any miss.
    pub fn try_pooled_alloc(
        &self,
        size: u64,
        props: &AllocationProperties,
    ) -> Option<DeviceAddress> {
        let state = self.state_for(props.memory_type)?;
        if !state.pooling_enabled || size == 0 {
            return None;
        }
        let addr = self.pooled_allocate(state, size, props)?;
        EngineCounters::bump(&self.counters.pooled_allocs);
        Some(addr)
    }

    // ---- free -----------------------------------------------------------

    /// Free with default options (non-blocking, cache-eligible).
    pub fn free(&self, addr: DeviceAddress) -> PoolResult<FreeOutcome> {
        self.free_with(addr, FreeOptions::cached())
    }

    /// Free with explicit options.
    ///
    /// `InvalidAddress` distinguishes misuse of a managed range from
    /// `AddressNotFound`, which means no subsystem here tracks the address
    /// and the caller may hand it to the next one.
    pub fn free_with(&self, addr: DeviceAddress, opts: FreeOptions) -> PoolResult<FreeOutcome> {
        for state in self.states() {
            let mut pools = state.pools.lock()?;
            let attempted = match &mut *pools {
                PoolSet::Single {
                    pool: Some(pool), ..
                } if pool.owns_range(addr) => Some(pool.free(addr)),
                PoolSet::Manager(manager) if manager.owns_range(addr) => {
                    Some(manager.free(addr))
                }
                _ => None,
            };
            if let Some(result) = attempted {
                result?;
                EngineCounters::bump(&self.counters.pooled_frees);
                return Ok(FreeOutcome::Pooled);
            }
        }

        if let Some(aggregator) = &self.aggregator {
            let mut aggregator = aggregator.lock()?;
            if aggregator.owns_range(addr) {
                aggregator.free_by_addr(addr)?;
                EngineCounters::bump(&self.counters.pooled_frees);
                return Ok(FreeOutcome::Aggregated);
            }
        }

        let entry = {
            let mut unpooled = self.unpooled.lock()?;
            match unpooled.remove(&addr) {
                Some(entry) => entry,
                None => {
                    // In-range-but-not-base is misuse, fully unknown is not
                    if let Some((_, entry)) = unpooled.range(..=addr).next_back() {
                        if entry.record.contains(addr) {
                            return Err(UnipoolError::InvalidAddress(addr));
                        }
                    }
                    return Err(UnipoolError::AddressNotFound(addr));
                }
            }
        };

        if opts.wait_for_completion {
            self.backend.wait_for_completion(&entry.record);
        }
        // After an explicit wait no further in-use checks are needed
        let completed = opts.wait_for_completion || self.backend.is_completed(&entry.record);

        if opts.try_cache {
            if let Some(state) = self.state_for(entry.record.memory_type) {
                match state.reuse.try_insert(entry.record, entry.requested, completed) {
                    Ok(()) => {
                        EngineCounters::bump(&self.counters.reuse_inserts);
                        return Ok(FreeOutcome::Cached);
                    }
                    Err(record) => {
                        self.backend.release(record);
                        EngineCounters::bump(&self.counters.raw_frees);
                        return Ok(FreeOutcome::Released);
                    }
                }
            }
        }

        self.backend.release(entry.record);
        EngineCounters::bump(&self.counters.raw_frees);
        Ok(FreeOutcome::Released)
    }

    /// Pool-only free: `AddressNotFound` when the address is not pooled.
    pub fn try_pooled_free(&self, addr: DeviceAddress) -> PoolResult<()> {
        for state in self.states() {
            let mut pools = state.pools.lock()?;
            let attempted = match &mut *pools {
                PoolSet::Single {
                    pool: Some(pool), ..
                } if pool.owns_range(addr) => Some(pool.free(addr)),
                PoolSet::Manager(manager) if manager.owns_range(addr) => {
                    Some(manager.free(addr))
                }
                _ => None,
            };
            if let Some(result) = attempted {
                result?;
                EngineCounters::bump(&self.counters.pooled_frees);
                return Ok(());
            }
        }
        Err(UnipoolError::AddressNotFound(addr))
    }

    // ---- lookups --------------------------------------------------------

    /// Base address and size of the allocation containing `addr`, uniform
    /// across pooled, aggregated, and unpooled allocations.
    pub fn mem_address_range(&self, addr: DeviceAddress) -> Option<(DeviceAddress, u64)> {
        for state in self.states() {
            let pools = state.pools.lock().ok()?;
            let range = match &*pools {
                PoolSet::Single {
                    pool: Some(pool), ..
                } => pool
                    .pooled_allocation_base(addr)
                    .zip(pool.pooled_allocation_size(addr)),
                PoolSet::Manager(manager) => manager
                    .pooled_allocation_base(addr)
                    .zip(manager.pooled_allocation_size(addr)),
                _ => None,
            };
            if range.is_some() {
                return range;
            }
        }

        if let Some(aggregator) = &self.aggregator {
            if let Some(range) = aggregator.lock().ok()?.buffer_range(addr) {
                return Some(range);
            }
        }

        {
            let unpooled = self.unpooled.lock().ok()?;
            if let Some((base, entry)) = unpooled.range(..=addr).next_back() {
                if entry.record.contains(addr) {
                    return Some((*base, entry.requested));
                }
            }
        }

        self.backend
            .query_record(addr)
            .map(|record| (record.base, record.size))
    }

    /// Is `addr` a live pooled sub-allocation?
    pub fn is_in_pool(&self, addr: DeviceAddress) -> bool {
        for state in self.states() {
            if let Ok(pools) = state.pools.lock() {
                let pooled = match &*pools {
                    PoolSet::Single {
                        pool: Some(pool), ..
                    } => pool.is_in_pool(addr),
                    PoolSet::Manager(manager) => manager.is_in_pool(addr),
                    _ => false,
                };
                if pooled {
                    return true;
                }
            }
        }
        false
    }

    // ---- IPC ------------------------------------------------------------

    /// Byte offset to encode into an exported IPC handle. Zero for
    /// non-pooled allocations.
    pub fn ipc_offset(&self, addr: DeviceAddress) -> u64 {
        for state in self.states() {
            if let Ok(pools) = state.pools.lock() {
                let offset = match &*pools {
                    PoolSet::Single {
                        pool: Some(pool), ..
                    } => pool.offset_in_pool(addr),
                    PoolSet::Manager(manager) => manager.offset_in_pool(addr),
                    _ => None,
                };
                if let Some(offset) = offset {
                    return offset;
                }
            }
        }
        if let Some(aggregator) = &self.aggregator {
            if let Ok(aggregator) = aggregator.lock() {
                if let Some(offset) = aggregator.offset_in_storage(addr) {
                    return offset;
                }
            }
        }
        0
    }

    /// Reconstruct a pointer on the importing side.
    pub fn apply_ipc_offset(&self, imported_base: DeviceAddress, offset: u64) -> DeviceAddress {
        imported_base.add(offset)
    }

    // ---- residency ------------------------------------------------------

    /// Make the allocation containing `addr` resident.
    ///
    /// For pooled addresses in a residency-tracking pool the call is
    /// absorbed: the pool already made its backing resident with the first
    /// live sub-allocation. Non-pooled addresses always forward.
    pub fn make_resident(&self, addr: DeviceAddress) -> PoolResult<()> {
        if let Some(result) = self.with_containing_pool(addr, |pool| {
            if pool.is_tracking_residency() {
                Ok(())
            } else {
                self.backend.make_resident(pool.backing())
            }
        }) {
            return result;
        }

        let record = self
            .record_for(addr)
            .ok_or(UnipoolError::AddressNotFound(addr))?;
        self.backend.make_resident(&record)
    }

    /// Evict the allocation containing `addr`.
    ///
    /// Pooled addresses in a tracking pool are absorbed while the pool has
    /// other live sub-allocations; non-pooled addresses always forward.
    pub fn evict(&self, addr: DeviceAddress) -> PoolResult<()> {
        if let Some(result) = self.with_containing_pool(addr, |pool| {
            if pool.is_tracking_residency() {
                Ok(())
            } else {
                self.backend.evict(pool.backing())
            }
        }) {
            return result;
        }

        let record = self
            .record_for(addr)
            .ok_or(UnipoolError::AddressNotFound(addr))?;
        self.backend.evict(&record)
    }

    // ---- small-buffer aggregation --------------------------------------

    /// Pack a small buffer for this owner, when aggregation is enabled.
    pub fn create_small_buffer(
        &self,
        owner: &OwnerInfo,
        size: u64,
        props: &AllocationProperties,
        initial_data: Option<&[u8]>,
    ) -> Option<PackedBuffer> {
        let aggregator = self.aggregator.as_ref()?;
        let mut aggregator = aggregator.lock().ok()?;
        if !aggregator.is_enabled(owner) {
            return None;
        }
        let buffer = aggregator.create_buffer(size, props, initial_data)?;
        EngineCounters::bump(&self.counters.pooled_allocs);
        Some(buffer)
    }

    /// Destroy a packed buffer.
    pub fn free_small_buffer(&self, buffer: &PackedBuffer) -> PoolResult<()> {
        let aggregator = self
            .aggregator
            .as_ref()
            .ok_or(UnipoolError::AddressNotFound(buffer.addr))?;
        let mut aggregator = aggregator.lock()?;
        aggregator.free_buffer(buffer)?;
        EngineCounters::bump(&self.counters.pooled_frees);
        Ok(())
    }

    /// Export an IPC handle for a packed buffer.
    pub fn export_small_buffer(&self, buffer: &PackedBuffer) -> PoolResult<IpcHandle> {
        let aggregator = self
            .aggregator
            .as_ref()
            .ok_or(UnipoolError::AddressNotFound(buffer.addr))?;
        let mut aggregator = aggregator.lock()?;
        aggregator.export_handle(buffer)
    }

    // ---- maintenance ----------------------------------------------------

    /// Trim both reuse caches immediately (device-OOM pressure path).
    pub fn trim_caches(&self) -> usize {
        let mut trimmed = 0;
        for state in self.states() {
            trimmed += state.reuse.trim_all();
        }
        EngineCounters::add(&self.counters.trimmed_entries, trimmed as u64);
        trimmed
    }

    /// Drop empty pools beyond the first per class (manager mode only).
    pub fn reclaim_unused_pools(&self) -> usize {
        let mut reclaimed = 0;
        for state in self.states() {
            if let Ok(mut pools) = state.pools.lock() {
                if let PoolSet::Manager(manager) = &mut *pools {
                    reclaimed += manager.reclaim_empty_pools();
                }
            }
        }
        reclaimed
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PoolingStats {
        self.counters.snapshot()
    }

    /// Full diagnostic report.
    pub fn report(&self) -> EngineReport {
        EngineReport {
            stats: self.stats(),
            host_pool_count: self.pool_count_for(&self.host),
            device_pool_count: self.pool_count_for(&self.device_mem),
            aggregator_pool_count: self
                .aggregator
                .as_ref()
                .and_then(|a| a.lock().ok().map(|a| a.pool_count()))
                .unwrap_or(0),
            host_reuse_entries: self.host.reuse.len(),
            device_reuse_entries: self.device_mem.reuse.len(),
            budget_active: self.device.budget().active(),
            budget_max: self.device.budget().max_pools(),
        }
    }

    /// Number of active pools for a memory type.
    pub fn pool_count(&self, memory_type: MemoryType) -> usize {
        match self.state_for(memory_type) {
            Some(state) => self.pool_count_for(state),
            None => 0,
        }
    }

    // ---- internals ------------------------------------------------------

    fn states(&self) -> impl Iterator<Item = &MemoryTypeState> {
        std::iter::once(&self.host).chain(std::iter::once(&self.device_mem))
    }

    fn state_for(&self, memory_type: MemoryType) -> Option<&MemoryTypeState> {
        match memory_type {
            MemoryType::Host => Some(&self.host),
            MemoryType::Device => Some(&self.device_mem),
            MemoryType::Shared => None,
        }
    }

    fn pool_count_for(&self, state: &MemoryTypeState) -> usize {
        match state.pools.lock() {
            Ok(pools) => match &*pools {
                PoolSet::Single { pool, .. } => usize::from(pool.is_some()),
                PoolSet::Manager(manager) => manager.pool_count(),
            },
            Err(_) => 0,
        }
    }

    /// Requests carrying per-allocation metadata cannot recycle a cached
    /// allocation verbatim.
    fn reusable_request(props: &AllocationProperties) -> bool {
        !props.export_requested && !props.use_host_ptr && !props.imported
    }

    fn pooled_allocate(
        &self,
        state: &MemoryTypeState,
        size: u64,
        props: &AllocationProperties,
    ) -> Option<DeviceAddress> {
        let mut pools = state.pools.lock().ok()?;
        match &mut *pools {
            PoolSet::Manager(manager) => manager.allocate(size, props),
            PoolSet::Single { pool, failed } => {
                // Requests the pool would refuse anyway must not trigger
                // its lazy creation
                if size > self.config.pooling_threshold
                    || props.export_requested
                    || props.use_host_ptr
                    || props.compression != crate::backend::CompressionMode::Default
                {
                    return None;
                }
                if pool.is_none() {
                    if *failed {
                        return None;
                    }
                    let info = single_pool_info(
                        state.memory_type,
                        self.config.pooling_threshold,
                        self.config.single_pool_size,
                    );
                    match SubAllocationPool::try_create(
                        Arc::clone(&self.backend),
                        self.caps.as_ref(),
                        info,
                        Arc::clone(self.device.budget()),
                        self.policy.track_residency,
                    ) {
                        Some(created) => *pool = Some(created),
                        None => {
                            // A pool that failed to reserve its backing is
                            // never attempted or queried again
                            *failed = true;
                            return None;
                        }
                    }
                }
                pool.as_mut()?.allocate(size, props)
            }
        }
    }

    /// Reserve from the raw allocator; under device memory pressure trim
    /// the reuse caches and retry once before surfacing the failure.
    fn reserve_with_pressure_relief(
        &self,
        size: u64,
        props: &AllocationProperties,
    ) -> PoolResult<MemoryRecord> {
        let mut request = ReserveRequest::new(size, props.alignment, props.memory_type)
            .with_flags(props.flags);
        request.compression = props.compression;

        let reserved = match self.backend.reserve(request) {
            Ok(record) => Ok(record),
            Err(first_err) => {
                let trimmed = self.trim_caches();
                if trimmed == 0 {
                    return Err(first_err);
                }
                debug!(trimmed, "retrying reservation after cache trim");
                self.backend.reserve(request)
            }
        };

        // Provenance travels with the record; the reuse cache rejects
        // imported and internal allocations by it
        reserved.map(|mut record| {
            record.imported = props.imported;
            record.internal = props.internal;
            record
        })
    }

    fn track_unpooled(&self, record: MemoryRecord, requested: u64) -> PoolResult<()> {
        let mut unpooled = self.unpooled.lock()?;
        trace!(base = %record.base, size = record.size, requested, "tracking unpooled allocation");
        unpooled.insert(record.base, UnpooledEntry { record, requested });
        Ok(())
    }

    fn with_containing_pool<T>(
        &self,
        addr: DeviceAddress,
        f: impl Fn(&SubAllocationPool) -> T,
    ) -> Option<T> {
        for state in self.states() {
            if let Ok(pools) = state.pools.lock() {
                match &*pools {
                    PoolSet::Single {
                        pool: Some(pool), ..
                    } if pool.is_in_pool(addr) => return Some(f(pool)),
                    PoolSet::Manager(manager) => {
                        if let Some(pool) = manager.pool_containing(addr) {
                            return Some(f(pool));
                        }
                    }
                    _ => {}
                }
            }
        }
        None
    }

    fn record_for(&self, addr: DeviceAddress) -> Option<MemoryRecord> {
        {
            let unpooled = self.unpooled.lock().ok()?;
            if let Some((_, entry)) = unpooled.range(..=addr).next_back() {
                if entry.record.contains(addr) {
                    return Some(entry.record.clone());
                }
            }
        }
        self.backend.query_record(addr)
    }

    fn release_unpooled(&self) {
        if let Ok(mut unpooled) = self.unpooled.lock() {
            for (_, entry) in std::mem::take(&mut *unpooled) {
                self.backend.release(entry.record);
            }
        }
    }
}

impl Drop for PoolingEngine {
    fn drop(&mut self) {
        self.release_unpooled();
        // Pools, the aggregator, and per-owner caches clean up in their own
        // Drop impls; device-shared caches outlive the engine by design
    }
}
