//! Sub-allocation pool
//!
//! One pool owns one backing allocation reserved from the raw allocator and
//! serves size-class requests out of it through a [`ChunkAllocator`].
//! Callers receive plain addresses into the backing range; the pool keeps
//! ownership and every free must come back through it.
//!
//! A pool refuses requests that need per-allocation metadata the shared
//! backing cannot carry: external-memory export and non-default compression.
//! The caller falls back to a dedicated allocation in those cases.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::backend::{
    AllocationProperties, DeviceAddress, MemoryBackend, MemoryRecord, PlatformCapabilities,
    ReserveRequest,
};
use crate::chunk::ChunkAllocator;
use crate::error::{PoolResult, UnipoolError};
use crate::pool::budget::DevicePoolBudget;
use crate::pool::info::PoolInfo;

/// A pool serving one size class from a single backing reservation.
#[derive(Debug)]
pub struct SubAllocationPool {
    info: PoolInfo,
    backing: MemoryRecord,
    chunks: ChunkAllocator,
    backend: Arc<dyn MemoryBackend>,
    budget: Arc<DevicePoolBudget>,
    track_residency: bool,
    /// Whether a residency call for the backing allocation is outstanding
    resident: bool,
    /// Cross-device allocations created against the backing memory;
    /// released during cleanup, before the backing itself
    peers: Vec<MemoryRecord>,
    initialized: bool,
}

impl SubAllocationPool {
    /// Reserve backing memory and build a pool for `info`'s size class.
    ///
    /// Returns `None` without surfacing an error when pooling is not
    /// available for this request: the platform does not support pooling for
    /// the memory type, a debugger is attached (debuggers need one-to-one
    /// address-to-allocation mapping), the device pool ceiling is reached,
    /// or the raw allocator cannot reserve the backing memory. The caller
    /// proceeds with an unpooled allocation.
    pub fn try_create(
        backend: Arc<dyn MemoryBackend>,
        caps: &dyn PlatformCapabilities,
        info: PoolInfo,
        budget: Arc<DevicePoolBudget>,
        track_residency: bool,
    ) -> Option<Self> {
        if caps.debugger_attached() {
            debug!("pooling disabled: debugger attached");
            return None;
        }
        if !caps.pooling_supported(info.memory_type) {
            debug!(memory_type = %info.memory_type, "pooling not supported on this platform");
            return None;
        }
        if !budget.try_acquire() {
            debug!(
                active = budget.active(),
                max = budget.max_pools(),
                "pool ceiling reached"
            );
            return None;
        }

        let mut request = ReserveRequest::new(info.pool_size, 0, info.memory_type);
        if let Some(mask) = info.flags_mask {
            request = request.with_flags(mask);
        }

        let backing = match backend.reserve(request) {
            Ok(record) => record,
            Err(err) => {
                budget.release();
                debug!(error = %err, "pool backing reservation failed");
                return None;
            }
        };

        let chunks = match ChunkAllocator::new(info.pool_size) {
            Ok(chunks) => chunks,
            Err(err) => {
                backend.release(backing);
                budget.release();
                debug!(error = %err, "chunk allocator rejected pool size");
                return None;
            }
        };

        info!(
            base = %backing.base,
            size = info.pool_size,
            memory_type = %info.memory_type,
            min = info.min_serviced_size,
            max = info.max_serviced_size,
            "sub-allocation pool created"
        );

        Some(SubAllocationPool {
            info,
            backing,
            chunks,
            backend,
            budget,
            track_residency,
            resident: false,
            peers: Vec::new(),
            initialized: true,
        })
    }

    /// The size class this pool services.
    pub fn info(&self) -> &PoolInfo {
        &self.info
    }

    /// Membership test: does `addr` point into a live sub-allocation?
    pub fn is_in_pool(&self, addr: DeviceAddress) -> bool {
        if !self.initialized || !self.backing.contains(addr) {
            return false;
        }
        let offset = addr.0 - self.backing.base.0;
        self.chunks.range_containing(offset).is_some()
    }

    /// Whether `addr` falls anywhere inside the backing byte range,
    /// regardless of sub-allocation liveness.
    pub fn owns_range(&self, addr: DeviceAddress) -> bool {
        self.initialized && self.backing.contains(addr)
    }

    /// Allocate from the pool.
    ///
    /// Refused (returns `None`) for requests the pool cannot represent:
    /// export requests, compression modes other than the pool's fixed mode,
    /// flags outside the pool's mask, sizes outside the serviced class, or
    /// plain exhaustion.
    pub fn allocate(&mut self, size: u64, props: &AllocationProperties) -> Option<DeviceAddress> {
        if !self.initialized {
            return None;
        }
        if props.export_requested {
            trace!(size, "export requested, not poolable");
            return None;
        }
        if props.compression != self.backing.compression {
            trace!(size, "compression mode differs from pool, not poolable");
            return None;
        }
        if !self.info.accepts_flags(&props.flags) || !self.info.services(size) {
            return None;
        }

        let offset = self.chunks.allocate(size, props.alignment)?;
        let addr = self.backing.base.add(offset);

        if self.track_residency && !self.resident {
            // First live sub-allocation makes the whole backing resident;
            // later ones skip the call.
            match self.backend.make_resident(&self.backing) {
                Ok(()) => self.resident = true,
                Err(err) => warn!(error = %err, "make_resident failed for pool backing"),
            }
        }

        trace!(addr = %addr, size, used = self.chunks.used_size(), "pooled allocation");
        Some(addr)
    }

    /// Return a sub-allocation to the pool.
    ///
    /// `InvalidAddress` when `addr` is inside the backing range but not a
    /// live sub-allocation (including double frees); `AddressNotFound` when
    /// the address is outside the pool entirely.
    pub fn free(&mut self, addr: DeviceAddress) -> PoolResult<u64> {
        if !self.initialized || !self.backing.contains(addr) {
            return Err(UnipoolError::AddressNotFound(addr));
        }
        let offset = addr.0 - self.backing.base.0;
        let size = self
            .chunks
            .free(offset)
            .map_err(|_| UnipoolError::InvalidAddress(addr))?;

        if self.track_residency && self.resident && self.chunks.is_empty() {
            // Eviction is forwarded only when the pool drains completely
            if let Err(err) = self.backend.evict(&self.backing) {
                warn!(error = %err, "evict failed for pool backing");
            }
            self.resident = false;
        }

        trace!(addr = %addr, size, "pooled free");
        Ok(size)
    }

    /// Base address of the live sub-allocation containing `addr`.
    pub fn pooled_allocation_base(&self, addr: DeviceAddress) -> Option<DeviceAddress> {
        let (start, _) = self.live_range_for(addr)?;
        Some(self.backing.base.add(start))
    }

    /// Size of the live sub-allocation containing `addr`.
    pub fn pooled_allocation_size(&self, addr: DeviceAddress) -> Option<u64> {
        let (_, size) = self.live_range_for(addr)?;
        Some(size)
    }

    /// Byte offset of `addr` inside the pool's backing allocation, for IPC
    /// handle export. Only live sub-allocation addresses resolve.
    pub fn offset_in_pool(&self, addr: DeviceAddress) -> Option<u64> {
        self.live_range_for(addr)?;
        addr.offset_from(self.backing.base)
    }

    /// The backing allocation record (for residency and IPC bridging).
    pub fn backing(&self) -> &MemoryRecord {
        &self.backing
    }

    /// Register a cross-device peer allocation created against this pool's
    /// backing memory. Peers are released during cleanup.
    pub fn register_peer(&mut self, peer: MemoryRecord) {
        self.peers.push(peer);
    }

    /// Is residency tracking enabled for this pool?
    pub fn is_tracking_residency(&self) -> bool {
        self.track_residency
    }

    /// Bytes currently allocated out of the pool.
    pub fn used_size(&self) -> u64 {
        self.chunks.used_size()
    }

    /// Number of live sub-allocations.
    pub fn live_count(&self) -> usize {
        self.chunks.live_count()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Release peer allocations, then the backing allocation. Idempotent.
    pub fn cleanup(&mut self) {
        if !self.initialized {
            return;
        }
        self.initialized = false;

        for peer in self.peers.drain(..) {
            self.backend.release(peer);
        }
        if self.resident {
            if let Err(err) = self.backend.evict(&self.backing) {
                warn!(error = %err, "evict during pool cleanup failed");
            }
            self.resident = false;
        }
        self.backend.release(self.backing.clone());
        self.budget.release();
        info!(base = %self.backing.base, "sub-allocation pool cleaned up");
    }

    fn live_range_for(&self, addr: DeviceAddress) -> Option<(u64, u64)> {
        if !self.initialized || !self.backing.contains(addr) {
            return None;
        }
        let offset = addr.0 - self.backing.base.0;
        self.chunks.range_containing(offset)
    }
}

impl Drop for SubAllocationPool {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CompressionMode, MemoryType, SimBackend, StaticCapabilities};

    fn test_pool(backend: &Arc<SimBackend>) -> SubAllocationPool {
        let caps = StaticCapabilities::all_supported();
        let budget = Arc::new(DevicePoolBudget::new(4));
        let info = PoolInfo::new(64 * 1024, 0, 4096, MemoryType::Device);
        SubAllocationPool::try_create(
            Arc::clone(backend) as Arc<dyn MemoryBackend>,
            &caps,
            info,
            budget,
            false,
        )
        .expect("pool creation failed")
    }

    fn device_props() -> AllocationProperties {
        AllocationProperties::new(MemoryType::Device)
    }

    #[test]
    fn test_membership_until_free() {
        let backend = Arc::new(SimBackend::new());
        let mut pool = test_pool(&backend);

        let addr = pool.allocate(100, &device_props()).unwrap();
        assert!(pool.is_in_pool(addr));
        assert!(pool.is_in_pool(addr.add(99)));

        pool.free(addr).unwrap();
        assert!(!pool.is_in_pool(addr));
        assert!(pool.owns_range(addr));
    }

    #[test]
    fn test_refuses_export_and_compression() {
        let backend = Arc::new(SimBackend::new());
        let mut pool = test_pool(&backend);

        let export = device_props().with_export_requested(true);
        assert!(pool.allocate(100, &export).is_none());

        let compressed = device_props().with_compression(CompressionMode::Compressed);
        assert!(pool.allocate(100, &compressed).is_none());

        assert!(pool.allocate(100, &device_props()).is_some());
    }

    #[test]
    fn test_refuses_out_of_class_sizes() {
        let backend = Arc::new(SimBackend::new());
        let mut pool = test_pool(&backend);

        assert!(pool.allocate(0, &device_props()).is_none());
        assert!(pool.allocate(4096, &device_props()).is_none());
        assert!(pool.allocate(4095, &device_props()).is_some());
    }

    #[test]
    fn test_free_error_taxonomy() {
        let backend = Arc::new(SimBackend::new());
        let mut pool = test_pool(&backend);

        let addr = pool.allocate(256, &device_props()).unwrap();
        pool.free(addr).unwrap();

        // Second free of a pool-range address: invalid argument
        assert!(matches!(
            pool.free(addr),
            Err(UnipoolError::InvalidAddress(_))
        ));

        // Address entirely outside the pool: not found
        assert!(matches!(
            pool.free(DeviceAddress(1)),
            Err(UnipoolError::AddressNotFound(_))
        ));
    }

    #[test]
    fn test_lookup_helpers_on_dead_addresses() {
        let backend = Arc::new(SimBackend::new());
        let mut pool = test_pool(&backend);

        let addr = pool.allocate(512, &device_props()).unwrap();
        assert_eq!(pool.pooled_allocation_base(addr.add(10)), Some(addr));
        assert_eq!(pool.pooled_allocation_size(addr), Some(512));
        assert_eq!(
            pool.offset_in_pool(addr),
            addr.offset_from(pool.backing().base)
        );

        pool.free(addr).unwrap();
        // In-range but dead: empty results, never a crash
        assert_eq!(pool.pooled_allocation_base(addr), None);
        assert_eq!(pool.pooled_allocation_size(addr), None);
        assert_eq!(pool.offset_in_pool(addr), None);
    }

    #[test]
    fn test_debugger_disables_pooling() {
        let backend = Arc::new(SimBackend::new());
        let caps = StaticCapabilities::all_supported();
        caps.set_debugger_attached(true);
        let budget = Arc::new(DevicePoolBudget::new(4));
        let info = PoolInfo::new(64 * 1024, 0, 4096, MemoryType::Device);

        let pool = SubAllocationPool::try_create(
            Arc::clone(&backend) as Arc<dyn MemoryBackend>,
            &caps,
            info,
            Arc::clone(&budget),
            false,
        );
        assert!(pool.is_none());
        assert_eq!(budget.active(), 0);
    }

    #[test]
    fn test_failed_reserve_releases_budget_slot() {
        let backend = Arc::new(SimBackend::new());
        backend.fail_next_reserves(1);
        let caps = StaticCapabilities::all_supported();
        let budget = Arc::new(DevicePoolBudget::new(4));
        let info = PoolInfo::new(64 * 1024, 0, 4096, MemoryType::Device);

        let pool = SubAllocationPool::try_create(
            Arc::clone(&backend) as Arc<dyn MemoryBackend>,
            &caps,
            info,
            Arc::clone(&budget),
            false,
        );
        assert!(pool.is_none());
        assert_eq!(budget.active(), 0);
    }

    #[test]
    fn test_residency_forwarded_on_transitions_only() {
        let backend = Arc::new(SimBackend::new());
        let caps = StaticCapabilities::all_supported();
        let budget = Arc::new(DevicePoolBudget::new(4));
        let info = PoolInfo::new(64 * 1024, 0, 4096, MemoryType::Device);
        let mut pool = SubAllocationPool::try_create(
            Arc::clone(&backend) as Arc<dyn MemoryBackend>,
            &caps,
            info,
            budget,
            true,
        )
        .unwrap();
        assert!(pool.is_tracking_residency());

        let a = pool.allocate(100, &device_props()).unwrap();
        let b = pool.allocate(100, &device_props()).unwrap();
        // Only the first allocation triggers a residency call
        assert_eq!(backend.make_resident_calls(), 1);

        pool.free(a).unwrap();
        assert_eq!(backend.evict_calls(), 0);
        pool.free(b).unwrap();
        // Eviction once the pool fully drains
        assert_eq!(backend.evict_calls(), 1);
    }

    #[test]
    fn test_cleanup_releases_peers_then_backing() {
        let backend = Arc::new(SimBackend::new());
        let mut pool = test_pool(&backend);

        let peer = backend
            .reserve(ReserveRequest::new(4096, 0, MemoryType::Device))
            .unwrap();
        pool.register_peer(peer);

        assert_eq!(backend.live_allocations(), 2);
        pool.cleanup();
        assert_eq!(backend.live_allocations(), 0);

        // Idempotent
        pool.cleanup();
        assert_eq!(backend.release_calls(), 2);

        // A cleaned-up pool refuses everything
        assert!(pool.allocate(100, &device_props()).is_none());
        assert!(!pool.is_in_pool(pool.backing().base));
    }
}
