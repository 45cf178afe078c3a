//! Pools manager
//!
//! Owns the active sub-allocation pools of one owner context and routes each
//! request to the size class that fits. New pools are created on demand,
//! gated by the device-wide pool budget shared across all owners; at the
//! ceiling the request returns `None` and the caller allocates unpooled.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::backend::{
    AllocationProperties, DeviceAddress, MemoryBackend, PlatformCapabilities,
};
use crate::error::{PoolResult, UnipoolError};
use crate::pool::budget::DevicePoolBudget;
use crate::pool::info::{validate_ladder, PoolInfo};
use crate::pool::sub_pool::SubAllocationPool;

/// Manager of size-classed pools for one owner context on one device.
#[derive(Debug)]
pub struct PoolsManager {
    ladder: Vec<PoolInfo>,
    pools: Vec<SubAllocationPool>,
    backend: Arc<dyn MemoryBackend>,
    caps: Arc<dyn PlatformCapabilities>,
    budget: Arc<DevicePoolBudget>,
    track_residency: bool,
}

impl PoolsManager {
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        caps: Arc<dyn PlatformCapabilities>,
        ladder: Vec<PoolInfo>,
        budget: Arc<DevicePoolBudget>,
        track_residency: bool,
    ) -> PoolResult<Self> {
        validate_ladder(&ladder)?;
        if ladder.is_empty() {
            return Err(UnipoolError::InvalidConfiguration(
                "pools manager needs at least one size class".to_string(),
            ));
        }
        Ok(PoolsManager {
            ladder,
            pools: Vec::new(),
            backend,
            caps,
            budget,
            track_residency,
        })
    }

    /// Can another pool be created under the device ceiling?
    ///
    /// Advisory only; the authoritative check is the budget's
    /// compare-and-increment at creation time.
    pub fn can_add_pool(&self) -> bool {
        !self.budget.at_ceiling()
    }

    /// Is this request eligible for pooling at all?
    pub fn can_be_pooled(&self, size: u64, props: &AllocationProperties) -> bool {
        if size == 0 || props.export_requested || props.use_host_ptr {
            return false;
        }
        self.ladder
            .iter()
            .any(|info| info.services(size) && info.accepts_flags(&props.flags))
    }

    /// Route an allocation to a pool of the matching size class, creating a
    /// new pool when the class is full and the device budget allows it.
    pub fn allocate(&mut self, size: u64, props: &AllocationProperties) -> Option<DeviceAddress> {
        if !self.can_be_pooled(size, props) {
            return None;
        }
        let info = *self
            .ladder
            .iter()
            .find(|info| info.services(size) && info.accepts_flags(&props.flags))?;

        for pool in &mut self.pools {
            if *pool.info() == info {
                if let Some(addr) = pool.allocate(size, props) {
                    return Some(addr);
                }
            }
        }

        // Every pool of this class is exhausted (or none exists yet):
        // create one and retry once.
        let mut pool = SubAllocationPool::try_create(
            Arc::clone(&self.backend),
            self.caps.as_ref(),
            info,
            Arc::clone(&self.budget),
            self.track_residency,
        )?;
        let addr = pool.allocate(size, props);
        self.pools.push(pool);
        if addr.is_none() {
            debug!(size, "freshly created pool rejected the request");
        }
        addr
    }

    /// Free a pooled address, routing to the pool that owns its range.
    pub fn free(&mut self, addr: DeviceAddress) -> PoolResult<u64> {
        for pool in &mut self.pools {
            if pool.owns_range(addr) {
                return pool.free(addr);
            }
        }
        Err(UnipoolError::AddressNotFound(addr))
    }

    /// The pool holding a live sub-allocation at `addr`, if any.
    pub fn pool_containing(&self, addr: DeviceAddress) -> Option<&SubAllocationPool> {
        self.pools.iter().find(|pool| pool.is_in_pool(addr))
    }

    /// Does any pool's backing range cover `addr`, live or not?
    pub fn owns_range(&self, addr: DeviceAddress) -> bool {
        self.pools.iter().any(|pool| pool.owns_range(addr))
    }

    /// Membership across all active pools.
    pub fn is_in_pool(&self, addr: DeviceAddress) -> bool {
        self.pool_containing(addr).is_some()
    }

    pub fn pooled_allocation_base(&self, addr: DeviceAddress) -> Option<DeviceAddress> {
        self.pool_containing(addr)?.pooled_allocation_base(addr)
    }

    pub fn pooled_allocation_size(&self, addr: DeviceAddress) -> Option<u64> {
        self.pool_containing(addr)?.pooled_allocation_size(addr)
    }

    pub fn offset_in_pool(&self, addr: DeviceAddress) -> Option<u64> {
        self.pool_containing(addr)?.offset_in_pool(addr)
    }

    /// Number of active pools owned by this manager.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Total bytes currently allocated across all pools.
    pub fn used_size(&self) -> u64 {
        self.pools.iter().map(|p| p.used_size()).sum()
    }

    /// Drop empty pools beyond the first of each size class, returning
    /// their budget slots to the device.
    pub fn reclaim_empty_pools(&mut self) -> usize {
        let mut seen_class: Vec<PoolInfo> = Vec::new();
        let before = self.pools.len();
        self.pools.retain_mut(|pool| {
            if !pool.is_empty() {
                return true;
            }
            if seen_class.contains(pool.info()) {
                pool.cleanup();
                false
            } else {
                seen_class.push(*pool.info());
                true
            }
        });
        let reclaimed = before - self.pools.len();
        if reclaimed > 0 {
            trace!(reclaimed, remaining = self.pools.len(), "reclaimed empty pools");
        }
        reclaimed
    }

    /// Tear down every pool. Idempotent.
    pub fn cleanup(&mut self) {
        for pool in &mut self.pools {
            pool.cleanup();
        }
        self.pools.clear();
    }
}

impl Drop for PoolsManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryType, SimBackend, StaticCapabilities};
    use crate::pool::info::default_ladder;

    fn manager_with_budget(
        backend: &Arc<SimBackend>,
        max_pools: u32,
    ) -> (PoolsManager, Arc<DevicePoolBudget>) {
        let budget = Arc::new(DevicePoolBudget::new(max_pools));
        let manager = PoolsManager::new(
            Arc::clone(backend) as Arc<dyn MemoryBackend>,
            Arc::new(StaticCapabilities::all_supported()),
            default_ladder(MemoryType::Device),
            Arc::clone(&budget),
            false,
        )
        .unwrap();
        (manager, budget)
    }

    fn props() -> AllocationProperties {
        AllocationProperties::new(MemoryType::Device)
    }

    #[test]
    fn test_routes_by_size_class() {
        let backend = Arc::new(SimBackend::new());
        let (mut manager, _) = manager_with_budget(&backend, 8);

        let small = manager.allocate(100, &props()).unwrap();
        let medium = manager.allocate(16 * 1024, &props()).unwrap();
        assert_eq!(manager.pool_count(), 2);

        let small2 = manager.allocate(200, &props()).unwrap();
        assert_eq!(manager.pool_count(), 2);

        assert!(manager.is_in_pool(small));
        assert!(manager.is_in_pool(medium));
        assert!(manager.is_in_pool(small2));
    }

    #[test]
    fn test_can_be_pooled_exclusions() {
        let backend = Arc::new(SimBackend::new());
        let (manager, _) = manager_with_budget(&backend, 8);

        assert!(!manager.can_be_pooled(0, &props()));
        assert!(!manager.can_be_pooled(2 * 1024 * 1024, &props()));
        assert!(!manager.can_be_pooled(100, &props().with_export_requested(true)));
        assert!(manager.can_be_pooled(100, &props()));
    }

    #[test]
    fn test_ceiling_rejects_new_pools() {
        let backend = Arc::new(SimBackend::new());
        let (mut manager, budget) = manager_with_budget(&backend, 1);

        let addr = manager.allocate(100, &props()).unwrap();
        assert_eq!(manager.pool_count(), 1);
        assert!(!manager.can_add_pool());

        // A different size class would need a second pool: refused
        assert!(manager.allocate(16 * 1024, &props()).is_none());
        assert_eq!(manager.pool_count(), 1);
        assert_eq!(budget.active(), 1);

        manager.free(addr).unwrap();
    }

    #[test]
    fn test_free_routes_to_owning_pool() {
        let backend = Arc::new(SimBackend::new());
        let (mut manager, _) = manager_with_budget(&backend, 8);

        let a = manager.allocate(100, &props()).unwrap();
        let b = manager.allocate(32 * 1024, &props()).unwrap();

        assert_eq!(manager.free(a).unwrap(), 100);
        assert_eq!(manager.free(b).unwrap(), 32 * 1024);
        assert!(matches!(
            manager.free(DeviceAddress(3)),
            Err(UnipoolError::AddressNotFound(_))
        ));
    }

    #[test]
    fn test_exhausted_class_grows_and_retries_once() {
        let backend = Arc::new(SimBackend::new());
        let budget = Arc::new(DevicePoolBudget::new(4));
        // One tiny class: 8 KiB pools, requests up to 4 KiB
        let ladder = vec![PoolInfo::new(8 * 1024, 0, 4 * 1024 + 1, MemoryType::Device)];
        let mut manager = PoolsManager::new(
            Arc::clone(&backend) as Arc<dyn MemoryBackend>,
            Arc::new(StaticCapabilities::all_supported()),
            ladder,
            budget,
            false,
        )
        .unwrap();

        let _a = manager.allocate(4096, &props()).unwrap();
        let _b = manager.allocate(4096, &props()).unwrap();
        assert_eq!(manager.pool_count(), 1);

        // Pool 0 is full: a second pool is created for the class
        let _c = manager.allocate(4096, &props()).unwrap();
        assert_eq!(manager.pool_count(), 2);
    }

    #[test]
    fn test_reclaim_empty_pools_keeps_one_per_class() {
        let backend = Arc::new(SimBackend::new());
        let budget = Arc::new(DevicePoolBudget::new(4));
        let ladder = vec![PoolInfo::new(8 * 1024, 0, 4 * 1024 + 1, MemoryType::Device)];
        let mut manager = PoolsManager::new(
            Arc::clone(&backend) as Arc<dyn MemoryBackend>,
            Arc::new(StaticCapabilities::all_supported()),
            ladder,
            Arc::clone(&budget),
            false,
        )
        .unwrap();

        let a = manager.allocate(4096, &props()).unwrap();
        let b = manager.allocate(4096, &props()).unwrap();
        let c = manager.allocate(4096, &props()).unwrap();
        assert_eq!(manager.pool_count(), 2);

        manager.free(a).unwrap();
        manager.free(b).unwrap();
        manager.free(c).unwrap();

        assert_eq!(manager.reclaim_empty_pools(), 1);
        assert_eq!(manager.pool_count(), 1);
        assert_eq!(budget.active(), 1);
    }

    #[test]
    fn test_cleanup_releases_everything() {
        let backend = Arc::new(SimBackend::new());
        let (mut manager, budget) = manager_with_budget(&backend, 8);

        manager.allocate(100, &props()).unwrap();
        manager.allocate(16 * 1024, &props()).unwrap();
        assert_eq!(budget.active(), 2);

        manager.cleanup();
        assert_eq!(budget.active(), 0);
        assert_eq!(backend.live_allocations(), 0);
        assert_eq!(manager.pool_count(), 0);
    }
}
