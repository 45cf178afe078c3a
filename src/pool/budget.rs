//! Device-wide pool-count budget
//!
//! One budget instance is attached to each device and shared by every owner
//! context allocating on it. Pool creation is gated by compare-and-increment
//! so the ceiling holds under concurrent context creation; check-then-act
//! would let two owners race past it.

use std::sync::atomic::{AtomicU32, Ordering};

/// Shared pool-count ceiling for one device.
#[derive(Debug)]
pub struct DevicePoolBudget {
    max_pools: u32,
    active: AtomicU32,
}

impl DevicePoolBudget {
    pub fn new(max_pools: u32) -> Self {
        DevicePoolBudget {
            max_pools: max_pools.max(1),
            active: AtomicU32::new(0),
        }
    }

    /// Derive the ceiling from available device memory: one pool's worth of
    /// memory buys one pool slot, with a floor of 1.
    pub fn for_device(available_device_memory: u64, pool_size: u64) -> Self {
        let max_pools = if pool_size == 0 {
            1
        } else {
            (available_device_memory / pool_size).min(u32::MAX as u64) as u32
        };
        Self::new(max_pools)
    }

    /// Atomically claim one pool slot. Returns false at the ceiling.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.max_pools {
                return false;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return a slot claimed by `try_acquire`.
    pub fn release(&self) {
        let previous = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "pool budget released below zero");
    }

    pub fn active(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    pub fn max_pools(&self) -> u32 {
        self.max_pools
    }

    pub fn at_ceiling(&self) -> bool {
        self.active() >= self.max_pools
    }
}
