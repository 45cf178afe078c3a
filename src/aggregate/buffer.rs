//! Packed buffer handles
//!
//! A packed buffer is a small user-visible buffer object living inside an
//! aggregator's main-storage allocation. The handle carries only the
//! location bookkeeping; ownership of the bytes stays with the aggregator.

use crate::backend::{AllocationId, DeviceAddress};

/// Handle to one small buffer packed into a main-storage allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedBuffer {
    /// Back-reference to the main-storage allocation
    pub storage_id: AllocationId,
    /// Address of this buffer's first byte
    pub addr: DeviceAddress,
    /// Byte offset inside the main storage (IPC reconstruction needs this)
    pub offset: u64,
    /// Requested size in bytes
    pub size: u64,
}

/// Owner-context attributes consulted by the aggregation feature gate.
#[derive(Debug, Clone, Copy)]
pub struct OwnerInfo {
    /// Number of devices visible to the owner context
    pub device_count: u32,
    /// Explicitly force aggregation for multi-device owners
    pub force_aggregation: bool,
    /// Application-compatibility override disabling aggregation
    pub app_compat_disable: bool,
}

impl OwnerInfo {
    pub fn single_device() -> Self {
        OwnerInfo {
            device_count: 1,
            force_aggregation: false,
            app_compat_disable: false,
        }
    }

    pub fn multi_device(device_count: u32) -> Self {
        OwnerInfo {
            device_count,
            force_aggregation: false,
            app_compat_disable: false,
        }
    }

    pub fn with_force_aggregation(mut self, force: bool) -> Self {
        self.force_aggregation = force;
        self
    }

    pub fn with_app_compat_disable(mut self, disable: bool) -> Self {
        self.app_compat_disable = disable;
        self
    }
}
