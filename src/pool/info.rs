//! Pool size-class descriptors
//!
//! A device's pooling behavior is described by a ladder of [`PoolInfo`]
//! values: sorted, non-overlapping `[min, max)` size ranges, each naming the
//! backing-allocation size used for pools of that class.

use serde::{Deserialize, Serialize};

use crate::backend::{AllocationFlags, MemoryType};
use crate::error::{PoolResult, UnipoolError};

/// Immutable descriptor of one pool size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolInfo {
    /// Size of the backing allocation each pool instance reserves
    pub pool_size: u64,
    /// Smallest request this class services (inclusive)
    pub min_serviced_size: u64,
    /// Largest request this class services (exclusive)
    pub max_serviced_size: u64,
    /// Memory type the pool's backing allocation uses
    pub memory_type: MemoryType,
    /// Flags the pool's requests must match exactly, when set
    pub flags_mask: Option<AllocationFlags>,
}

impl PoolInfo {
    pub fn new(
        pool_size: u64,
        min_serviced_size: u64,
        max_serviced_size: u64,
        memory_type: MemoryType,
    ) -> Self {
        PoolInfo {
            pool_size,
            min_serviced_size,
            max_serviced_size,
            memory_type,
            flags_mask: None,
        }
    }

    pub fn with_flags_mask(mut self, mask: AllocationFlags) -> Self {
        self.flags_mask = Some(mask);
        self
    }

    /// Does this class service a request of `size` bytes?
    pub fn services(&self, size: u64) -> bool {
        size >= self.min_serviced_size && size < self.max_serviced_size
    }

    /// Does this class accept the request's flags?
    pub fn accepts_flags(&self, flags: &AllocationFlags) -> bool {
        match &self.flags_mask {
            Some(mask) => mask.matches(flags),
            None => true,
        }
    }
}

/// Validate a size-class ladder: ascending, non-overlapping, non-empty
/// ranges, each servicing only requests its pool can actually hold.
pub fn validate_ladder(ladder: &[PoolInfo]) -> PoolResult<()> {
    for (i, info) in ladder.iter().enumerate() {
        if info.min_serviced_size >= info.max_serviced_size {
            return Err(UnipoolError::InvalidConfiguration(format!(
                "pool info {} has empty serviced range [{}, {})",
                i, info.min_serviced_size, info.max_serviced_size
            )));
        }
        if info.max_serviced_size > info.pool_size {
            return Err(UnipoolError::InvalidConfiguration(format!(
                "pool info {} services up to {} bytes but its pool is only {} bytes",
                i,
                info.max_serviced_size - 1,
                info.pool_size
            )));
        }
        if i > 0 && ladder[i - 1].max_serviced_size > info.min_serviced_size {
            return Err(UnipoolError::InvalidConfiguration(format!(
                "pool infos {} and {} overlap",
                i - 1,
                i
            )));
        }
    }
    Ok(())
}

/// Default small-buffer threshold: requests past this never pool.
pub const DEFAULT_POOLING_THRESHOLD: u64 = 1024 * 1024;

/// Default backing size for single-pool mode.
pub const DEFAULT_SINGLE_POOL_SIZE: u64 = 2 * 1024 * 1024;

/// Size-class ladder used by the pools manager when the embedder does not
/// supply one. Classes mirror the request-size distribution of typical
/// compute workloads: many tiny transfers, fewer mid-size staging buffers.
pub fn default_ladder(memory_type: MemoryType) -> Vec<PoolInfo> {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    vec![
        PoolInfo::new(2 * MIB, 0, 4 * KIB, memory_type),
        PoolInfo::new(16 * MIB, 4 * KIB, 64 * KIB, memory_type),
        PoolInfo::new(64 * MIB, 64 * KIB, MIB, memory_type),
    ]
}

/// Single-pool-mode descriptor: one class servicing everything up to the
/// pooling threshold.
pub fn single_pool_info(memory_type: MemoryType, threshold: u64, pool_size: u64) -> PoolInfo {
    PoolInfo::new(pool_size, 0, threshold + 1, memory_type)
}

/// Serializable view of a ladder for config dumps.
#[derive(Debug, Serialize, Deserialize)]
pub struct LadderSummary {
    pub classes: Vec<(u64, u64, u64)>,
}

impl LadderSummary {
    pub fn from_ladder(ladder: &[PoolInfo]) -> Self {
        LadderSummary {
            classes: ladder
                .iter()
                .map(|info| (info.pool_size, info.min_serviced_size, info.max_serviced_size))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_services_is_half_open() {
        let info = PoolInfo::new(4096, 64, 1024, MemoryType::Device);
        assert!(!info.services(63));
        assert!(info.services(64));
        assert!(info.services(1023));
        assert!(!info.services(1024));
    }

    #[test]
    fn test_flags_mask() {
        let wc = AllocationFlags {
            write_combined: true,
            ..Default::default()
        };
        let info = PoolInfo::new(4096, 0, 1024, MemoryType::Host).with_flags_mask(wc);

        assert!(info.accepts_flags(&wc));
        assert!(!info.accepts_flags(&AllocationFlags::default()));

        let unmasked = PoolInfo::new(4096, 0, 1024, MemoryType::Host);
        assert!(unmasked.accepts_flags(&wc));
    }

    #[test]
    fn test_default_ladder_is_valid() {
        let ladder = default_ladder(MemoryType::Device);
        validate_ladder(&ladder).unwrap();

        // Contiguous coverage from 0 to 1 MiB
        assert_eq!(ladder[0].min_serviced_size, 0);
        for window in ladder.windows(2) {
            assert_eq!(window[0].max_serviced_size, window[1].min_serviced_size);
        }
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let bad = vec![
            PoolInfo::new(4096, 0, 512, MemoryType::Device),
            PoolInfo::new(4096, 256, 1024, MemoryType::Device),
        ];
        assert!(validate_ladder(&bad).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_range() {
        let bad = vec![PoolInfo::new(4096, 512, 512, MemoryType::Device)];
        assert!(validate_ladder(&bad).is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_service_range() {
        let bad = vec![PoolInfo::new(4096, 0, 8192, MemoryType::Device)];
        assert!(validate_ladder(&bad).is_err());
    }

    #[test]
    fn test_single_pool_info_covers_threshold() {
        let info = single_pool_info(MemoryType::Host, 1024 * 1024, 2 * 1024 * 1024);
        assert!(info.services(1));
        assert!(info.services(1024 * 1024));
        assert!(!info.services(1024 * 1024 + 1));
    }
}
