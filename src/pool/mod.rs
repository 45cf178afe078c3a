//! Sub-allocation pooling
//!
//! This module turns one coarse backing reservation into many fine-grained
//! allocations. [`SubAllocationPool`] serves a single size class;
//! [`PoolsManager`] routes across classes and grows the pool set under the
//! device-wide [`DevicePoolBudget`] ceiling.

pub mod budget;
pub mod info;
pub mod manager;
pub mod sub_pool;

pub use budget::DevicePoolBudget;
pub use info::{
    default_ladder, single_pool_info, validate_ladder, LadderSummary, PoolInfo,
    DEFAULT_POOLING_THRESHOLD, DEFAULT_SINGLE_POOL_SIZE,
};
pub use manager::PoolsManager;
pub use sub_pool::SubAllocationPool;
