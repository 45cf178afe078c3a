//! unipool - Unified-Memory Allocation Pooling Engine
//!
//! unipool turns expensive, coarse-grained device/host memory allocations
//! into cheap fine-grained ones. It is the pooling layer of a GPU runtime's
//! memory manager: sub-allocation pools carve one backing reservation into
//! many allocations, a pools manager routes across size classes under a
//! device-wide pool budget, a reuse cache recycles whole released
//! allocations, and a buffer aggregator packs small buffer objects into few
//! backing allocations.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                 PoolingEngine                    │
//! │  reuse cache → pools → raw allocator fallback    │
//! ├──────────────┬──────────────┬────────────────────┤
//! │  ReuseCache  │ PoolsManager │  BufferAggregator  │
//! │  (size-      │  (size-class │  (small-buffer     │
//! │   sorted     │   ladder +   │   packing + IPC    │
//! │   free list) │   ceiling)   │   offsets)         │
//! ├──────────────┴──────┬───────┴────────────────────┤
//! │  SubAllocationPool  │  ChunkAllocator            │
//! └─────────────────────┴────────────────────────────┘
//!            │ MemoryBackend trait (raw allocator,
//!            ▼ residency, completion markers)
//! ```
//!
//! Every address handed out is bookkeeping into memory the engine owns;
//! callers never hold owning pointers, and all failure modes recover by
//! falling back to the unpooled allocation path.

pub mod aggregate;
pub mod backend;
pub mod chunk;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod pool;
pub mod reuse;

pub use aggregate::{AggregatorConfig, BufferAggregator, OwnerInfo, PackedBuffer};
pub use backend::{
    AllocationFlags, AllocationId, AllocationProperties, CompressionMode, DeviceAddress,
    IpcHandle, MemoryBackend, MemoryRecord, MemoryType, OsHandle, PlatformCapabilities,
    ReserveRequest, SimBackend, StaticCapabilities,
};
pub use chunk::ChunkAllocator;
pub use config::{EngineConfig, ResolvedPolicy, Toggle};
pub use engine::{
    DeviceContext, EngineReport, FreeOptions, FreeOutcome, PoolingEngine, PoolingStats,
};
pub use error::{ErrorCategory, PoolResult, UnipoolError};
pub use pool::{DevicePoolBudget, PoolInfo, PoolsManager, SubAllocationPool};
pub use reuse::{ReuseCache, ReuseCleaner, ReuseConfig};

/// Crate version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
