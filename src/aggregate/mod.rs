//! Small-buffer aggregation
//!
//! Creating a dedicated backing allocation per tiny buffer object wastes
//! both time and address space. [`BufferAggregator`] packs small buffers
//! into shared main-storage allocations and keeps the IPC story intact by
//! exporting storage handles with per-buffer offsets.

pub mod aggregator;
pub mod buffer;

pub use aggregator::{AggregatorConfig, BufferAggregator};
pub use buffer::{OwnerInfo, PackedBuffer};
