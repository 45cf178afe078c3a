//! External collaborator seams
//!
//! The pooling engine sits between the object-handle layer above it and two
//! lower-level collaborators it does not implement: the raw allocator that
//! obtains virtual-address-backed memory from the kernel driver, and the
//! command-stream/residency subsystem that tracks device progress. Both are
//! reached through [`MemoryBackend`].
//!
//! [`SimBackend`] is a reference implementation over a synthetic address
//! space, used by the test suites, the benches, and the stress binary.

pub mod capability;
pub mod record;
pub mod sim;

pub use capability::{PlatformCapabilities, StaticCapabilities};
pub use record::{
    AllocationFlags, AllocationId, AllocationProperties, CompressionMode, DeviceAddress,
    IpcHandle, MemoryRecord, MemoryType, OsHandle, ReserveRequest,
};
pub use sim::SimBackend;

use crate::error::PoolResult;

/// The raw allocator and device-progress collaborator.
///
/// All methods are called from worker threads that also submit device work;
/// implementations must be internally synchronized. None of the completion
/// queries block: `is_completed` is a poll, and only `wait_for_completion`
/// may sleep (used by explicit blocking frees).
pub trait MemoryBackend: Send + Sync + std::fmt::Debug {
    /// Reserve a backing allocation.
    fn reserve(&self, request: ReserveRequest) -> PoolResult<MemoryRecord>;

    /// Release a backing allocation back to the kernel driver.
    fn release(&self, record: MemoryRecord);

    /// Bridge an address back to the allocation record that contains it,
    /// if the backend tracks one.
    fn query_record(&self, addr: DeviceAddress) -> Option<MemoryRecord>;

    /// Make an allocation resident for pending device work.
    fn make_resident(&self, record: &MemoryRecord) -> PoolResult<()>;

    /// Evict an allocation from device residency.
    fn evict(&self, record: &MemoryRecord) -> PoolResult<()>;

    /// Non-blocking poll: has all device work referencing this allocation
    /// completed?
    fn is_completed(&self, record: &MemoryRecord) -> bool;

    /// Block the calling thread until all device work referencing this
    /// allocation completes.
    fn wait_for_completion(&self, record: &MemoryRecord);

    /// Device memory currently available, used to derive pool-count ceilings.
    fn available_device_memory(&self) -> u64;

    /// Whether the deferred-deletion subsystem still has pending work for
    /// this memory type. Age-based cache trimming is skipped while true
    /// unless forced.
    fn has_deferred_frees(&self, memory_type: MemoryType) -> bool;

    /// Write caller-provided initial data into an allocation (the
    /// copy-from-host path of buffer creation).
    fn write_initial_data(&self, record: &MemoryRecord, offset: u64, data: &[u8])
        -> PoolResult<()>;

    /// Export an OS-level shareable handle for a backing allocation.
    fn export_handle(&self, record: &MemoryRecord) -> PoolResult<OsHandle>;
}
