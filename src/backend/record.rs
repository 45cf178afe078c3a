//! Allocation records and address types
//!
//! The pooling engine never dereferences the memory it manages; every
//! allocation is bookkeeping over a virtual-address space owned by the raw
//! allocator. Addresses are typed `u64` values and the descriptor record for
//! each backing allocation is a plain data handle the backend can resolve.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A virtual address inside the unified-memory address space.
///
/// Addresses are handles into memory owned by a pool or by the raw
/// allocator; holding one confers no ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeviceAddress(pub u64);

impl DeviceAddress {
    /// The null address
    pub const NULL: DeviceAddress = DeviceAddress(0);

    /// Offset this address forward by `bytes`
    pub fn add(self, bytes: u64) -> DeviceAddress {
        DeviceAddress(self.0 + bytes)
    }

    /// Byte distance from `base` to this address.
    ///
    /// Returns `None` if this address precedes `base`.
    pub fn offset_from(self, base: DeviceAddress) -> Option<u64> {
        self.0.checked_sub(base.0)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Process-unique identifier for a backing allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub u64);

static NEXT_ALLOCATION_ID: AtomicU64 = AtomicU64::new(1);

impl AllocationId {
    /// Mint a fresh process-unique identifier.
    ///
    /// Used by backends at reserve time and by the reuse cache when its
    /// consumers track allocations by stable identifier and a recycled
    /// allocation must appear as a new one.
    pub fn fresh() -> AllocationId {
        AllocationId(NEXT_ALLOCATION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc#{}", self.0)
    }
}

/// Where an allocation's backing memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum MemoryType {
    /// Host (system) memory accessible to the device
    Host,
    /// Device-local memory
    Device,
    /// Migratable shared memory
    Shared,
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryType::Host => write!(f, "host"),
            MemoryType::Device => write!(f, "device"),
            MemoryType::Shared => write!(f, "shared"),
        }
    }
}

/// Access flags carried by an allocation.
///
/// A pool configured with a flags mask only services requests whose flags
/// match the mask exactly; mixing cacheability attributes inside one backing
/// allocation is not representable in page tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct AllocationFlags {
    pub read_only: bool,
    pub write_only: bool,
    pub write_combined: bool,
}

impl AllocationFlags {
    pub fn matches(&self, other: &AllocationFlags) -> bool {
        self == other
    }
}

/// Compression mode of an allocation.
///
/// Pooled sub-ranges cannot carry per-allocation compression metadata, so a
/// request for anything other than the pool's fixed mode is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMode {
    /// Platform default for the memory type
    #[default]
    Default,
    /// Compression explicitly requested
    Compressed,
    /// Compression explicitly disabled
    Uncompressed,
}

/// Properties of an allocation request.
#[derive(Debug, Clone, Copy)]
pub struct AllocationProperties {
    pub memory_type: MemoryType,
    /// Requested alignment in bytes; 0 means natural alignment
    pub alignment: u64,
    pub flags: AllocationFlags,
    pub compression: CompressionMode,
    /// External-memory export (e.g. DMA-buf) was requested
    pub export_requested: bool,
    /// The allocation must wrap caller-provided host memory
    pub use_host_ptr: bool,
    /// Internal bookkeeping allocation of the runtime itself
    pub internal: bool,
    /// Imported from another process or API
    pub imported: bool,
}

impl AllocationProperties {
    pub fn new(memory_type: MemoryType) -> Self {
        AllocationProperties {
            memory_type,
            alignment: 0,
            flags: AllocationFlags::default(),
            compression: CompressionMode::Default,
            export_requested: false,
            use_host_ptr: false,
            internal: false,
            imported: false,
        }
    }

    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_flags(mut self, flags: AllocationFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_compression(mut self, compression: CompressionMode) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_export_requested(mut self, export_requested: bool) -> Self {
        self.export_requested = export_requested;
        self
    }

    pub fn with_use_host_ptr(mut self, use_host_ptr: bool) -> Self {
        self.use_host_ptr = use_host_ptr;
        self
    }

    pub fn with_internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn with_imported(mut self, imported: bool) -> Self {
        self.imported = imported;
        self
    }
}

/// Descriptor record of one backing allocation obtained from the raw
/// allocator.
///
/// Records are cloneable data handles; the backend resolves them by `id` for
/// residency, completion, and release operations. Ownership of the memory
/// they describe stays with whichever component reserved them.
#[derive(Debug, Clone)]
pub struct MemoryRecord {
    /// Backend-internal handle; stable for the allocation's lifetime
    pub id: AllocationId,
    /// Externally visible identifier consumers may track allocations by.
    /// Starts equal to `id`; the reuse cache can mint a fresh one when a
    /// recycled allocation must appear as a new one.
    pub alloc_id: AllocationId,
    pub base: DeviceAddress,
    pub size: u64,
    pub alignment: u64,
    pub memory_type: MemoryType,
    pub flags: AllocationFlags,
    pub compression: CompressionMode,
    pub imported: bool,
    pub internal: bool,
}

impl MemoryRecord {
    /// Check whether `addr` falls inside this allocation's byte range.
    pub fn contains(&self, addr: DeviceAddress) -> bool {
        addr.0 >= self.base.0 && addr.0 < self.base.0 + self.size
    }

    /// End address (one past the last byte)
    pub fn end(&self) -> DeviceAddress {
        self.base.add(self.size)
    }
}

/// A request handed to the raw allocator.
#[derive(Debug, Clone, Copy)]
pub struct ReserveRequest {
    pub size: u64,
    pub alignment: u64,
    pub memory_type: MemoryType,
    pub flags: AllocationFlags,
    pub compression: CompressionMode,
}

impl ReserveRequest {
    pub fn new(size: u64, alignment: u64, memory_type: MemoryType) -> Self {
        ReserveRequest {
            size,
            alignment,
            memory_type,
            flags: AllocationFlags::default(),
            compression: CompressionMode::Default,
        }
    }

    pub fn with_flags(mut self, flags: AllocationFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// An OS-level shareable handle to a backing allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OsHandle(pub u64);

/// A handle another process can import to reconstruct a pointer.
///
/// `offset` locates the sub-allocation inside the shared backing allocation;
/// it is zero for non-pooled allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcHandle {
    pub handle: OsHandle,
    pub offset: u64,
}
