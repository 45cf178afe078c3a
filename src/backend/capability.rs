//! Platform capability dispatch
//!
//! Whether pooling or aggregation is supported at all varies per hardware
//! generation and per memory type, and a few process-wide conditions (an
//! attached debugger) disable pooling outright. Components query the
//! capability interface once at construction time and cache the answer;
//! nothing re-queries per allocation.

use std::sync::atomic::{AtomicBool, Ordering};

use super::record::MemoryType;

/// Per-product capability queries, resolved once at construction time.
pub trait PlatformCapabilities: Send + Sync + std::fmt::Debug {
    /// Is sub-allocation pooling supported for this memory type?
    fn pooling_supported(&self, memory_type: MemoryType) -> bool;

    /// Is small-buffer aggregation supported?
    fn aggregation_supported(&self) -> bool;

    /// Is a debugger or tracing session attached?
    ///
    /// Debuggers require a one-to-one address-to-allocation mapping, so
    /// pooling is disabled for the whole process while one is present.
    fn debugger_attached(&self) -> bool;
}

/// Fixed capability table, configurable at construction.
///
/// Production drivers implement [`PlatformCapabilities`] per hardware
/// generation; this table covers embedders with a static answer and doubles
/// as the capability source for the simulated backend.
#[derive(Debug)]
pub struct StaticCapabilities {
    host_pooling: bool,
    device_pooling: bool,
    shared_pooling: bool,
    aggregation: bool,
    debugger: AtomicBool,
}

impl StaticCapabilities {
    /// Everything supported, no debugger.
    pub fn all_supported() -> Self {
        StaticCapabilities {
            host_pooling: true,
            device_pooling: true,
            shared_pooling: true,
            aggregation: true,
            debugger: AtomicBool::new(false),
        }
    }

    pub fn with_host_pooling(mut self, supported: bool) -> Self {
        self.host_pooling = supported;
        self
    }

    pub fn with_device_pooling(mut self, supported: bool) -> Self {
        self.device_pooling = supported;
        self
    }

    pub fn with_shared_pooling(mut self, supported: bool) -> Self {
        self.shared_pooling = supported;
        self
    }

    pub fn with_aggregation(mut self, supported: bool) -> Self {
        self.aggregation = supported;
        self
    }

    /// Flip the debugger-attached flag at runtime.
    pub fn set_debugger_attached(&self, attached: bool) {
        self.debugger.store(attached, Ordering::Release);
    }
}

impl Default for StaticCapabilities {
    fn default() -> Self {
        Self::all_supported()
    }
}

impl PlatformCapabilities for StaticCapabilities {
    fn pooling_supported(&self, memory_type: MemoryType) -> bool {
        match memory_type {
            MemoryType::Host => self.host_pooling,
            MemoryType::Device => self.device_pooling,
            MemoryType::Shared => self.shared_pooling,
        }
    }

    fn aggregation_supported(&self) -> bool {
        self.aggregation
    }

    fn debugger_attached(&self) -> bool {
        self.debugger.load(Ordering::Acquire)
    }
}
