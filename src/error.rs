//! Unified error handling for unipool
//!
//! This module provides a centralized error type for the pooling engine.
//! Errors are categorized so callers can decide how to react:
//! - User errors (misuse of a pooled address, bad configuration)
//! - Recoverable errors (capacity exhaustion, pool ceiling reached)
//! - Backend errors (the raw allocator or residency layer failed)
//! - Internal errors (bugs, poisoned locks)
//!
//! Nothing in this subsystem is fatal by design: capacity-class errors are
//! always absorbed by falling back to the unpooled allocation path, and the
//! only failures surfaced to API entry points are "allocation failed" and
//! "invalid argument" for cross-checked pooled addresses.

use std::fmt;

use crate::backend::DeviceAddress;

/// Unified error type for the pooling engine
#[derive(Debug, thiserror::Error)]
pub enum UnipoolError {
    // ========== Address Errors ==========
    /// Address is not tracked by any pool, cache, or registry.
    ///
    /// This is the low-severity outcome: the caller is free to hand the
    /// address to the next subsystem in its free path.
    #[error("address {0} not tracked by the pooling engine")]
    AddressNotFound(DeviceAddress),

    /// Address falls inside a managed range but no live allocation starts
    /// or contains it. Freeing such an address is caller misuse.
    #[error("address {0} is inside a managed range but not a live allocation")]
    InvalidAddress(DeviceAddress),

    // ========== Capacity Errors ==========
    /// A pool or cache could not hold the request; fall back to unpooled.
    #[error("capacity exhausted: requested {requested} bytes")]
    CapacityExhausted { requested: u64 },

    /// The device-wide pool-count ceiling is reached.
    #[error("pool ceiling reached: {active} of {max} pools active")]
    PoolCeilingReached { active: u32, max: u32 },

    // ========== Backend Errors ==========
    /// The raw allocator failed to reserve backing memory.
    #[error("backing reservation failed: {0}")]
    ReserveFailed(String),

    /// Residency, completion, or handle-export call failed.
    #[error("backend error: {0}")]
    Backend(String),

    // ========== Configuration Errors ==========
    /// Invalid engine or component configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("internal error: {0}")]
    Internal(String),

    /// Lock poisoned (a thread panicked while holding an engine lock)
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl UnipoolError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            UnipoolError::InvalidAddress(_) | UnipoolError::InvalidConfiguration(_) => {
                ErrorCategory::User
            }

            UnipoolError::AddressNotFound(_)
            | UnipoolError::CapacityExhausted { .. }
            | UnipoolError::PoolCeilingReached { .. } => ErrorCategory::Recoverable,

            UnipoolError::ReserveFailed(_) | UnipoolError::Backend(_) => ErrorCategory::Backend,

            UnipoolError::Internal(_) | UnipoolError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is recoverable by falling back to the unpooled path
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Recoverable | ErrorCategory::Backend
        )
    }

    /// Check if this is a user-facing misuse error
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// User error - misuse of a pooled address or bad configuration
    User,
    /// Recoverable error - fall back to the unpooled path
    Recoverable,
    /// Backend error - raw allocator or residency layer failure
    Backend,
    /// Internal error - indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for UnipoolError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        UnipoolError::LockPoisoned(err.to_string())
    }
}

/// Result alias used throughout the engine
pub type PoolResult<T> = std::result::Result<T, UnipoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            UnipoolError::InvalidAddress(DeviceAddress(0x1000)).category(),
            ErrorCategory::User
        );
        assert_eq!(
            UnipoolError::AddressNotFound(DeviceAddress(0x1000)).category(),
            ErrorCategory::Recoverable
        );
        assert_eq!(
            UnipoolError::CapacityExhausted { requested: 64 }.category(),
            ErrorCategory::Recoverable
        );
        assert_eq!(
            UnipoolError::PoolCeilingReached { active: 2, max: 2 }.category(),
            ErrorCategory::Recoverable
        );
        assert_eq!(
            UnipoolError::ReserveFailed("oom".to_string()).category(),
            ErrorCategory::Backend
        );
        assert_eq!(
            UnipoolError::LockPoisoned("poisoned".to_string()).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_is_recoverable() {
        assert!(UnipoolError::CapacityExhausted { requested: 1 }.is_recoverable());
        assert!(UnipoolError::PoolCeilingReached { active: 1, max: 1 }.is_recoverable());
        assert!(UnipoolError::ReserveFailed("oom".to_string()).is_recoverable());

        assert!(!UnipoolError::InvalidAddress(DeviceAddress(1)).is_recoverable());
        assert!(!UnipoolError::Internal("bug".to_string()).is_recoverable());
    }

    #[test]
    fn test_not_found_is_distinct_from_invalid() {
        let not_found = UnipoolError::AddressNotFound(DeviceAddress(0x2000));
        let invalid = UnipoolError::InvalidAddress(DeviceAddress(0x2000));

        assert!(not_found.is_recoverable());
        assert!(invalid.is_user_error());
        assert_ne!(not_found.category(), invalid.category());
    }

    #[test]
    fn test_error_display() {
        let err = UnipoolError::PoolCeilingReached { active: 4, max: 4 };
        assert_eq!(err.to_string(), "pool ceiling reached: 4 of 4 pools active");

        let err = UnipoolError::CapacityExhausted { requested: 4096 };
        assert!(err.to_string().contains("4096"));
    }
}
