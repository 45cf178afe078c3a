//! Allocation reuse
//!
//! Whole released allocations are cheap to hand out verbatim: the
//! [`ReuseCache`] keeps them indexed by size and the [`ReuseCleaner`]
//! worker ages them out so idle memory returns to the system.

pub mod cache;
pub mod cleaner;

pub use cache::{ReuseCache, ReuseConfig};
pub use cleaner::ReuseCleaner;
