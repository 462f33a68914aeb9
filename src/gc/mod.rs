//! Garbage collection.
//!
//! The episodic log is the only unbounded input the engine accepts, so it is
//! the only thing collected. The in-memory ring already enforces the count
//! bound on every flush; the retention collector adds the age bound and
//! trims the durable table to both.
//!
//! # Example
//!
//! ```rust
//! use capgraph::gc::{EpisodicRetentionCollector, RetentionConfig};
//! use capgraph::storage::{EpisodicConfig, EpisodicStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(EpisodicStore::new(EpisodicConfig::default(), None));
//! let gc = EpisodicRetentionCollector::new(store, RetentionConfig::default());
//!
//! // Dry run to see what would be pruned
//! let result = gc.collect(true).unwrap();
//! assert_eq!(result.total_pruned(), 0);
//! ```

mod retention;

pub use retention::{
    DEFAULT_RETENTION_DAYS, EpisodicRetentionCollector, RETENTION_DAYS_ENV, RetentionConfig,
    RetentionGcResult,
};

use std::time::Duration;

/// Safely converts Duration to milliseconds as u64, capping at `u64::MAX`.
#[inline]
pub(crate) fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Converts usize to f64 for metrics, capping at `u32::MAX`.
///
/// Uses u32 intermediate to avoid precision loss (`u32` fits exactly in `f64`).
/// For metrics, capping at 4 billion is acceptable.
#[inline]
pub(crate) fn usize_to_f64(value: usize) -> f64 {
    let capped = u32::try_from(value).unwrap_or(u32::MAX);
    f64::from(capped)
}

/// Converts u64 to f64 for metrics, capping at `u32::MAX`.
#[inline]
pub(crate) fn u64_to_f64(value: u64) -> f64 {
    let capped = u32::try_from(value).unwrap_or(u32::MAX);
    f64::from(capped)
}
