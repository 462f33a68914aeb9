//! Episodic event backend trait.

use crate::Result;
use crate::models::EpisodicEvent;
use chrono::{DateTime, Utc};

/// Durable storage for outcome events.
///
/// Writes are idempotent on event id.
pub trait EpisodicBackend: Send + Sync {
    /// Appends events in one transaction. Returns the number inserted.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; nothing is written.
    fn append(&self, events: &[EpisodicEvent]) -> Result<usize>;

    /// Returns a context's events, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn by_context(&self, context_id: &str, limit: usize) -> Result<Vec<EpisodicEvent>>;

    /// Returns the newest events across all contexts, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn recent(&self, limit: usize) -> Result<Vec<EpisodicEvent>>;

    /// Deletes events older than `cutoff`, then all but the newest
    /// `max_count`. Returns the number deleted; `dry_run` only counts.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    fn prune(&self, cutoff: DateTime<Utc>, max_count: usize, dry_run: bool) -> Result<usize>;

    /// Returns the number of stored events.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn count(&self) -> Result<usize>;
}
