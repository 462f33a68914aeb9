//! Threshold backend trait.

use crate::Result;
use crate::models::ThresholdRecord;

/// Durable storage for threshold records, keyed by context key.
pub trait ThresholdBackend: Send + Sync {
    /// Inserts or replaces a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn save(&self, record: &ThresholdRecord) -> Result<()>;

    /// Returns every stored record.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn load_all(&self) -> Result<Vec<ThresholdRecord>>;
}
