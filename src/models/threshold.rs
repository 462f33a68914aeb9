//! Threshold records and context keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key identifying a threshold context.
///
/// Keys may carry a finer-grained suffix after the first `:`. The part before
/// it is the general key; the full key is the specific one. Lookups fall back
/// from the specific key to the general key to the global default.
///
/// ```rust
/// use capgraph::ContextKey;
///
/// let key = ContextKey::new("deploy:staging");
/// assert_eq!(key.general(), "deploy");
/// assert_eq!(key.specific(), Some("deploy:staging"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextKey(String);

impl ContextKey {
    /// Creates a context key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the full key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the general (coarse) key.
    #[must_use]
    pub fn general(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(g, _)| g)
    }

    /// Returns the specific key, if the key carries a suffix.
    #[must_use]
    pub fn specific(&self) -> Option<&str> {
        self.0.contains(':').then_some(self.0.as_str())
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContextKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Learned confidence cutoff for one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRecord {
    /// Context key this record applies to.
    pub context_key: String,
    /// Current cutoff, always within the configured bounds.
    pub value: f64,
    /// Exponentially smoothed success rate.
    pub smoothed_success_rate: f64,
    /// Number of outcomes applied.
    pub sample_count: u64,
    /// Consecutive batch updates with the smoothed rate inside the band.
    pub in_band_streak: u32,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

impl ThresholdRecord {
    /// Creates a record at its initial state.
    #[must_use]
    pub fn new(context_key: impl Into<String>, value: f64, smoothed_success_rate: f64) -> Self {
        Self {
            context_key: context_key.into(),
            value,
            smoothed_success_rate,
            sample_count: 0,
            in_band_streak: 0,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_general_key_without_suffix() {
        let key = ContextKey::new("x");
        assert_eq!(key.general(), "x");
        assert_eq!(key.specific(), None);
    }

    #[test]
    fn test_general_key_with_nested_suffix() {
        let key = ContextKey::new("repo:main:ci");
        assert_eq!(key.general(), "repo");
        assert_eq!(key.specific(), Some("repo:main:ci"));
    }
}
