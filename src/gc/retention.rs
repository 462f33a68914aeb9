//! Episodic retention collector.
//!
//! Prunes outcome events that exceeded the retention age, and trims the
//! durable table to the count bound. Whichever bound is more restrictive
//! wins. Ingestion is never blocked: the collector works on flushed events
//! only, and writers keep pushing into the episodic channel meanwhile.
//!
//! # Configuration
//!
//! - Environment variable: `CAPGRAPH_RETENTION_DAYS` (default: 30)
//! - Config file: `[retention] max_age_days = 30`
//! - The count bound is `[episodic] max_count`

use crate::Result;
use crate::gc::{duration_to_millis, u64_to_f64, usize_to_f64};
use crate::storage::EpisodicStore;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Environment variable for the retention age in days.
pub const RETENTION_DAYS_ENV: &str = "CAPGRAPH_RETENTION_DAYS";

/// Default retention age in days.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Retention policy configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Whether scheduled collection runs at all.
    pub enabled: bool,
    /// Maximum event age in days.
    pub max_age_days: u32,
    /// Interval between scheduled runs.
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_days: DEFAULT_RETENTION_DAYS,
            interval_secs: 3_600,
        }
    }
}

impl RetentionConfig {
    /// Sets the maximum event age.
    #[must_use]
    pub const fn with_max_age_days(mut self, days: u32) -> Self {
        self.max_age_days = days;
        self
    }

    /// Sets the schedule interval.
    #[must_use]
    pub const fn with_interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    /// Applies environment variable overrides.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `CAPGRAPH_RETENTION_DAYS` | Maximum event age |
    /// | `CAPGRAPH_RETENTION_INTERVAL_SECS` | Schedule interval |
    /// | `CAPGRAPH_RETENTION_ENABLED` | `false` disables scheduled runs |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var(RETENTION_DAYS_ENV)
            && let Ok(days) = v.parse::<u32>()
        {
            self.max_age_days = days;
        }
        if let Ok(v) = std::env::var("CAPGRAPH_RETENTION_INTERVAL_SECS")
            && let Ok(secs) = v.parse::<u64>()
        {
            self.interval_secs = secs.max(1);
        }
        if let Ok(v) = std::env::var("CAPGRAPH_RETENTION_ENABLED") {
            self.enabled = !matches!(v.to_lowercase().as_str(), "false" | "0" | "no");
        }
        self
    }

    /// Returns the cutoff: events strictly older than this are expired.
    #[must_use]
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::days(i64::from(self.max_age_days))
    }
}

/// Result of a retention run.
#[derive(Debug, Clone, Default)]
pub struct RetentionGcResult {
    /// Events dropped from the in-memory log.
    pub memory_pruned: usize,
    /// Rows deleted from the durable table.
    pub backend_pruned: usize,
    /// Whether this was a dry run (no actual changes made).
    pub dry_run: bool,
    /// Duration of the run in milliseconds.
    pub duration_ms: u64,
}

impl RetentionGcResult {
    /// Returns the larger of the two prune counts.
    ///
    /// Flushed events live in both places, so the counts overlap.
    #[must_use]
    pub fn total_pruned(&self) -> usize {
        self.memory_pruned.max(self.backend_pruned)
    }

    /// Returns a human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let action = if self.dry_run { "would prune" } else { "pruned" };
        if self.total_pruned() == 0 {
            format!("No expired episodic events ({}ms)", self.duration_ms)
        } else {
            format!(
                "{action} {} in-memory and {} stored episodic events in {}ms",
                self.memory_pruned, self.backend_pruned, self.duration_ms
            )
        }
    }
}

/// Enforces the age and count bounds on the episodic store.
pub struct EpisodicRetentionCollector {
    store: Arc<EpisodicStore>,
    config: RetentionConfig,
}

impl EpisodicRetentionCollector {
    /// Creates a collector for a store.
    #[must_use]
    pub const fn new(store: Arc<EpisodicStore>, config: RetentionConfig) -> Self {
        Self { store, config }
    }

    /// Returns the retention configuration.
    #[must_use]
    pub const fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Runs one collection pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable backend fails. The in-memory prune
    /// has already happened by then.
    #[instrument(
        name = "capgraph.gc.retention",
        skip(self),
        fields(
            query_id = tracing::field::Empty,
            component = "gc",
            operation = "retention",
            dry_run = dry_run,
            max_age_days = self.config.max_age_days
        )
    )]
    pub fn collect(&self, dry_run: bool) -> Result<RetentionGcResult> {
        let start = Instant::now();
        if let Some(query_id) = crate::observability::current_query_id() {
            tracing::Span::current().record("query_id", query_id.as_str());
        }
        let cutoff = self.config.cutoff(Utc::now());
        let mut result = RetentionGcResult {
            dry_run,
            ..Default::default()
        };

        result.memory_pruned = self.store.prune_memory(cutoff, dry_run);

        if let Some(backend) = self.store.backend() {
            let max_count = self.store.config().max_count;
            result.backend_pruned = backend
                .prune(cutoff, max_count, dry_run)
                .inspect_err(|e| warn!(error = %e, "Episodic retention failed on backend"))?;
        }

        result.duration_ms = duration_to_millis(start.elapsed());

        metrics::counter!(
            "gc_retention_runs_total",
            "dry_run" => dry_run.to_string()
        )
        .increment(1);
        if !dry_run {
            metrics::counter!("episodic_retention_pruned_total")
                .increment(result.total_pruned() as u64);
        }
        metrics::gauge!("gc_retention_pruned").set(usize_to_f64(result.total_pruned()));
        metrics::histogram!("gc_retention_duration_ms").record(u64_to_f64(result.duration_ms));

        info!(
            memory_pruned = result.memory_pruned,
            backend_pruned = result.backend_pruned,
            duration_ms = result.duration_ms,
            dry_run,
            "Retention GC completed"
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EpisodicEvent, Outcome};
    use crate::storage::traits::EpisodicBackend;
    use crate::storage::{EpisodicConfig, SqliteEpisodicBackend};

    fn event_aged(days: i64) -> EpisodicEvent {
        EpisodicEvent::new("ctx", "act", 0.5, Outcome::Success)
            .with_timestamp(Utc::now() - chrono::Duration::days(days))
    }

    #[test]
    fn test_cutoff_uses_max_age() {
        let now = Utc::now();
        let config = RetentionConfig::default().with_max_age_days(7);
        assert_eq!(config.cutoff(now), now - chrono::Duration::days(7));
    }

    #[test]
    fn test_collect_prunes_memory_and_backend() {
        let backend: Arc<dyn EpisodicBackend> =
            Arc::new(SqliteEpisodicBackend::in_memory().unwrap());
        let store = Arc::new(EpisodicStore::new(
            EpisodicConfig::default().with_max_count(3),
            Some(Arc::clone(&backend)),
        ));
        for days in [60, 45, 2, 1, 0] {
            store.record(event_aged(days)).unwrap();
        }
        store.flush();
        assert_eq!(backend.count().unwrap(), 5);

        let gc = EpisodicRetentionCollector::new(Arc::clone(&store), RetentionConfig::default());

        let preview = gc.collect(true).unwrap();
        assert!(preview.dry_run);
        assert_eq!(backend.count().unwrap(), 5);

        let result = gc.collect(false).unwrap();
        assert_eq!(result.backend_pruned, 2);
        assert_eq!(backend.count().unwrap(), 3);
        assert!(store.len() <= 3);
        let cutoff = RetentionConfig::default().cutoff(Utc::now());
        assert!(
            backend
                .recent(10)
                .unwrap()
                .iter()
                .all(|e| e.timestamp >= cutoff)
        );
    }

    #[test]
    fn test_summary_mentions_dry_run() {
        let result = RetentionGcResult {
            memory_pruned: 2,
            backend_pruned: 3,
            dry_run: true,
            duration_ms: 4,
        };
        assert!(result.summary().starts_with("would prune"));
        assert_eq!(result.total_pruned(), 3);
    }
}
