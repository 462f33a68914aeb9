//! Background training pass.
//!
//! One pass drains the episodic buffer, draws a prioritized batch, trains
//! the scorer on it, feeds the fresh prediction errors back as priorities,
//! and applies any pending threshold batches. Failures are logged and the
//! next pass retries; queries keep using the previously published model.

use super::scorer::{MultiHeadScorer, TrainingReport};
use super::threshold::ThresholdManager;
use crate::gc::{duration_to_millis, u64_to_f64};
use crate::storage::{EpisodicStore, GraphStore};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Training schedule configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Whether the background loop runs.
    pub enabled: bool,
    /// Interval between passes.
    pub interval_ms: u64,
    /// Prioritized samples per pass.
    pub batch_size: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5_000,
            batch_size: 32,
        }
    }
}

impl TrainingConfig {
    /// Sets the pass interval.
    #[must_use]
    pub const fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Enables or disables the background loop.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Applies environment variable overrides.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `CAPGRAPH_TRAINING_ENABLED` | `true`/`false` |
    /// | `CAPGRAPH_TRAINING_INTERVAL_MS` | Pass interval |
    /// | `CAPGRAPH_TRAINING_BATCH_SIZE` | Samples per pass |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("CAPGRAPH_TRAINING_ENABLED") {
            self.enabled = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Ok(v) = std::env::var("CAPGRAPH_TRAINING_INTERVAL_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.interval_ms = parsed.max(1);
        }
        if let Ok(v) = std::env::var("CAPGRAPH_TRAINING_BATCH_SIZE")
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.batch_size = parsed.max(1);
        }
        self
    }
}

/// Result of one training pass.
#[derive(Debug, Clone, Default)]
pub struct TrainingPass {
    /// Events moved from the buffer into the ring.
    pub flushed: usize,
    /// Samples drawn.
    pub sampled: usize,
    /// Scorer report; `None` when there was nothing to train on.
    pub scorer: Option<TrainingReport>,
    /// Threshold batches applied early.
    pub thresholds_flushed: usize,
    /// Pass duration.
    pub duration_ms: u64,
}

/// Runs training passes.
pub struct TrainingService {
    config: TrainingConfig,
    graph: Arc<GraphStore>,
    episodic: Arc<EpisodicStore>,
    scorer: Arc<MultiHeadScorer>,
    thresholds: Arc<ThresholdManager>,
}

impl TrainingService {
    /// Creates a training service over shared components.
    #[must_use]
    pub const fn new(
        config: TrainingConfig,
        graph: Arc<GraphStore>,
        episodic: Arc<EpisodicStore>,
        scorer: Arc<MultiHeadScorer>,
        thresholds: Arc<ThresholdManager>,
    ) -> Self {
        Self {
            config,
            graph,
            episodic,
            scorer,
            thresholds,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Runs one pass.
    #[instrument(
        name = "capgraph.training.pass",
        skip(self),
        fields(component = "training", operation = "pass", batch_size = self.config.batch_size)
    )]
    pub fn run_once(&self) -> TrainingPass {
        let start = Instant::now();
        let mut pass = TrainingPass {
            flushed: self.episodic.flush(),
            ..Default::default()
        };

        let samples = self.episodic.sample(self.config.batch_size);
        pass.sampled = samples.len();
        if samples.is_empty() {
            debug!("No episodic events to train on");
        } else {
            let snapshot = self.graph.snapshot();
            let report = self.scorer.train(&samples, &snapshot);
            self.episodic.update_priorities(&report.priorities);
            pass.scorer = Some(report);
        }
        pass.thresholds_flushed = self.thresholds.flush_pending();
        pass.duration_ms = duration_to_millis(start.elapsed());

        metrics::counter!("training_passes_total").increment(1);
        metrics::histogram!("training_pass_duration_ms").record(u64_to_f64(pass.duration_ms));
        if let Some(report) = &pass.scorer {
            info!(
                flushed = pass.flushed,
                sampled = pass.sampled,
                examples = report.examples,
                mean_loss = report.mean_loss,
                model_version = report.model_version,
                thresholds_flushed = pass.thresholds_flushed,
                duration_ms = pass.duration_ms,
                "Training pass completed"
            );
        }
        pass
    }

    /// Spawns the periodic training loop.
    ///
    /// A pass that panics is logged and the loop keeps going. The loop exits
    /// when `shutdown` flips to `true`.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(service.config.interval_ms.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {},
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    },
                }
                let worker = Arc::clone(&service);
                if let Err(e) = tokio::task::spawn_blocking(move || worker.run_once()).await {
                    warn!(error = %e, "Training pass failed, retrying next cycle");
                    metrics::counter!("training_failures_total").increment(1);
                }
            }
            debug!("Training loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EpisodicEvent, Node, Outcome};
    use crate::services::scorer::ScorerConfig;
    use crate::services::threshold::ThresholdConfig;
    use crate::storage::{BatchPolicy, EpisodicConfig, GraphBatch, GraphConfig};

    fn service() -> TrainingService {
        let graph = Arc::new(GraphStore::new(GraphConfig::default()));
        graph
            .apply_batch(
                GraphBatch::new().upsert_node(Node::tool("a")).upsert_node(Node::tool("b")),
                BatchPolicy::AllOrNothing,
            )
            .unwrap();
        let episodic = Arc::new(EpisodicStore::new(
            EpisodicConfig::default().with_flush_batch_size(1000),
            None,
        ));
        let scorer = Arc::new(MultiHeadScorer::new(
            ScorerConfig::default().with_min_examples(1, 1),
            Arc::clone(&episodic),
        ));
        let thresholds = Arc::new(
            ThresholdManager::new(ThresholdConfig::default().with_batch_size(100), None).unwrap(),
        );
        TrainingService::new(TrainingConfig::default(), graph, episodic, scorer, thresholds)
    }

    #[test]
    fn test_empty_pass_is_noop() {
        let service = service();
        let pass = service.run_once();
        assert_eq!(pass.flushed, 0);
        assert_eq!(pass.sampled, 0);
        assert!(pass.scorer.is_none());
        assert_eq!(service.scorer.model().version, 0);
    }

    #[test]
    fn test_pass_trains_and_flushes_thresholds() {
        let service = service();
        for i in 0..6 {
            let outcome = if i % 2 == 0 { Outcome::Success } else { Outcome::Failure };
            service
                .episodic
                .record(EpisodicEvent::new("ctx", "a", 0.7, outcome))
                .unwrap();
            service.thresholds.observe(&"ctx".into(), outcome);
        }
        assert_eq!(service.thresholds.pending(), 6);

        let pass = service.run_once();
        assert_eq!(pass.flushed, 6);
        assert!(pass.sampled > 0);
        assert!(pass.scorer.is_some());
        assert_eq!(pass.thresholds_flushed, 1);
        assert_eq!(service.thresholds.pending(), 0);
        assert_eq!(service.scorer.model().version, 1);
        assert!(service.scorer.model().fusion.is_trained());
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let service = Arc::new(service());
        let (tx, rx) = watch::channel(false);
        let handle = service.spawn(rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
