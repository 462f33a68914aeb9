//! Adaptive per-context confidence thresholds.
//!
//! Each context learns the confidence a suggestion needs before callers act
//! on it. Outcomes queue per context in arrival order and are applied in
//! batches through an EMA control loop:
//!
//! ```text
//! smoothed ← β·observed + (1 − β)·smoothed
//! error     = smoothed − target
//! step      = min(max_step, |error|·gain)
//! value     ← value − sign(error)·step, clamped to [min, max]
//! ```
//!
//! A context that succeeds more often than the band gets a lower cutoff, one
//! that fails more often gets a higher one. While the smoothed rate sits
//! inside the band the value holds still.

use crate::models::{ContextKey, Outcome, ThresholdRecord};
use crate::storage::locks::acquire_lock;
use crate::storage::traits::ThresholdBackend;
use crate::{Error, Result};
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument, warn};

/// Threshold learner configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Starting value for new contexts.
    pub default_threshold: f64,
    /// Lower bound of any threshold.
    pub min_threshold: f64,
    /// Upper bound of any threshold.
    pub max_threshold: f64,
    /// Lower edge of the target success band.
    pub band_low: f64,
    /// Upper edge of the target success band.
    pub band_high: f64,
    /// EMA factor for the observed success rate.
    pub ema_beta: f64,
    /// Proportional gain of the step.
    pub step_gain: f64,
    /// Largest change per batch.
    pub max_step: f64,
    /// Outcomes per batch.
    pub batch_size: usize,
    /// Consecutive in-band batches that count as converged.
    pub convergence_window: u32,
    /// Also learn thresholds for specific (`general:detail`) keys.
    pub fine_grained_contexts: bool,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            default_threshold: 0.92,
            min_threshold: 0.5,
            max_threshold: 0.99,
            band_low: 0.80,
            band_high: 0.90,
            ema_beta: 0.3,
            step_gain: 0.1,
            max_step: 0.05,
            batch_size: 10,
            convergence_window: 5,
            fine_grained_contexts: false,
        }
    }
}

impl ThresholdConfig {
    /// Sets the target success band.
    #[must_use]
    pub const fn with_band(mut self, low: f64, high: f64) -> Self {
        self.band_low = low;
        self.band_high = high;
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the EMA factor.
    #[must_use]
    pub const fn with_ema_beta(mut self, beta: f64) -> Self {
        self.ema_beta = beta;
        self
    }

    /// Enables per-specific-key learning.
    #[must_use]
    pub const fn with_fine_grained_contexts(mut self, enabled: bool) -> Self {
        self.fine_grained_contexts = enabled;
        self
    }

    /// Target success rate: the band midpoint.
    #[must_use]
    pub fn target(&self) -> f64 {
        f64::midpoint(self.band_low, self.band_high)
    }

    /// Returns `true` if a smoothed success rate lies inside the band.
    #[must_use]
    pub fn in_band(&self, smoothed: f64) -> bool {
        (self.band_low..=self.band_high).contains(&smoothed)
    }

    /// Checks bounds and band ordering.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] unless
    /// `min ≤ band_low < band_high ≤ max`, `β ∈ (0, 1]`, and the default
    /// lies within `[min, max]`.
    pub fn validate(&self) -> Result<()> {
        if !(self.min_threshold <= self.band_low
            && self.band_low < self.band_high
            && self.band_high <= self.max_threshold)
        {
            return Err(Error::InvalidInput(format!(
                "threshold bounds must satisfy min <= band_low < band_high <= max, got {} <= {} < {} <= {}",
                self.min_threshold, self.band_low, self.band_high, self.max_threshold
            )));
        }
        if !(self.ema_beta > 0.0 && self.ema_beta <= 1.0) {
            return Err(Error::InvalidInput(format!(
                "threshold ema_beta must be in (0, 1], got {}",
                self.ema_beta
            )));
        }
        if !(self.min_threshold..=self.max_threshold).contains(&self.default_threshold) {
            return Err(Error::InvalidInput(format!(
                "default threshold {} outside [{}, {}]",
                self.default_threshold, self.min_threshold, self.max_threshold
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidInput(
                "threshold batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Applies environment variable overrides.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `CAPGRAPH_THRESHOLD_DEFAULT` | Starting value |
    /// | `CAPGRAPH_THRESHOLD_EMA_BETA` | EMA factor |
    /// | `CAPGRAPH_THRESHOLD_BATCH_SIZE` | Outcomes per batch |
    /// | `CAPGRAPH_THRESHOLD_FINE_GRAINED` | `true` learns specific keys |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("CAPGRAPH_THRESHOLD_DEFAULT")
            && let Ok(parsed) = v.parse::<f64>()
        {
            self.default_threshold = parsed;
        }
        if let Ok(v) = std::env::var("CAPGRAPH_THRESHOLD_EMA_BETA")
            && let Ok(parsed) = v.parse::<f64>()
        {
            self.ema_beta = parsed;
        }
        if let Ok(v) = std::env::var("CAPGRAPH_THRESHOLD_BATCH_SIZE")
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.batch_size = parsed;
        }
        if let Ok(v) = std::env::var("CAPGRAPH_THRESHOLD_FINE_GRAINED") {
            self.fine_grained_contexts = matches!(v.to_lowercase().as_str(), "true" | "1" | "yes");
        }
        self
    }

    fn initial_record(&self, key: &str) -> ThresholdRecord {
        ThresholdRecord::new(key, self.default_threshold, self.target())
    }
}

/// Applies one batch of outcomes to a record.
pub fn apply_batch(config: &ThresholdConfig, record: &mut ThresholdRecord, outcomes: &[Outcome]) {
    if outcomes.is_empty() {
        return;
    }
    let successes = outcomes.iter().filter(|o| o.is_success()).count();
    let observed = crate::gc::usize_to_f64(successes) / crate::gc::usize_to_f64(outcomes.len());
    let smoothed = config
        .ema_beta
        .mul_add(observed, (1.0 - config.ema_beta) * record.smoothed_success_rate);

    let in_band = config.in_band(smoothed);
    let value = if in_band {
        record.value
    } else {
        let error = smoothed - config.target();
        let step = (error.abs() * config.step_gain).min(config.max_step);
        record.value - step.copysign(error)
    };

    record.value = value.clamp(config.min_threshold, config.max_threshold);
    record.smoothed_success_rate = smoothed;
    record.sample_count = record.sample_count.saturating_add(outcomes.len() as u64);
    record.in_band_streak = if in_band {
        record.in_band_streak.saturating_add(1)
    } else {
        0
    };
    record.updated_at = Utc::now();
}

#[derive(Debug, Default)]
struct ThresholdState {
    records: HashMap<String, ThresholdRecord>,
    pending: HashMap<String, Vec<Outcome>>,
}

/// Learns and serves per-context thresholds.
pub struct ThresholdManager {
    config: ThresholdConfig,
    state: Mutex<ThresholdState>,
    backend: Option<Arc<dyn ThresholdBackend>>,
}

impl std::fmt::Debug for ThresholdManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThresholdManager")
            .field("config", &self.config)
            .field("durable", &self.backend.is_some())
            .finish_non_exhaustive()
    }
}

impl ThresholdManager {
    /// Creates a manager, optionally writing through to a backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the configuration is invalid.
    pub fn new(config: ThresholdConfig, backend: Option<Arc<dyn ThresholdBackend>>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(ThresholdState::default()),
            backend,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ThresholdConfig {
        &self.config
    }

    /// Loads stored records, clamping values into the configured bounds.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    pub fn load(&self) -> Result<usize> {
        let Some(backend) = &self.backend else {
            return Ok(0);
        };
        let records = backend.load_all()?;
        let mut state = acquire_lock(&self.state, "threshold_state");
        let count = records.len();
        for mut record in records {
            record.value = record
                .value
                .clamp(self.config.min_threshold, self.config.max_threshold);
            state.records.insert(record.context_key.clone(), record);
        }
        debug!(count, "Loaded threshold records");
        Ok(count)
    }

    fn persist(&self, record: &ThresholdRecord) {
        if let Some(backend) = &self.backend
            && let Err(e) = backend.save(record)
        {
            warn!(error = %e, context = %record.context_key, "Failed to persist threshold");
            metrics::counter!("threshold_backend_failures_total").increment(1);
        }
    }

    /// Returns the threshold for a context.
    ///
    /// Looks up the specific key, then the general key. The general record is
    /// created at the default value on first query.
    #[instrument(
        name = "capgraph.threshold.get",
        skip(self),
        fields(component = "threshold", operation = "get", context = %key)
    )]
    pub fn get_threshold(&self, key: &ContextKey) -> f64 {
        let mut state = acquire_lock(&self.state, "threshold_state");
        if let Some(record) = key.specific().and_then(|k| state.records.get(k)) {
            return record.value;
        }
        if let Some(record) = state.records.get(key.general()) {
            return record.value;
        }
        let record = self.config.initial_record(key.general());
        let value = record.value;
        state.records.insert(key.general().to_string(), record.clone());
        drop(state);
        self.persist(&record);
        value
    }

    /// Queues an outcome. Applies a batch, and returns the updated general
    /// record, when the context's queue reaches the batch size.
    pub fn observe(&self, key: &ContextKey, outcome: Outcome) -> Option<ThresholdRecord> {
        let mut targets = vec![key.general().to_string()];
        if self.config.fine_grained_contexts
            && let Some(specific) = key.specific()
        {
            targets.push(specific.to_string());
        }

        let mut state = acquire_lock(&self.state, "threshold_state");
        let mut updated = Vec::new();
        for target in &targets {
            let queue = state.pending.entry(target.clone()).or_default();
            queue.push(outcome);
            if queue.len() >= self.config.batch_size {
                let batch = std::mem::take(queue);
                updated.push(self.apply_locked(&mut state, target, &batch));
            }
        }
        drop(state);

        for record in &updated {
            self.persist(record);
        }
        updated.into_iter().find(|r| r.context_key == key.general())
    }

    fn apply_locked(&self, state: &mut ThresholdState, key: &str, batch: &[Outcome]) -> ThresholdRecord {
        let record = state
            .records
            .entry(key.to_string())
            .or_insert_with(|| self.config.initial_record(key));
        let before = record.value;
        apply_batch(&self.config, record, batch);
        metrics::counter!("threshold_updates_total").increment(1);
        metrics::histogram!("threshold_value").record(record.value);
        debug!(
            context = key,
            outcomes = batch.len(),
            before,
            after = record.value,
            smoothed = record.smoothed_success_rate,
            "Threshold updated"
        );
        record.clone()
    }

    /// Applies every partial batch. Returns the number of contexts updated.
    pub fn flush_pending(&self) -> usize {
        let mut state = acquire_lock(&self.state, "threshold_state");
        let pending: Vec<(String, Vec<Outcome>)> = state
            .pending
            .iter_mut()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(key, queue)| (key.clone(), std::mem::take(queue)))
            .collect();
        let updated: Vec<ThresholdRecord> = pending
            .iter()
            .map(|(key, batch)| self.apply_locked(&mut state, key, batch))
            .collect();
        drop(state);

        for record in &updated {
            self.persist(record);
        }
        updated.len()
    }

    /// Returns the record stored under exactly `key`.
    #[must_use]
    pub fn record(&self, key: &str) -> Option<ThresholdRecord> {
        acquire_lock(&self.state, "threshold_state")
            .records
            .get(key)
            .cloned()
    }

    /// Returns all records, ordered by key.
    #[must_use]
    pub fn records(&self) -> Vec<ThresholdRecord> {
        let state = acquire_lock(&self.state, "threshold_state");
        let mut records: Vec<ThresholdRecord> = state.records.values().cloned().collect();
        records.sort_by(|a, b| a.context_key.cmp(&b.context_key));
        records
    }

    /// Returns `true` if the context's smoothed success rate has stayed in
    /// the band for the convergence window.
    #[must_use]
    pub fn is_converged(&self, key: &str) -> bool {
        self.record(key)
            .is_some_and(|r| r.in_band_streak >= self.config.convergence_window)
    }

    /// Returns the number of outcomes waiting for a batch.
    #[must_use]
    pub fn pending(&self) -> usize {
        acquire_lock(&self.state, "threshold_state")
            .pending
            .values()
            .map(Vec::len)
            .sum()
    }
}
