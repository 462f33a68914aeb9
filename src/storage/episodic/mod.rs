//! Episodic outcome store with prioritized replay.
//!
//! Writers push events into an unbounded channel and return immediately.
//! A flush drains the channel into the durable backend (when configured)
//! and into an in-memory replay log: a ring of `max_count` slots whose
//! priorities live in a sum tree.
//!
//! # Sampling
//!
//! | Quantity | Formula |
//! |----------|---------|
//! | Priority | `(|predicted − actual| + ε)^α` |
//! | Probability | `priority / Σ priority` |
//! | IS weight | `(1 / (N·P))^β`, divided by the batch maximum |
//! | β | linear from `beta_start` to 1 over `beta_anneal_steps` sampling calls |
//!
//! # Example
//!
//! ```rust
//! use capgraph::models::{EpisodicEvent, Outcome};
//! use capgraph::storage::{EpisodicConfig, EpisodicStore};
//!
//! let store = EpisodicStore::new(EpisodicConfig::default(), None);
//! store.record(EpisodicEvent::new("repo", "build", 0.8, Outcome::Success)).unwrap();
//! assert_eq!(store.pending(), 1);
//!
//! store.flush();
//! assert_eq!(store.len(), 1);
//! assert_eq!(store.by_context("repo", 10).len(), 1);
//! ```

mod sum_tree;

use crate::models::EpisodicEvent;
use crate::storage::locks::acquire_lock;
use crate::storage::traits::EpisodicBackend;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::distr::{Distribution, StandardUniform};
use rand::rngs::StdRng;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sum_tree::SumTree;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::instrument;
use uuid::Uuid;

/// Episodic store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EpisodicConfig {
    /// Maximum events kept in memory and in the backend.
    pub max_count: usize,
    /// Pending events that trigger an early flush.
    pub flush_batch_size: usize,
    /// Background flush interval.
    pub flush_interval_ms: u64,
    /// Priority exponent `α`.
    pub priority_alpha: f64,
    /// Priority floor `ε`.
    pub priority_epsilon: f64,
    /// Initial importance-sampling exponent `β`.
    pub beta_start: f64,
    /// Sampling calls over which `β` reaches 1.
    pub beta_anneal_steps: u64,
    /// Sampler seed.
    pub seed: u64,
    /// Newest backend events loaded into memory on startup.
    pub rehydrate_limit: usize,
}

impl Default for EpisodicConfig {
    fn default() -> Self {
        Self {
            max_count: 10_000,
            flush_batch_size: 64,
            flush_interval_ms: 1_000,
            priority_alpha: 0.6,
            priority_epsilon: 1e-3,
            beta_start: 0.4,
            beta_anneal_steps: 10_000,
            seed: 0x5EED,
            rehydrate_limit: 10_000,
        }
    }
}

impl EpisodicConfig {
    /// Sets the count bound.
    #[must_use]
    pub const fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = max_count;
        self
    }

    /// Sets the early-flush threshold.
    #[must_use]
    pub const fn with_flush_batch_size(mut self, size: usize) -> Self {
        self.flush_batch_size = size;
        self
    }

    /// Sets the background flush interval.
    #[must_use]
    pub const fn with_flush_interval_ms(mut self, interval_ms: u64) -> Self {
        self.flush_interval_ms = interval_ms;
        self
    }

    /// Sets the priority exponent.
    #[must_use]
    pub const fn with_priority_alpha(mut self, alpha: f64) -> Self {
        self.priority_alpha = alpha;
        self
    }

    /// Sets the sampler seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the `β` schedule.
    #[must_use]
    pub const fn with_beta(mut self, beta_start: f64, anneal_steps: u64) -> Self {
        self.beta_start = beta_start;
        self.beta_anneal_steps = anneal_steps;
        self
    }

    /// Applies environment variable overrides.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `CAPGRAPH_EPISODIC_MAX_COUNT` | Count bound |
    /// | `CAPGRAPH_EPISODIC_FLUSH_BATCH_SIZE` | Early-flush threshold |
    /// | `CAPGRAPH_EPISODIC_FLUSH_INTERVAL_MS` | Flush interval |
    /// | `CAPGRAPH_EPISODIC_PRIORITY_ALPHA` | Priority exponent |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("CAPGRAPH_EPISODIC_MAX_COUNT")
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.max_count = parsed.max(1);
        }
        if let Ok(v) = std::env::var("CAPGRAPH_EPISODIC_FLUSH_BATCH_SIZE")
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.flush_batch_size = parsed.max(1);
        }
        if let Ok(v) = std::env::var("CAPGRAPH_EPISODIC_FLUSH_INTERVAL_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.flush_interval_ms = parsed.max(1);
        }
        if let Ok(v) = std::env::var("CAPGRAPH_EPISODIC_PRIORITY_ALPHA")
            && let Ok(parsed) = v.parse::<f64>()
        {
            self.priority_alpha = parsed.max(0.0);
        }
        self
    }
}

/// One draw from the replay log.
#[derive(Debug, Clone)]
pub struct SampledEvent {
    /// The event.
    pub event: EpisodicEvent,
    /// Sampling probability at draw time.
    pub probability: f64,
    /// Normalized importance-sampling weight in `(0, 1]`.
    pub weight: f64,
}

#[derive(Debug)]
struct ReplayLog {
    slots: Vec<Option<EpisodicEvent>>,
    next: usize,
    len: usize,
    tree: SumTree,
    slot_of: HashMap<Uuid, usize>,
    by_context: HashMap<String, Vec<usize>>,
    rng: StdRng,
    sample_calls: u64,
}

impl ReplayLog {
    fn new(capacity: usize, seed: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            next: 0,
            len: 0,
            tree: SumTree::new(capacity),
            slot_of: HashMap::new(),
            by_context: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
            sample_calls: 0,
        }
    }

    fn clear_slot(&mut self, slot: usize) -> Option<EpisodicEvent> {
        let old = self.slots[slot].take()?;
        self.tree.set(slot, 0.0);
        self.slot_of.remove(&old.id);
        if let Some(slots) = self.by_context.get_mut(&old.context_id) {
            slots.retain(|s| *s != slot);
            if slots.is_empty() {
                self.by_context.remove(&old.context_id);
            }
        }
        self.len -= 1;
        Some(old)
    }

    fn insert(&mut self, event: EpisodicEvent, priority: f64) -> bool {
        if self.slot_of.contains_key(&event.id) {
            return false;
        }
        let slot = self.next;
        self.next = (self.next + 1) % self.slots.len();
        let evicted = self.clear_slot(slot).is_some();
        self.tree.set(slot, priority);
        self.slot_of.insert(event.id, slot);
        self.by_context
            .entry(event.context_id.clone())
            .or_default()
            .push(slot);
        self.slots[slot] = Some(event);
        self.len += 1;
        evicted
    }

    fn uniform(&mut self) -> f64 {
        StandardUniform.sample(&mut self.rng)
    }
}

/// Buffered, bounded outcome log with prioritized sampling.
pub struct EpisodicStore {
    config: EpisodicConfig,
    sender: mpsc::UnboundedSender<EpisodicEvent>,
    receiver: Mutex<mpsc::UnboundedReceiver<EpisodicEvent>>,
    pending: AtomicUsize,
    flush_wanted: Notify,
    log: Mutex<ReplayLog>,
    backend: Option<Arc<dyn EpisodicBackend>>,
}

impl std::fmt::Debug for EpisodicStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpisodicStore")
            .field("config", &self.config)
            .field("pending", &self.pending())
            .field("has_backend", &self.backend.is_some())
            .finish_non_exhaustive()
    }
}

impl EpisodicStore {
    /// Creates a store, optionally backed by durable storage.
    #[must_use]
    pub fn new(config: EpisodicConfig, backend: Option<Arc<dyn EpisodicBackend>>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let log = ReplayLog::new(config.max_count, config.seed);
        Self {
            config,
            sender,
            receiver: Mutex::new(receiver),
            pending: AtomicUsize::new(0),
            flush_wanted: Notify::new(),
            log: Mutex::new(log),
            backend,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &EpisodicConfig {
        &self.config
    }

    fn priority(&self, event: &EpisodicEvent) -> f64 {
        Self::priority_for(&self.config, f64::from(event.prediction_error()))
    }

    fn priority_for(config: &EpisodicConfig, error: f64) -> f64 {
        (error.abs() + config.priority_epsilon).powf(config.priority_alpha)
    }

    /// Loads the newest backend events into memory.
    ///
    /// Returns the number loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    pub fn rehydrate(&self) -> Result<usize> {
        let Some(backend) = &self.backend else {
            return Ok(0);
        };
        let limit = self.config.rehydrate_limit.min(self.config.max_count);
        let mut events = backend.recent(limit)?;
        // Oldest first so the newest end up last in the ring.
        events.reverse();
        let mut log = acquire_lock(&self.log, "episodic_log");
        let count = events.len();
        for event in events {
            let priority = self.priority(&event);
            log.insert(event, priority);
        }
        tracing::info!(count, "Rehydrated episodic log");
        Ok(count)
    }

    /// Queues an event. Never blocks on storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the queue is closed.
    pub fn record(&self, event: EpisodicEvent) -> Result<()> {
        self.sender.send(event).map_err(|e| Error::OperationFailed {
            operation: "record_event".to_string(),
            cause: e.to_string(),
        })?;
        let pending = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::counter!("episodic_events_recorded_total").increment(1);
        if pending >= self.config.flush_batch_size.max(1) {
            self.flush_wanted.notify_one();
        }
        Ok(())
    }

    /// Returns the number of queued, unflushed events.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Returns the number of events in memory.
    #[must_use]
    pub fn len(&self) -> usize {
        acquire_lock(&self.log, "episodic_log").len
    }

    /// Returns `true` if no event is in memory.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains the queue into the backend and the replay log.
    ///
    /// A backend failure is logged and counted; the events still enter the
    /// in-memory log. Returns the number of events drained.
    #[instrument(
        name = "capgraph.episodic.flush",
        skip(self),
        fields(component = "episodic", operation = "flush")
    )]
    pub fn flush(&self) -> usize {
        let mut drained = Vec::new();
        {
            let mut receiver = acquire_lock(&self.receiver, "episodic_receiver");
            while let Ok(event) = receiver.try_recv() {
                drained.push(event);
            }
            self.pending.fetch_sub(drained.len(), Ordering::AcqRel);
        }
        if drained.is_empty() {
            return 0;
        }

        if let Some(backend) = &self.backend
            && let Err(e) = backend.append(&drained)
        {
            tracing::warn!(count = drained.len(), error = %e, "Episodic backend write failed");
            metrics::counter!("episodic_backend_failures_total").increment(1);
        }

        let count = drained.len();
        let mut evicted = 0u64;
        {
            let mut log = acquire_lock(&self.log, "episodic_log");
            for event in drained {
                let priority = self.priority(&event);
                evicted += u64::from(log.insert(event, priority));
            }
            metrics::gauge!("episodic_log_size").set(crate::gc::usize_to_f64(log.len));
        }
        metrics::counter!("episodic_events_flushed_total").increment(count as u64);
        if evicted > 0 {
            metrics::counter!("episodic_ring_evictions_total").increment(evicted);
        }
        tracing::debug!(count, evicted, "Flushed episodic events");
        count
    }

    /// Returns a context's events in memory, newest first.
    #[must_use]
    pub fn by_context(&self, context_id: &str, limit: usize) -> Vec<EpisodicEvent> {
        let log = acquire_lock(&self.log, "episodic_log");
        let mut events: Vec<EpisodicEvent> = log
            .by_context
            .get(context_id)
            .into_iter()
            .flatten()
            .filter_map(|slot| log.slots[*slot].clone())
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        events.truncate(limit);
        events
    }

    /// Returns the current `β` without advancing the schedule.
    #[must_use]
    pub fn beta(&self) -> f64 {
        let log = acquire_lock(&self.log, "episodic_log");
        self.beta_at(log.sample_calls)
    }

    #[allow(clippy::cast_precision_loss)]
    fn beta_at(&self, calls: u64) -> f64 {
        let start = self.config.beta_start.clamp(0.0, 1.0);
        if self.config.beta_anneal_steps == 0 {
            return 1.0;
        }
        let progress = (calls as f64 / self.config.beta_anneal_steps as f64).min(1.0);
        (1.0 - start).mul_add(progress, start)
    }

    /// Draws a stratified prioritized batch.
    ///
    /// The batch is split into `batch_size` equal segments of total priority
    /// with one draw per segment. Each call advances the `β` schedule.
    #[allow(clippy::cast_precision_loss)]
    pub fn sample(&self, batch_size: usize) -> Vec<SampledEvent> {
        let mut log = acquire_lock(&self.log, "episodic_log");
        if batch_size == 0 || log.len == 0 {
            return Vec::new();
        }
        let beta = self.beta_at(log.sample_calls);
        log.sample_calls = log.sample_calls.saturating_add(1);

        let total = log.tree.total();
        if total <= 0.0 {
            return Vec::new();
        }
        let n = log.len as f64;
        let segment = total / batch_size as f64;

        let mut draws = Vec::with_capacity(batch_size);
        for i in 0..batch_size {
            let offset = (i as f64 + log.uniform()) * segment;
            let slot = log.tree.find(offset.min(total));
            let Some(event) = log.slots[slot].clone() else {
                continue;
            };
            let probability = log.tree.get(slot) / total;
            let weight = (n * probability).powf(-beta);
            draws.push(SampledEvent {
                event,
                probability,
                weight,
            });
        }

        let max_weight = draws.iter().map(|d| d.weight).fold(0.0f64, f64::max);
        if max_weight > 0.0 {
            for draw in &mut draws {
                draw.weight /= max_weight;
            }
        }
        metrics::counter!("episodic_samples_total").increment(draws.len() as u64);
        draws
    }

    /// Replaces priorities with fresh prediction errors.
    ///
    /// Ids no longer in memory are ignored.
    pub fn update_priorities(&self, errors: &[(Uuid, f64)]) {
        let mut log = acquire_lock(&self.log, "episodic_log");
        for (id, error) in errors {
            if let Some(&slot) = log.slot_of.get(id) {
                let priority = Self::priority_for(&self.config, *error);
                log.tree.set(slot, priority);
            }
        }
    }

    /// Returns an event's current sampling probability.
    #[must_use]
    pub fn probability_of(&self, id: &Uuid) -> Option<f64> {
        let log = acquire_lock(&self.log, "episodic_log");
        let slot = *log.slot_of.get(id)?;
        let total = log.tree.total();
        (total > 0.0).then(|| log.tree.get(slot) / total)
    }

    /// Removes in-memory events older than `cutoff`. Returns the number
    /// removed, or the number that would be removed when `dry_run`.
    pub fn prune_memory(&self, cutoff: DateTime<Utc>, dry_run: bool) -> usize {
        let mut log = acquire_lock(&self.log, "episodic_log");
        let expired: Vec<usize> = log
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, e)| e.as_ref().filter(|e| e.timestamp < cutoff).map(|_| slot))
            .collect();
        if !dry_run {
            for slot in &expired {
                log.clear_slot(*slot);
            }
        }
        expired.len()
    }

    /// Returns the durable backend, if any.
    #[must_use]
    pub fn backend(&self) -> Option<&Arc<dyn EpisodicBackend>> {
        self.backend.as_ref()
    }

    /// Spawns the background flusher.
    ///
    /// Flushes on the configured interval, when the pending count reaches
    /// `flush_batch_size`, and once more when `shutdown` flips to `true`.
    pub fn spawn_flusher(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(store.config.flush_interval_ms.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {},
                    () = store.flush_wanted.notified() => {},
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            Self::flush_blocking(&store).await;
                            break;
                        }
                        continue;
                    },
                }
                Self::flush_blocking(&store).await;
            }
            tracing::debug!("Episodic flusher stopped");
        })
    }

    async fn flush_blocking(store: &Arc<Self>) {
        let store = Arc::clone(store);
        if let Err(e) = tokio::task::spawn_blocking(move || store.flush()).await {
            tracing::warn!(error = %e, "Episodic flush task failed");
        }
    }
}
