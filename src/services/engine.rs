//! Engine facade.
//!
//! [`CapabilityEngine`] owns every component and is the one type an
//! orchestrator talks to:
//!
//! | Call | Path |
//! |------|------|
//! | [`search`](CapabilityEngine::search) | embedding → hybrid search |
//! | [`suggest_path`](CapabilityEngine::suggest_path) | goal resolution → planner → scorer |
//! | [`next_step`](CapabilityEngine::next_step) | one-hop candidates → scorer → threshold |
//! | [`record_outcome`](CapabilityEngine::record_outcome) | episodic store + threshold queue |
//!
//! Queries never wait for training or persistence. Background work runs on
//! tokio tasks started by [`spawn_background`](CapabilityEngine::spawn_background).

use super::hybrid_search::HybridSearch;
use super::planner::HyperpathPlanner;
use super::scorer::{MultiHeadScorer, ScoreContext};
use super::sync::{ActionCatalog, ObservedExecution, SyncService, SyncStats};
use super::threshold::ThresholdManager;
use super::training::{TrainingPass, TrainingService};
use crate::config::EngineConfig;
use crate::embedding::{BulkheadEmbedder, CachedEmbedder, Embedder, HashEmbedder};
use crate::gc::{EpisodicRetentionCollector, RetentionGcResult};
use crate::models::{
    ContextKey, EpisodicEvent, GoalSpec, NextStepCandidate, NextStepResponse, NextStepSuggestion,
    NodeId, Outcome, PlanOutcome, PlanResult, PredictionAux, ScoredCandidate, SearchResponse,
};
use crate::observability::ensure_query_context;
use crate::storage::locks::acquire_lock;
use crate::storage::traits::{EpisodicBackend, GraphPersistence, ThresholdBackend};
use crate::storage::{
    BatchReport, EpisodicStore, GraphListener, GraphSnapshot, GraphStore, SqliteEpisodicBackend,
    SqliteGraphPersistence, SqliteThresholdBackend,
};
use crate::{Error, Result};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Search hits considered when resolving a text goal.
const GOAL_CANDIDATES: usize = 5;

/// Search hits offered when a context has no one-hop candidates.
const NEXT_STEP_SEARCH_LIMIT: usize = 10;

/// Recent predictions remembered for outcome attribution.
const PREDICTION_CACHE_CAPACITY: usize = 4_096;

type PredictionKey = (String, NodeId);

/// Durable backends opened from the data directory.
struct Durable {
    graph: Arc<SqliteGraphPersistence>,
    thresholds: Arc<dyn ThresholdBackend>,
    episodic: Arc<dyn EpisodicBackend>,
}

/// Capability graph and hyperpath suggestion engine.
pub struct CapabilityEngine {
    config: EngineConfig,
    graph: Arc<GraphStore>,
    embedder: Arc<dyn Embedder>,
    search: HybridSearch,
    planner: HyperpathPlanner,
    scorer: Arc<MultiHeadScorer>,
    thresholds: Arc<ThresholdManager>,
    episodic: Arc<EpisodicStore>,
    sync: SyncService,
    training: Arc<TrainingService>,
    retention: Arc<EpisodicRetentionCollector>,
    persistence: Option<Arc<SqliteGraphPersistence>>,
    predictions: Mutex<LruCache<PredictionKey, PredictionAux>>,
}

impl std::fmt::Debug for CapabilityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityEngine")
            .field("graph_version", &self.graph.version())
            .field("planner", &self.planner)
            .field("scorer", &self.scorer)
            .field("durable", &self.persistence.is_some())
            .finish_non_exhaustive()
    }
}

impl CapabilityEngine {
    /// Creates an engine with no durable state and the built-in hash
    /// embedder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the configuration is invalid.
    pub fn in_memory(mut config: EngineConfig) -> Result<Self> {
        config.storage.data_dir = None;
        let dimensions = match (config.embedding.dimensions, config.graph.embedding_dimensions) {
            (0, 0) => crate::embedding::DEFAULT_DIMENSIONS,
            (0, graph) => graph,
            (embedding, _) => embedding,
        };
        Self::open(config, Arc::new(HashEmbedder::with_dimensions(dimensions)))
    }

    /// Creates an engine around an embedding provider.
    ///
    /// With a data directory configured, the graph, thresholds and episodic
    /// events are loaded from `capgraph.db` there and written through on
    /// every change. Persisted records that fail validation are logged and
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the configuration is invalid or
    /// disagrees with the embedder's width, or an error if the database
    /// cannot be opened.
    #[instrument(
        name = "capgraph.engine.open",
        skip(config, embedder),
        fields(component = "engine", operation = "open", durable = config.storage.data_dir.is_some())
    )]
    pub fn open(mut config: EngineConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let width = embedder.dimensions();
        if config.embedding.dimensions != 0 && config.embedding.dimensions != width {
            return Err(Error::InvalidInput(format!(
                "embedder produces {width} dimensions, configuration expects {}",
                config.embedding.dimensions
            )));
        }
        config.graph.embedding_dimensions = width;
        config.validate()?;

        let durable = match config.storage.database_path() {
            Some(path) => Some(Self::open_durable(&path)?),
            None => None,
        };

        let graph = match &durable {
            Some(durable) => {
                let persisted = durable.graph.load()?;
                let (store, skipped) = GraphStore::restore(
                    config.graph.clone(),
                    persisted.nodes,
                    persisted.edges,
                    persisted.version,
                );
                info!(
                    version = store.version(),
                    nodes = store.snapshot().node_count(),
                    skipped = skipped + persisted.skipped,
                    "Graph restored"
                );
                Arc::new(store)
            },
            None => Arc::new(GraphStore::new(config.graph.clone())),
        };
        if let Some(durable) = &durable {
            graph.subscribe(Arc::clone(&durable.graph) as Arc<dyn GraphListener>);
        }

        let episodic = Arc::new(EpisodicStore::new(
            config.episodic.clone(),
            durable.as_ref().map(|d| Arc::clone(&d.episodic)),
        ));
        let rehydrated = episodic.rehydrate()?;

        let thresholds = Arc::new(ThresholdManager::new(
            config.threshold.clone(),
            durable.as_ref().map(|d| Arc::clone(&d.thresholds)),
        )?);
        let loaded = thresholds.load()?;
        debug!(rehydrated, thresholds = loaded, "Learned state loaded");

        let provider: Arc<dyn Embedder> = Arc::new(CachedEmbedder::new(
            Arc::new(BulkheadEmbedder::new(embedder, config.embedding.bulkhead.clone())),
            config.embedding.cache_capacity,
        ));

        let search = HybridSearch::new(Arc::clone(&graph), Arc::clone(&provider), config.search.clone());
        let planner = HyperpathPlanner::new(Arc::clone(&graph), config.planner.clone());
        let scorer = Arc::new(MultiHeadScorer::new(config.scorer.clone(), Arc::clone(&episodic)));
        let sync = SyncService::new(Arc::clone(&graph), Arc::clone(&provider));
        let training = Arc::new(TrainingService::new(
            config.training.clone(),
            Arc::clone(&graph),
            Arc::clone(&episodic),
            Arc::clone(&scorer),
            Arc::clone(&thresholds),
        ));
        let retention = Arc::new(EpisodicRetentionCollector::new(
            Arc::clone(&episodic),
            config.retention.clone(),
        ));
        let capacity = NonZeroUsize::new(PREDICTION_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            config,
            graph,
            embedder: provider,
            search,
            planner,
            scorer,
            thresholds,
            episodic,
            sync,
            training,
            retention,
            persistence: durable.map(|d| d.graph),
            predictions: Mutex::new(LruCache::new(capacity)),
        })
    }

    fn open_durable(path: &Path) -> Result<Durable> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| Error::OperationFailed {
                operation: "create_data_dir".to_string(),
                cause: e.to_string(),
            })?;
        }
        Ok(Durable {
            graph: Arc::new(SqliteGraphPersistence::new(path)?),
            thresholds: Arc::new(SqliteThresholdBackend::new(path)?),
            episodic: Arc::new(SqliteEpisodicBackend::new(path)?),
        })
    }

    /// Returns the effective configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the graph store, for administrative edits.
    #[must_use]
    pub const fn graph(&self) -> &Arc<GraphStore> {
        &self.graph
    }

    /// Returns the current graph snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        self.graph.snapshot()
    }

    /// Returns the planner.
    #[must_use]
    pub const fn planner(&self) -> &HyperpathPlanner {
        &self.planner
    }

    /// Returns the scorer.
    #[must_use]
    pub const fn scorer(&self) -> &Arc<MultiHeadScorer> {
        &self.scorer
    }

    /// Returns the threshold manager.
    #[must_use]
    pub const fn thresholds(&self) -> &Arc<ThresholdManager> {
        &self.thresholds
    }

    /// Returns the episodic store.
    #[must_use]
    pub const fn episodic(&self) -> &Arc<EpisodicStore> {
        &self.episodic
    }

    /// Upserts the catalog's actions as one graph version.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be listed or the batch fails.
    pub fn sync_actions(&self, catalog: &dyn ActionCatalog) -> Result<SyncStats> {
        let _query = ensure_query_context();
        self.sync.sync_catalog(catalog)
    }

    /// Records an observed execution trace as one graph version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty trace.
    pub fn observe_execution(&self, execution: &ObservedExecution) -> Result<BatchReport> {
        let _query = ensure_query_context();
        self.sync.sync_execution(execution)
    }

    /// Hybrid search over the current graph.
    pub fn search(&self, query: &str, top_k: usize, context_nodes: &[NodeId]) -> SearchResponse {
        let _query = ensure_query_context();
        self.search.search(query, top_k, context_nodes)
    }

    /// Plans a route from `starts` to a goal.
    ///
    /// A text goal resolves through hybrid search: the best-ranked candidate
    /// the planner can reach becomes the goal. If no candidate is reachable
    /// the result is `NotFound` and `resolved_goal` names the top candidate.
    /// The plan confidence is the mean fused score of the steps after the
    /// start.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the goal node is unknown or no
    /// start node exists.
    #[instrument(
        name = "capgraph.engine.suggest_path",
        skip(self, goal, starts),
        fields(
            query_id = tracing::field::Empty,
            component = "engine",
            operation = "suggest_path",
            starts = starts.len(),
            deadline_ms = crate::gc::duration_to_millis(deadline)
        )
    )]
    pub fn suggest_path(
        &self,
        goal: &GoalSpec,
        starts: &[NodeId],
        deadline: Duration,
    ) -> Result<PlanOutcome> {
        let _query = ensure_query_context();
        if let Some(query_id) = crate::observability::current_query_id() {
            tracing::Span::current().record("query_id", query_id.as_str());
        }
        let started = Instant::now();

        let outcome = match goal {
            GoalSpec::Node(id) => {
                let result = self.planner.suggest_path(id, starts, deadline)?;
                let snapshot = self.graph.snapshot();
                let goal_embedding = snapshot.node(id).and_then(|n| n.embedding.clone());
                PlanOutcome {
                    confidence: self.plan_confidence(
                        &snapshot,
                        &result,
                        goal_embedding.as_deref(),
                        starts,
                    ),
                    result,
                    resolved_goal: Some(id.clone()),
                    degraded: None,
                }
            },
            GoalSpec::Text(text) => self.suggest_for_text(text, starts, deadline, started)?,
        };

        metrics::counter!("engine_plans_total", "result" => outcome.result.as_str()).increment(1);
        Ok(outcome)
    }

    fn suggest_for_text(
        &self,
        text: &str,
        starts: &[NodeId],
        deadline: Duration,
        started: Instant,
    ) -> Result<PlanOutcome> {
        if starts.is_empty() {
            return Err(Error::InvalidInput(
                "suggest_path needs at least one start node".to_string(),
            ));
        }
        let snapshot = self.graph.snapshot();
        let embedding = self.embedder.embed(text);
        let response = self.search.search_snapshot(
            &snapshot,
            embedding.as_deref().map_err(ToString::to_string),
            GOAL_CANDIDATES,
            starts,
        );

        let mut resolved: Option<(NodeId, PlanResult)> = None;
        let mut partial: Option<(NodeId, PlanResult)> = None;
        for candidate in &response.candidates {
            let remaining = deadline.saturating_sub(started.elapsed());
            match self.planner.suggest_path(&candidate.node_id, starts, remaining)? {
                result @ PlanResult::Found(_) => {
                    resolved = Some((candidate.node_id.clone(), result));
                    break;
                },
                result @ PlanResult::Partial(_) => {
                    if partial.is_none() {
                        partial = Some((candidate.node_id.clone(), result));
                    }
                    if remaining.is_zero() {
                        break;
                    }
                },
                PlanResult::NotFound => {},
            }
        }

        let (resolved_goal, result) = match resolved.or(partial) {
            Some((goal, result)) => (Some(goal), result),
            None => (
                response.candidates.first().map(|c| c.node_id.clone()),
                PlanResult::NotFound,
            ),
        };
        debug!(
            goal = ?resolved_goal,
            result = result.as_str(),
            candidates = response.candidates.len(),
            "Text goal resolved"
        );
        Ok(PlanOutcome {
            confidence: self.plan_confidence(
                &snapshot,
                &result,
                embedding.as_deref().ok(),
                starts,
            ),
            result,
            resolved_goal,
            degraded: response.degraded,
        })
    }

    fn plan_confidence(
        &self,
        snapshot: &GraphSnapshot,
        result: &PlanResult,
        goal_embedding: Option<&[f32]>,
        starts: &[NodeId],
    ) -> Option<f32> {
        let plan = result.plan()?;
        let steps: Vec<NodeId> = plan.steps.iter().skip(1).map(|s| s.node_id.clone()).collect();
        let ctx = ScoreContext {
            goal_embedding,
            context_nodes: starts,
            context_key: None,
        };
        let scored = self.scorer.score(snapshot, &steps, &ctx);
        if scored.is_empty() {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let n = scored.len() as f32;
        Some(scored.iter().map(|s| s.fused_score).sum::<f32>() / n)
    }

    /// Ranks what to do next in a context.
    ///
    /// Candidates are one hyperedge hop from `context_nodes`. When there are
    /// none and a goal is given, the goal's search hits stand in. Each is
    /// scored, compared with the context's threshold, and remembered so a
    /// later outcome for the same action carries the prediction details.
    #[instrument(
        name = "capgraph.engine.next_step",
        skip(self, context_nodes, goal),
        fields(
            query_id = tracing::field::Empty,
            component = "engine",
            operation = "next_step",
            context = %context_key,
            has_goal = goal.is_some()
        )
    )]
    pub fn next_step(
        &self,
        context_nodes: &[NodeId],
        goal: Option<&str>,
        context_key: &ContextKey,
    ) -> NextStepResponse {
        let _query = ensure_query_context();
        if let Some(query_id) = crate::observability::current_query_id() {
            tracing::Span::current().record("query_id", query_id.as_str());
        }
        let snapshot = self.graph.snapshot();
        let (goal_embedding, degraded) = self.embed_goal(goal);

        let mut candidates = HyperpathPlanner::next_step_on(&snapshot, context_nodes);
        if candidates.is_empty()
            && let Some(text) = goal
        {
            let embedding = goal_embedding
                .as_deref()
                .ok_or_else(|| degraded.as_ref().map_or_else(String::new, ToString::to_string));
            let hits = self.search.search_snapshot(
                &snapshot,
                embedding,
                NEXT_STEP_SEARCH_LIMIT,
                context_nodes,
            );
            debug!(goal = text, hits = hits.candidates.len(), "No one-hop candidates, using search");
            candidates = hits
                .candidates
                .into_iter()
                .filter(|hit| !context_nodes.contains(&hit.node_id))
                .map(|hit| NextStepCandidate {
                    node_id: hit.node_id,
                    via: None,
                    prior: hit.score,
                })
                .collect();
        }

        let ids: Vec<NodeId> = candidates.iter().map(|c| c.node_id.clone()).collect();
        let ctx = ScoreContext {
            goal_embedding: goal_embedding.as_deref(),
            context_nodes,
            context_key: Some(context_key.as_str()),
        };
        let scored = self.scorer.score(&snapshot, &ids, &ctx);
        self.remember(context_key, &scored, goal_embedding.as_deref(), context_nodes);

        let threshold = self.thresholds.get_threshold(context_key);
        let suggestions: Vec<NextStepSuggestion> = scored
            .into_iter()
            .filter_map(|score| {
                let candidate = candidates
                    .iter()
                    .find(|c| c.node_id == score.candidate_id)?
                    .clone();
                Some(NextStepSuggestion {
                    candidate,
                    confidence: score.fused_score,
                    per_head: score.per_head,
                    meets_threshold: f64::from(score.fused_score) >= threshold,
                })
            })
            .collect();

        metrics::counter!("engine_next_step_total").increment(1);
        NextStepResponse {
            suggestions,
            threshold,
            degraded,
        }
    }

    /// Scores candidates directly.
    ///
    /// Without a goal, or when the goal cannot be embedded, the semantic
    /// head is left out.
    pub fn score(
        &self,
        goal: Option<&str>,
        candidates: &[NodeId],
        context_nodes: &[NodeId],
        context_key: &ContextKey,
    ) -> Vec<ScoredCandidate> {
        let _query = ensure_query_context();
        let snapshot = self.graph.snapshot();
        let (goal_embedding, _) = self.embed_goal(goal);
        let ctx = ScoreContext {
            goal_embedding: goal_embedding.as_deref(),
            context_nodes,
            context_key: Some(context_key.as_str()),
        };
        let scored = self.scorer.score(&snapshot, candidates, &ctx);
        self.remember(context_key, &scored, goal_embedding.as_deref(), context_nodes);
        scored
    }

    fn embed_goal(&self, goal: Option<&str>) -> (Option<Vec<f32>>, Option<crate::models::DegradedReason>) {
        match goal.map(|text| self.embedder.embed(text)) {
            None => (None, None),
            Some(Ok(embedding)) => (Some(embedding), None),
            Some(Err(e)) => {
                warn!(error = %e, "Goal embedding unavailable, scoring without semantic head");
                metrics::counter!("engine_degraded_total").increment(1);
                (
                    None,
                    Some(crate::models::DegradedReason::EmbeddingUnavailable(e.to_string())),
                )
            },
        }
    }

    fn remember(
        &self,
        context_key: &ContextKey,
        scored: &[ScoredCandidate],
        goal_embedding: Option<&[f32]>,
        context_nodes: &[NodeId],
    ) {
        if scored.is_empty() {
            return;
        }
        let mut cache = acquire_lock(&self.predictions, "engine_predictions");
        for score in scored {
            cache.put(
                (context_key.as_str().to_string(), score.candidate_id.clone()),
                PredictionAux {
                    goal_embedding: goal_embedding.map(<[f32]>::to_vec),
                    head_scores: score.per_head,
                    context_nodes: context_nodes.to_vec(),
                },
            );
        }
    }

    /// Returns the confidence threshold for a context.
    pub fn get_threshold(&self, context_key: &ContextKey) -> f64 {
        self.thresholds.get_threshold(context_key)
    }

    /// Records the outcome of an action.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the confidence is outside `[0, 1]`
    /// or the context key is empty.
    pub fn record_outcome(
        &self,
        context_key: &ContextKey,
        action_id: &NodeId,
        predicted_confidence: f32,
        outcome: Outcome,
    ) -> Result<Uuid> {
        if !(0.0..=1.0).contains(&predicted_confidence) {
            return Err(Error::InvalidInput(format!(
                "predicted confidence {predicted_confidence} is outside [0, 1]"
            )));
        }
        self.report_outcome(EpisodicEvent::new(
            context_key.as_str(),
            action_id.clone(),
            predicted_confidence,
            outcome,
        ))
    }

    /// Accepts a fully formed event. This is the only write path into the
    /// episodic store.
    ///
    /// An event without an auxiliary payload gets the details of the most
    /// recent matching prediction, if one is remembered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty context or action, or an
    /// error if the store has shut down.
    #[instrument(
        name = "capgraph.engine.report_outcome",
        skip(self, event),
        fields(
            component = "engine",
            operation = "report_outcome",
            context = %event.context_id,
            action = %event.action_id,
            outcome = event.actual_outcome.as_str()
        )
    )]
    pub fn report_outcome(&self, mut event: EpisodicEvent) -> Result<Uuid> {
        if event.context_id.trim().is_empty() {
            return Err(Error::InvalidInput("context key must not be empty".to_string()));
        }
        if event.action_id.as_str().trim().is_empty() {
            return Err(Error::InvalidInput("action id must not be empty".to_string()));
        }
        if event.aux_payload.is_null() {
            let key = (event.context_id.clone(), event.action_id.clone());
            let cached = acquire_lock(&self.predictions, "engine_predictions").pop(&key);
            if let Some(aux) = cached {
                event.aux_payload = aux.to_value();
            }
        }

        let id = event.id;
        let key = ContextKey::new(event.context_id.clone());
        let outcome = event.actual_outcome;
        self.episodic.record(event)?;
        self.thresholds.observe(&key, outcome);

        metrics::counter!("engine_outcomes_total", "outcome" => outcome.as_str()).increment(1);
        Ok(id)
    }

    /// Moves buffered outcomes into the episodic log. Returns the count.
    pub fn flush(&self) -> usize {
        self.episodic.flush()
    }

    /// Runs one training pass now.
    pub fn train_once(&self) -> TrainingPass {
        self.training.run_once()
    }

    /// Runs one retention pass now.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable backend fails.
    pub fn run_retention(&self, dry_run: bool) -> Result<RetentionGcResult> {
        self.retention.collect(dry_run)
    }

    /// Writes a full snapshot to the database, if durable.
    ///
    /// Commits are already written through; this repairs the stored copy
    /// after a write-through failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn save_graph(&self) -> Result<()> {
        match &self.persistence {
            Some(persistence) => persistence.save_snapshot(&self.graph.snapshot()),
            None => Ok(()),
        }
    }

    /// Starts the episodic flusher, the training loop and the retention
    /// loop. Must be called inside a tokio runtime.
    pub fn spawn_background(&self) -> BackgroundHandle {
        let (shutdown, receiver) = watch::channel(false);
        let mut tasks = vec![self.episodic.spawn_flusher(receiver.clone())];
        if self.config.training.enabled {
            tasks.push(self.training.spawn(receiver.clone()));
        }
        if self.config.retention.enabled {
            tasks.push(spawn_retention(
                Arc::clone(&self.retention),
                Duration::from_secs(self.config.retention.interval_secs.max(1)),
                receiver,
            ));
        }
        info!(tasks = tasks.len(), "Background tasks started");
        BackgroundHandle { shutdown, tasks }
    }
}

fn spawn_retention(
    collector: Arc<EpisodicRetentionCollector>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
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
            let worker = Arc::clone(&collector);
            match tokio::task::spawn_blocking(move || worker.collect(false)).await {
                Ok(Ok(_)) => {},
                Ok(Err(e)) => warn!(error = %e, "Scheduled retention failed"),
                Err(e) => warn!(error = %e, "Scheduled retention task failed"),
            }
        }
        debug!("Retention loop stopped");
    })
}

/// Handle to the engine's background tasks.
#[derive(Debug)]
pub struct BackgroundHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BackgroundHandle {
    /// Returns the number of running tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Signals every task to stop and waits for them. The episodic flusher
    /// drains the buffer one last time before it exits.
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            debug!("Background tasks already stopped");
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Background tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Edge, EdgeKind, EdgeSource, StructureEdge, StructureEdgeKind};
    use crate::services::sync::{ActionDescriptor, StaticCatalog};

    fn catalog() -> StaticCatalog {
        StaticCatalog::new(vec![
            ActionDescriptor::tool("fetch_page").with_hint("fetch a web page over http"),
            ActionDescriptor::tool("extract_links").with_hint("extract links from html"),
            ActionDescriptor::tool("summarize_text").with_hint("summarize text into bullet points"),
            ActionDescriptor::tool("send_email").with_hint("send an email message"),
            ActionDescriptor::capability(
                "crawl",
                vec![NodeId::new("fetch_page"), NodeId::new("extract_links")],
            )
            .with_hint("crawl a website")
            .with_structure_edge(StructureEdge::new(
                "fetch_page",
                "extract_links",
                StructureEdgeKind::Provides,
            )),
        ])
    }

    fn engine() -> CapabilityEngine {
        let mut config = EngineConfig::default();
        config.embedding.dimensions = 64;
        config.threshold = config.threshold.with_batch_size(4);
        let engine = CapabilityEngine::in_memory(config).unwrap();
        engine.sync_actions(&catalog()).unwrap();
        engine
    }

    fn link(engine: &CapabilityEngine, from: &str, to: &str) {
        engine
            .graph()
            .add_edge(Edge::new(from, to, EdgeKind::Provides, EdgeSource::Observed))
            .unwrap();
    }

    #[test]
    fn test_search_finds_hinted_action() {
        let engine = engine();
        let response = engine.search("summarize text", 3, &[]);
        assert!(!response.is_degraded());
        assert_eq!(response.candidates[0].node_id, NodeId::new("summarize_text"));
    }

    #[test]
    fn test_suggest_path_by_node() {
        let engine = engine();
        link(&engine, "fetch_page", "summarize_text");
        let outcome = engine
            .suggest_path(
                &GoalSpec::node("summarize_text"),
                &[NodeId::new("fetch_page")],
                Duration::from_secs(1),
            )
            .unwrap();
        let plan = outcome.result.plan().unwrap();
        assert!(outcome.result.is_found());
        assert_eq!(
            plan.node_ids(),
            vec![&NodeId::new("fetch_page"), &NodeId::new("summarize_text")]
        );
        let confidence = outcome.confidence.unwrap();
        assert!((0.0..=1.0).contains(&confidence));
    }

    #[test]
    fn test_suggest_path_by_text_resolves_reachable_goal() {
        let engine = engine();
        link(&engine, "extract_links", "send_email");
        let outcome = engine
            .suggest_path(
                &GoalSpec::text("send an email"),
                &[NodeId::new("extract_links")],
                Duration::from_secs(1),
            )
            .unwrap();
        assert_eq!(outcome.resolved_goal, Some(NodeId::new("send_email")));
        assert!(outcome.result.is_found());
        assert!(outcome.degraded.is_none());
    }

    #[test]
    fn test_text_goal_needs_start() {
        let engine = engine();
        let result = engine.suggest_path(&GoalSpec::text("email"), &[], Duration::from_secs(1));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_next_step_compares_with_threshold() {
        let engine = engine();
        link(&engine, "extract_links", "summarize_text");
        let key = ContextKey::new("research");
        let response = engine.next_step(&[NodeId::new("extract_links")], Some("summarize"), &key);
        assert!((response.threshold - 0.92).abs() < 1e-9);
        let ids: Vec<&NodeId> = response.suggestions.iter().map(|s| &s.candidate.node_id).collect();
        assert!(ids.contains(&&NodeId::new("summarize_text")));
        assert!(ids.contains(&&NodeId::new("crawl")));
        for suggestion in &response.suggestions {
            assert_eq!(
                suggestion.meets_threshold,
                f64::from(suggestion.confidence) >= response.threshold
            );
        }
    }

    #[test]
    fn test_next_step_without_context_uses_search() {
        let engine = engine();
        let response = engine.next_step(&[], Some("send an email message"), &ContextKey::new("mail"));
        assert_eq!(
            response.suggestions.first().map(|s| &s.candidate.node_id),
            Some(&NodeId::new("send_email"))
        );
    }

    #[test]
    fn test_outcome_carries_prediction() {
        let engine = engine();
        let key = ContextKey::new("mail");
        let scored = engine.score(Some("send email"), &[NodeId::new("send_email")], &[], &key);
        assert_eq!(scored.len(), 1);

        engine
            .record_outcome(&key, &NodeId::new("send_email"), scored[0].fused_score, Outcome::Success)
            .unwrap();
        engine.flush();
        let events = engine.episodic().by_context("mail", 10);
        let aux = events[0].prediction().unwrap();
        assert_eq!(aux.head_scores, scored[0].per_head);
        assert!(aux.goal_embedding.is_some());
    }

    #[test]
    fn test_record_outcome_validates_confidence() {
        let engine = engine();
        let key = ContextKey::new("mail");
        let action = NodeId::new("send_email");
        assert!(matches!(
            engine.record_outcome(&key, &action, 1.5, Outcome::Success),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            engine.record_outcome(&key, &action, f32::NAN, Outcome::Success),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            engine.record_outcome(&ContextKey::new(" "), &action, 0.5, Outcome::Success),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_outcomes_move_threshold() {
        let engine = engine();
        let key = ContextKey::new("mail");
        let before = engine.get_threshold(&key);
        for _ in 0..20 {
            engine
                .record_outcome(&key, &NodeId::new("send_email"), 0.9, Outcome::Success)
                .unwrap();
        }
        assert!(engine.get_threshold(&key) < before);
    }

    #[test]
    fn test_train_once_publishes_model() {
        let engine = engine();
        let key = ContextKey::new("mail");
        for i in 0..8 {
            let outcome = if i % 3 == 0 { Outcome::Failure } else { Outcome::Success };
            engine
                .record_outcome(&key, &NodeId::new("send_email"), 0.6, outcome)
                .unwrap();
        }
        let pass = engine.train_once();
        assert_eq!(pass.flushed, 8);
        assert!(pass.scorer.is_some());
        assert_eq!(engine.scorer().model().version, 1);
    }

    #[test]
    fn test_durable_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default().with_data_dir(dir.path());
        config.embedding.dimensions = 64;
        config.threshold = config.threshold.with_batch_size(4);
        let key = ContextKey::new("mail");

        let (version, threshold) = {
            let engine = CapabilityEngine::open(
                config.clone(),
                Arc::new(HashEmbedder::with_dimensions(64)),
            )
            .unwrap();
            engine.sync_actions(&catalog()).unwrap();
            link(&engine, "fetch_page", "summarize_text");
            for _ in 0..4 {
                engine
                    .record_outcome(&key, &NodeId::new("send_email"), 0.9, Outcome::Success)
                    .unwrap();
            }
            engine.flush();
            assert!(engine.persistence.is_some());
            (engine.graph().version(), engine.get_threshold(&key))
        };

        let engine =
            CapabilityEngine::open(config, Arc::new(HashEmbedder::with_dimensions(64))).unwrap();
        assert_eq!(engine.graph().version(), version);
        assert!(engine.snapshot().contains(&NodeId::new("crawl")));
        assert!((engine.get_threshold(&key) - threshold).abs() < 1e-9);
        assert_eq!(engine.episodic().len(), 4);
    }

    #[test]
    fn test_embedder_width_mismatch_rejected() {
        let mut config = EngineConfig::default();
        config.embedding.dimensions = 32;
        let result = CapabilityEngine::open(config, Arc::new(HashEmbedder::with_dimensions(64)));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_background_tasks_stop_and_flush() {
        let mut config = EngineConfig::default();
        config.embedding.dimensions = 64;
        config.episodic = config.episodic.with_flush_interval_ms(60_000).with_flush_batch_size(1_000);
        let engine = CapabilityEngine::in_memory(config).unwrap();
        engine.sync_actions(&catalog()).unwrap();
        let handle = engine.spawn_background();
        assert_eq!(handle.task_count(), 3);

        engine
            .record_outcome(&ContextKey::new("mail"), &NodeId::new("send_email"), 0.5, Outcome::Success)
            .unwrap();
        handle.shutdown().await;
        assert_eq!(engine.episodic().len(), 1);
    }
}
