//! Multi-head candidate scorer.
//!
//! Three heads score each candidate and a fusion stage combines them:
//!
//! | Head | Signal | Missing when |
//! |------|--------|--------------|
//! | Semantic | Goal/candidate similarity, raw or through a learned projection | No goal embedding or no candidate embedding |
//! | Structural | Centrality and community agreement with the context | Never |
//! | Temporal | Decayed success rate and co-occurrence from past outcomes | Never (0.5 without a context key) |
//!
//! The model is an immutable [`ScorerModel`] published behind an `Arc`.
//! Queries clone the pointer and never wait on training; the training pass
//! owns a separate mutable state and publishes a fresh model when it ends.
//!
//! Both learned pieces start cold. Until enough examples have been seen, the
//! semantic head uses raw cosine similarity and fusion is the plain mean of
//! the available heads.

mod fusion;
mod heads;
mod projection;

pub use fusion::{ContextFeatures, FEATURE_COUNT, Fusion, GateWeights, HEAD_COUNT};
pub use heads::{structural_head, temporal_head};
pub use projection::{BilinearProjection, sigmoid};

use crate::embedding::normalized_similarity;
use crate::models::{HeadScores, Node, NodeId, ScoredCandidate};
use crate::storage::locks::{acquire_lock, read_lock, write_lock};
use crate::storage::{EpisodicStore, GraphSnapshot, SampledEvent};
use chrono::Utc;
use serde::Deserialize;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// How temporal decay measures age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayScope {
    /// Age relative to the context's most recent event.
    #[default]
    PerContext,
    /// Age relative to wall-clock now.
    Global,
}

impl DecayScope {
    /// Parses a scope name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "per_context" | "context" => Some(Self::PerContext),
            "global" => Some(Self::Global),
            _ => None,
        }
    }
}

/// Scorer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    /// Shared-space dimensionality of the semantic projection.
    pub projection_dim: usize,
    /// Examples before the learned projection replaces raw similarity.
    pub min_projection_examples: u64,
    /// Examples before learned gates replace the mean.
    pub min_fusion_examples: u64,
    /// SGD step size for the projection.
    pub projection_learning_rate: f32,
    /// SGD step size for the gates.
    pub fusion_learning_rate: f32,
    /// Reference point for temporal decay.
    pub decay_scope: DecayScope,
    /// Temporal half-life in seconds.
    pub half_life_secs: f64,
    /// Recent events per context the temporal head reads.
    pub temporal_history_limit: usize,
    /// Seed for projection initialization.
    pub seed: u64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            projection_dim: 16,
            min_projection_examples: 200,
            min_fusion_examples: 50,
            projection_learning_rate: 0.05,
            fusion_learning_rate: 0.1,
            decay_scope: DecayScope::PerContext,
            half_life_secs: 86_400.0,
            temporal_history_limit: 256,
            seed: 0x5C0_4E,
        }
    }
}

impl ScorerConfig {
    /// Sets the warm-up example counts.
    #[must_use]
    pub const fn with_min_examples(mut self, projection: u64, fusion: u64) -> Self {
        self.min_projection_examples = projection;
        self.min_fusion_examples = fusion;
        self
    }

    /// Sets the decay scope.
    #[must_use]
    pub const fn with_decay_scope(mut self, scope: DecayScope) -> Self {
        self.decay_scope = scope;
        self
    }

    /// Sets the temporal half-life.
    #[must_use]
    pub const fn with_half_life_secs(mut self, secs: f64) -> Self {
        self.half_life_secs = secs;
        self
    }

    /// Applies environment variable overrides.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `CAPGRAPH_SCORER_DECAY_SCOPE` | `per_context` or `global` |
    /// | `CAPGRAPH_SCORER_HALF_LIFE_SECS` | Temporal half-life |
    /// | `CAPGRAPH_SCORER_PROJECTION_DIM` | Projection dimensionality |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("CAPGRAPH_SCORER_DECAY_SCOPE")
            && let Some(scope) = DecayScope::parse(&v)
        {
            self.decay_scope = scope;
        }
        if let Ok(v) = std::env::var("CAPGRAPH_SCORER_HALF_LIFE_SECS")
            && let Ok(parsed) = v.parse::<f64>()
        {
            self.half_life_secs = parsed;
        }
        if let Ok(v) = std::env::var("CAPGRAPH_SCORER_PROJECTION_DIM")
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.projection_dim = parsed.max(1);
        }
        self
    }
}

/// Semantic head stage.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SemanticHead {
    /// Cosine similarity mapped to `[0, 1]`.
    #[default]
    Raw,
    /// Learned bilinear projection.
    Projected(BilinearProjection),
}

impl SemanticHead {
    /// Scores a goal embedding against a candidate embedding.
    #[must_use]
    pub fn score(&self, goal: &[f32], candidate: &[f32]) -> f32 {
        match self {
            Self::Raw => normalized_similarity(goal, candidate),
            Self::Projected(projection) => projection
                .score(goal, candidate)
                .unwrap_or_else(|| normalized_similarity(goal, candidate)),
        }
    }
}

/// Immutable scorer parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScorerModel {
    /// Semantic head stage.
    pub semantic: SemanticHead,
    /// Fusion stage.
    pub fusion: Fusion,
    /// Incremented on every publication.
    pub version: u64,
}

/// Inputs shared by every candidate of one scoring call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreContext<'a> {
    /// Embedding of the goal text, if any.
    pub goal_embedding: Option<&'a [f32]>,
    /// Actions already invoked.
    pub context_nodes: &'a [NodeId],
    /// Context key whose outcomes feed the temporal head.
    pub context_key: Option<&'a str>,
}

/// Outcome of one training pass.
#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    /// Samples used.
    pub examples: usize,
    /// Samples that also trained the projection.
    pub projection_examples: usize,
    /// Mean importance-weighted loss.
    pub mean_loss: f64,
    /// Fresh prediction errors, for replay priorities.
    pub priorities: Vec<(Uuid, f64)>,
    /// Model version published by the pass.
    pub model_version: u64,
}

#[derive(Debug, Default)]
struct TrainingState {
    projection: Option<BilinearProjection>,
    gates: GateWeights,
    projection_examples: u64,
    fusion_examples: u64,
}

struct PreparedExample {
    id: Uuid,
    target: f32,
    heads: HeadScores,
    features: ContextFeatures,
    goal: Option<Vec<f32>>,
    candidate: Option<Vec<f32>>,
}

/// Multi-head scorer with learned fusion.
pub struct MultiHeadScorer {
    config: ScorerConfig,
    episodic: Arc<EpisodicStore>,
    model: RwLock<Arc<ScorerModel>>,
    training: Mutex<TrainingState>,
}

impl std::fmt::Debug for MultiHeadScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiHeadScorer")
            .field("config", &self.config)
            .field("model_version", &self.model().version)
            .finish_non_exhaustive()
    }
}

impl MultiHeadScorer {
    /// Creates a cold-start scorer reading outcomes from `episodic`.
    #[must_use]
    pub fn new(config: ScorerConfig, episodic: Arc<EpisodicStore>) -> Self {
        Self {
            config,
            episodic,
            model: RwLock::new(Arc::new(ScorerModel::default())),
            training: Mutex::new(TrainingState::default()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Returns the published model.
    #[must_use]
    pub fn model(&self) -> Arc<ScorerModel> {
        Arc::clone(&read_lock(&self.model, "scorer_model"))
    }

    fn context_events(&self, context_key: Option<&str>) -> Option<Vec<crate::models::EpisodicEvent>> {
        context_key.map(|key| self.episodic.by_context(key, self.config.temporal_history_limit))
    }

    fn heads_for(
        &self,
        snapshot: &GraphSnapshot,
        model: &ScorerModel,
        node: &Node,
        ctx: &ScoreContext<'_>,
        events: Option<&[crate::models::EpisodicEvent]>,
    ) -> HeadScores {
        let semantic = match (ctx.goal_embedding, node.embedding.as_deref()) {
            (Some(goal), Some(candidate)) => Some(model.semantic.score(goal, candidate)),
            _ => None,
        };
        let structural = structural_head(snapshot, &node.id, ctx.context_nodes);
        let temporal = events.map_or(0.5, |events| {
            temporal_head(
                events,
                &node.id,
                ctx.context_nodes,
                self.config.decay_scope,
                self.config.half_life_secs,
                Utc::now(),
            )
        });
        HeadScores {
            semantic,
            structural,
            temporal,
        }
    }

    /// Scores candidates against the published model.
    ///
    /// Unknown candidates are skipped. Results are ordered by fused score,
    /// then id.
    #[instrument(
        name = "capgraph.scorer.score",
        skip(self, snapshot, candidates, ctx),
        fields(
            query_id = tracing::field::Empty,
            component = "scorer",
            operation = "score",
            candidates = candidates.len()
        )
    )]
    pub fn score(
        &self,
        snapshot: &GraphSnapshot,
        candidates: &[NodeId],
        ctx: &ScoreContext<'_>,
    ) -> Vec<ScoredCandidate> {
        if let Some(query_id) = crate::observability::current_query_id() {
            tracing::Span::current().record("query_id", query_id.as_str());
        }
        let model = self.model();
        let events = self.context_events(ctx.context_key);

        let mut scored: Vec<ScoredCandidate> = Vec::with_capacity(candidates.len());
        for id in candidates {
            let Some(node) = snapshot.node(id) else {
                debug!(candidate = %id, "Skipping unknown candidate");
                continue;
            };
            if scored.iter().any(|s| s.candidate_id == *id) {
                continue;
            }
            let heads = self.heads_for(snapshot, &model, node, ctx, events.as_deref());
            let features = ContextFeatures::new(
                ctx.goal_embedding.is_some(),
                ctx.context_nodes.len(),
                node.is_capability(),
            );
            scored.push(ScoredCandidate {
                candidate_id: id.clone(),
                fused_score: model.fusion.fuse(&heads, &features),
                per_head: heads,
            });
        }
        scored.sort_by(|a, b| {
            b.fused_score
                .total_cmp(&a.fused_score)
                .then_with(|| a.candidate_id.cmp(&b.candidate_id))
        });
        metrics::counter!("scorer_candidates_scored_total").increment(scored.len() as u64);
        scored
    }

    fn prepare(
        &self,
        snapshot: &GraphSnapshot,
        model: &ScorerModel,
        sample: &SampledEvent,
    ) -> Option<PreparedExample> {
        let event = &sample.event;
        let node = snapshot.node(&event.action_id);
        let candidate = node.and_then(|n| n.embedding.clone());
        let is_capability = node.is_some_and(Node::is_capability);

        let (goal, context_size, heads) = if let Some(aux) = event.prediction() {
            (aux.goal_embedding, aux.context_nodes.len(), aux.head_scores)
        } else {
            let node = node?;
            let events = self.context_events(Some(&event.context_id));
            let ctx = ScoreContext {
                goal_embedding: None,
                context_nodes: &[],
                context_key: Some(&event.context_id),
            };
            (None, 0, self.heads_for(snapshot, model, node, &ctx, events.as_deref()))
        };

        Some(PreparedExample {
            id: event.id,
            target: event.actual_outcome.as_f32(),
            features: ContextFeatures::new(goal.is_some(), context_size, is_capability),
            heads,
            goal,
            candidate,
        })
    }

    /// Runs one training pass over prioritized samples and publishes the
    /// updated model.
    ///
    /// Events recorded without prediction details are replayed with heads
    /// recomputed on `snapshot` and no goal. Events whose action is gone and
    /// that carry no details are skipped.
    #[instrument(
        name = "capgraph.scorer.train",
        skip(self, samples, snapshot),
        fields(component = "scorer", operation = "train", samples = samples.len())
    )]
    pub fn train(&self, samples: &[SampledEvent], snapshot: &GraphSnapshot) -> TrainingReport {
        let model = self.model();
        let mut guard = acquire_lock(&self.training, "scorer_training");
        let state = &mut *guard;
        let mut report = TrainingReport::default();
        let mut prepared: Vec<PreparedExample> = Vec::with_capacity(samples.len());
        let mut total_loss = 0.0f64;

        for sample in samples {
            let Some(mut example) = self.prepare(snapshot, &model, sample) else {
                continue;
            };
            #[allow(clippy::cast_possible_truncation)]
            let weight = sample.weight as f32;

            if let (Some(goal), Some(candidate)) = (&example.goal, &example.candidate) {
                let projection = state.projection.get_or_insert_with(|| {
                    BilinearProjection::new(goal.len(), self.config.projection_dim, self.config.seed)
                });
                if let Some(loss) = projection.train_step(
                    goal,
                    candidate,
                    example.target,
                    weight,
                    self.config.projection_learning_rate,
                ) {
                    total_loss += f64::from(loss);
                    report.projection_examples += 1;
                    state.projection_examples += 1;
                }
                if state.projection_examples >= self.config.min_projection_examples
                    && let Some(score) = projection.score(goal, candidate)
                {
                    example.heads.semantic = Some(score);
                }
            }

            let loss = state.gates.train_step(
                &example.heads,
                &example.features,
                example.target,
                weight,
                self.config.fusion_learning_rate,
            );
            total_loss += f64::from(loss);
            state.fusion_examples += 1;
            prepared.push(example);
        }

        let semantic = match &state.projection {
            Some(projection) if state.projection_examples >= self.config.min_projection_examples => {
                SemanticHead::Projected(projection.clone())
            },
            _ => SemanticHead::Raw,
        };
        let fusion = if state.fusion_examples >= self.config.min_fusion_examples {
            Fusion::Trained(state.gates)
        } else {
            Fusion::Untrained
        };
        drop(guard);

        let next = Arc::new(ScorerModel {
            semantic,
            fusion,
            version: model.version + 1,
        });

        report.priorities = prepared
            .iter()
            .map(|example| {
                let mut heads = example.heads;
                if let (Some(goal), Some(candidate)) = (&example.goal, &example.candidate) {
                    heads.semantic = Some(next.semantic.score(goal, candidate));
                }
                let fused = next.fusion.fuse(&heads, &example.features);
                (example.id, f64::from((fused - example.target).abs()))
            })
            .collect();
        report.examples = prepared.len();
        if !prepared.is_empty() {
            report.mean_loss = total_loss / crate::gc::usize_to_f64(prepared.len());
        }
        report.model_version = next.version;

        *write_lock(&self.model, "scorer_model") = Arc::clone(&next);

        metrics::counter!("scorer_training_examples_total").increment(report.examples as u64);
        metrics::gauge!("scorer_training_loss").set(report.mean_loss);
        metrics::gauge!("scorer_model_version").set(crate::gc::u64_to_f64(next.version));
        info!(
            examples = report.examples,
            projection_examples = report.projection_examples,
            mean_loss = report.mean_loss,
            fusion_trained = next.fusion.is_trained(),
            projected = matches!(next.semantic, SemanticHead::Projected(_)),
            "Scorer training pass completed"
        );
        report
    }
}
