//! Hybrid semantic and structural search.
//!
//! # Ranking
//!
//! ```text
//! query ──embed──▶ nearest 2×top_k nodes ──┐
//!                                          ├──▶ alpha·semantic + (1−alpha)·structural
//! context nodes ──neighborhoods────────────┘        alpha = max(0.5, 1 − 2·density)
//! ```
//!
//! Structural relatedness to the context is 1.0 for a direct connection and
//! otherwise a squashed Adamic–Adar score over shared neighbors, so a direct
//! link always outranks a two-hop relation. Sparse graphs carry little
//! structural signal and lean on similarity; dense graphs lean the other way,
//! never below an even split.
//!
//! When the embedding provider fails the search degrades: candidates become
//! the one- and two-hop neighborhood of the context and are ranked on
//! structure alone.

use crate::embedding::Embedder;
use crate::models::{DegradedReason, NodeId, RankedCandidate, SearchResponse};
use crate::storage::{GraphSnapshot, GraphStore};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

/// Hybrid search configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Semantic candidates retrieved per requested result.
    pub candidate_multiplier: usize,
    /// Lower bound of the semantic weight.
    pub min_alpha: f64,
    /// How fast the semantic weight falls with density.
    pub density_slope: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            candidate_multiplier: 2,
            min_alpha: 0.5,
            density_slope: 2.0,
        }
    }
}

impl SearchConfig {
    /// Sets the candidate multiplier.
    #[must_use]
    pub const fn with_candidate_multiplier(mut self, multiplier: usize) -> Self {
        self.candidate_multiplier = multiplier;
        self
    }

    /// Applies environment variable overrides.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `CAPGRAPH_SEARCH_CANDIDATE_MULTIPLIER` | Semantic candidates per result |
    /// | `CAPGRAPH_SEARCH_MIN_ALPHA` | Lower bound of the semantic weight |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("CAPGRAPH_SEARCH_CANDIDATE_MULTIPLIER")
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.candidate_multiplier = parsed.max(1);
        }
        if let Ok(v) = std::env::var("CAPGRAPH_SEARCH_MIN_ALPHA")
            && let Ok(parsed) = v.parse::<f64>()
        {
            self.min_alpha = parsed.clamp(0.0, 1.0);
        }
        self
    }

    /// Returns the semantic weight for a graph density.
    #[must_use]
    pub fn alpha(&self, density: f64) -> f64 {
        self.density_slope
            .mul_add(-density, 1.0)
            .clamp(self.min_alpha, 1.0)
    }
}

/// Returns `max(0.5, 1 − 2·density)`, the default semantic weight.
#[must_use]
pub fn blend_alpha(density: f64) -> f64 {
    SearchConfig::default().alpha(density)
}

/// Relatedness of `candidate` to a set of context nodes, in `[0, 1]`.
///
/// The maximum over the context of: 1.0 for a direct connection, else
/// `aa / (1 + aa)` where `aa` sums `1 / ln(degree)` over shared neighbors
/// with degree above one.
#[must_use]
pub fn structural_score(snapshot: &GraphSnapshot, candidate: &NodeId, context: &[NodeId]) -> f32 {
    let Some(candidate_links) = snapshot.related(candidate) else {
        return 0.0;
    };
    let mut best = 0.0f64;
    for ctx in context {
        if ctx == candidate {
            continue;
        }
        if candidate_links.contains(ctx) {
            return 1.0;
        }
        let Some(ctx_links) = snapshot.related(ctx) else {
            continue;
        };
        #[allow(clippy::cast_precision_loss)]
        let aa: f64 = candidate_links
            .intersection(ctx_links)
            .map(|w| snapshot.degree(w))
            .filter(|d| *d > 1)
            .map(|d| 1.0 / (d as f64).ln())
            .sum();
        best = best.max(aa / (1.0 + aa));
    }
    #[allow(clippy::cast_possible_truncation)]
    let score = best as f32;
    score
}

/// Hybrid search service.
pub struct HybridSearch {
    graph: Arc<GraphStore>,
    embedder: Arc<dyn Embedder>,
    config: SearchConfig,
}

impl HybridSearch {
    /// Creates a search service over a graph and an embedding provider.
    #[must_use]
    pub fn new(graph: Arc<GraphStore>, embedder: Arc<dyn Embedder>, config: SearchConfig) -> Self {
        Self {
            graph,
            embedder,
            config,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Searches the current snapshot.
    ///
    /// Never fails: an empty graph or `top_k == 0` yields an empty response,
    /// and an embedding failure yields a degraded one.
    #[instrument(
        name = "capgraph.search",
        skip(self, query, context_nodes),
        fields(
            query_id = tracing::field::Empty,
            component = "search",
            operation = "search",
            top_k = top_k,
            context = context_nodes.len()
        )
    )]
    pub fn search(&self, query: &str, top_k: usize, context_nodes: &[NodeId]) -> SearchResponse {
        if let Some(query_id) = crate::observability::current_query_id() {
            tracing::Span::current().record("query_id", query_id.as_str());
        }
        let snapshot = self.graph.snapshot();
        if top_k == 0 || snapshot.is_empty() {
            return SearchResponse::default();
        }
        let embedding = self.embedder.embed(query);
        self.search_snapshot(
            &snapshot,
            embedding.as_deref().map_err(ToString::to_string),
            top_k,
            context_nodes,
        )
    }

    /// Ranks candidates on a given snapshot with a precomputed query
    /// embedding, or the provider error that replaced it.
    pub fn search_snapshot(
        &self,
        snapshot: &GraphSnapshot,
        embedding: std::result::Result<&[f32], String>,
        top_k: usize,
        context_nodes: &[NodeId],
    ) -> SearchResponse {
        let start = Instant::now();
        if top_k == 0 || snapshot.is_empty() {
            return SearchResponse::default();
        }

        let response = match embedding {
            Ok(query) => SearchResponse {
                candidates: self.rank(snapshot, query, top_k, context_nodes),
                degraded: None,
            },
            Err(cause) => {
                tracing::warn!(error = %cause, "Embedding unavailable, ranking structurally");
                metrics::counter!("search_degraded_total").increment(1);
                SearchResponse {
                    candidates: Self::rank_structural(snapshot, top_k, context_nodes),
                    degraded: Some(DegradedReason::EmbeddingUnavailable(cause)),
                }
            },
        };

        let mode = if response.is_degraded() {
            "structural"
        } else {
            "hybrid"
        };
        metrics::counter!("search_queries_total", "mode" => mode).increment(1);
        metrics::histogram!("search_duration_ms")
            .record(crate::gc::u64_to_f64(crate::gc::duration_to_millis(start.elapsed())));
        tracing::debug!(
            results = response.candidates.len(),
            mode,
            "Search completed"
        );
        response
    }

    fn rank(
        &self,
        snapshot: &GraphSnapshot,
        query: &[f32],
        top_k: usize,
        context_nodes: &[NodeId],
    ) -> Vec<RankedCandidate> {
        let fetch = top_k.saturating_mul(self.config.candidate_multiplier.max(1));
        let semantic = snapshot.vector_index().search(query, fetch);
        if semantic.is_empty() {
            return Vec::new();
        }

        // Without context there is no structural signal to blend.
        let alpha = if context_nodes.is_empty() {
            1.0
        } else {
            self.config.alpha(snapshot.density())
        };
        #[allow(clippy::cast_possible_truncation)]
        let alpha = alpha as f32;

        let mut candidates: Vec<RankedCandidate> = semantic
            .into_iter()
            .map(|(node_id, semantic_score)| {
                let structural = if context_nodes.is_empty() {
                    0.0
                } else {
                    structural_score(snapshot, &node_id, context_nodes)
                };
                RankedCandidate {
                    score: alpha.mul_add(semantic_score, (1.0 - alpha) * structural),
                    node_id,
                    semantic_score,
                    structural_score: structural,
                }
            })
            .collect();
        sort_and_truncate(&mut candidates, top_k);
        candidates
    }

    fn rank_structural(
        snapshot: &GraphSnapshot,
        top_k: usize,
        context_nodes: &[NodeId],
    ) -> Vec<RankedCandidate> {
        let context: BTreeSet<&NodeId> = context_nodes.iter().collect();
        let mut pool: BTreeSet<&NodeId> = BTreeSet::new();
        for ctx in &context {
            let Some(first) = snapshot.related(ctx) else {
                continue;
            };
            for hop1 in first {
                pool.insert(hop1);
                for hop2 in snapshot.related(hop1).into_iter().flatten() {
                    pool.insert(hop2);
                }
            }
        }

        let mut scores: HashMap<&NodeId, f32> = HashMap::new();
        for candidate in pool.into_iter().filter(|id| !context.contains(id)) {
            scores.insert(candidate, structural_score(snapshot, candidate, context_nodes));
        }
        let mut candidates: Vec<RankedCandidate> = scores
            .into_iter()
            .map(|(id, structural)| RankedCandidate {
                node_id: id.clone(),
                score: structural,
                semantic_score: 0.0,
                structural_score: structural,
            })
            .collect();
        sort_and_truncate(&mut candidates, top_k);
        candidates
    }
}

fn sort_and_truncate(candidates: &mut Vec<RankedCandidate>, top_k: usize) {
    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    candidates.truncate(top_k);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::embedding::HashEmbedder;
    use crate::models::{Edge, EdgeKind, EdgeSource, Node};
    use crate::storage::{BatchPolicy, GraphBatch, GraphConfig};
    use test_case::test_case;

    struct FailingEmbedder;

    impl Embedder for FailingEmbedder {
        fn dimensions(&self) -> usize {
            8
        }

        fn embed(&self, _text: &str) -> crate::Result<Vec<f32>> {
            Err(Error::EmbeddingUnavailable("offline".to_string()))
        }
    }

    fn embedder() -> Arc<HashEmbedder> {
        Arc::new(HashEmbedder::with_dimensions(32))
    }

    fn graph_with(embedder: &HashEmbedder, edges: &[(&str, &str)], nodes: &[&str]) -> Arc<GraphStore> {
        let graph = Arc::new(GraphStore::new(GraphConfig::default().with_embedding_dimensions(32)));
        let mut batch = GraphBatch::new();
        for id in nodes {
            let embedding = embedder.embed(id).unwrap();
            batch = batch.upsert_node(Node::tool(*id).with_embedding(embedding));
        }
        for (from, to) in edges {
            batch = batch.upsert_edge(Edge::new(*from, *to, EdgeKind::Sequence, EdgeSource::Observed));
        }
        graph.apply_batch(batch, BatchPolicy::AllOrNothing).unwrap();
        graph
    }

    #[test_case(0.0, 1.0 ; "empty graph")]
    #[test_case(0.1, 0.8 ; "sparse")]
    #[test_case(0.25, 0.5 ; "quarter")]
    #[test_case(0.9, 0.5 ; "dense floors at half")]
    fn test_blend_alpha(density: f64, expected: f64) {
        assert!((blend_alpha(density) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_empty_graph_returns_nothing() {
        let graph = Arc::new(GraphStore::new(GraphConfig::default()));
        let search = HybridSearch::new(graph, embedder(), SearchConfig::default());
        let response = search.search("anything", 5, &[]);
        assert!(response.is_empty());
        assert!(!response.is_degraded());
    }

    #[test]
    fn test_zero_top_k_returns_nothing() {
        let e = embedder();
        let graph = graph_with(&e, &[], &["fetch url"]);
        let search = HybridSearch::new(graph, e, SearchConfig::default());
        assert!(search.search("fetch url", 0, &[]).is_empty());
    }

    #[test]
    fn test_without_context_ranks_by_similarity() {
        let e = embedder();
        let graph = graph_with(&e, &[], &["fetch url", "parse json", "send email"]);
        let search = HybridSearch::new(graph, e, SearchConfig::default());

        let response = search.search("parse json", 3, &[]);
        assert_eq!(response.candidates[0].node_id.as_str(), "parse json");
        for hit in &response.candidates {
            assert!((hit.score - hit.semantic_score).abs() < 1e-6);
            assert!(hit.structural_score.abs() < f32::EPSILON);
        }
    }

    #[test]
    fn test_direct_connection_beats_two_hop() {
        let e = embedder();
        let graph = graph_with(
            &e,
            &[("a", "b"), ("b", "c"), ("x", "b")],
            &["a", "b", "c", "x"],
        );
        let snapshot = graph.snapshot();
        let ctx = [NodeId::new("a")];
        assert!((structural_score(&snapshot, &NodeId::new("b"), &ctx) - 1.0).abs() < f32::EPSILON);
        let two_hop = structural_score(&snapshot, &NodeId::new("c"), &ctx);
        assert!(two_hop > 0.0 && two_hop < 1.0);
    }

    #[test]
    fn test_degraded_search_uses_neighborhood() {
        let e = embedder();
        let graph = graph_with(&e, &[("a", "b"), ("b", "c")], &["a", "b", "c", "far"]);
        let search = HybridSearch::new(graph, Arc::new(FailingEmbedder), SearchConfig::default());

        let response = search.search("anything", 10, &[NodeId::new("a")]);
        assert!(response.is_degraded());
        let ids: Vec<&str> = response.candidates.iter().map(|c| c.node_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_degraded_without_context_is_empty() {
        let e = embedder();
        let graph = graph_with(&e, &[], &["a"]);
        let search = HybridSearch::new(graph, Arc::new(FailingEmbedder), SearchConfig::default());
        let response = search.search("anything", 10, &[]);
        assert!(response.is_degraded());
        assert!(response.is_empty());
    }
}
