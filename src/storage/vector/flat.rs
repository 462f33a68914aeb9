//! Exact nearest-neighbor index over node embeddings.
//!
//! A brute-force scan with scores mapped from cosine `[-1, 1]` onto `[0, 1]`.
//! The index is immutable and shared between snapshots through an `Arc`;
//! the graph store rebuilds it only for batches that change an embedding,
//! so a replaced embedding is never served from a stale index.

use crate::embedding::normalized_similarity;
use crate::models::{Node, NodeId};
use std::sync::Arc;

/// Immutable flat vector index.
#[derive(Debug, Clone, Default)]
pub struct FlatVectorIndex {
    entries: Vec<(NodeId, Vec<f32>)>,
}

impl FlatVectorIndex {
    /// Builds an index from every node that carries an embedding.
    pub fn from_nodes<'a>(nodes: impl IntoIterator<Item = &'a Arc<Node>>) -> Self {
        let mut entries: Vec<(NodeId, Vec<f32>)> = nodes
            .into_iter()
            .filter_map(|n| n.embedding.as_ref().map(|e| (n.id.clone(), e.clone())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Self { entries }
    }

    /// Returns the number of indexed vectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the `k` most similar nodes, best first.
    ///
    /// Vectors whose width differs from the query are skipped. Ties are
    /// broken by node id.
    #[must_use]
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(NodeId, f32)> {
        if k == 0 || query.is_empty() {
            return Vec::new();
        }
        let mut scores: Vec<(NodeId, f32)> = self
            .entries
            .iter()
            .filter(|(_, v)| v.len() == query.len())
            .map(|(id, v)| (id.clone(), normalized_similarity(query, v)))
            .collect();
        scores.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scores.truncate(k);
        scores
    }
}
