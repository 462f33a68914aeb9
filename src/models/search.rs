//! Hybrid search results.

use super::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a query fell back to a reduced scoring path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum DegradedReason {
    /// The embedding provider failed or timed out; ranking is structural only.
    EmbeddingUnavailable(String),
}

impl fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmbeddingUnavailable(cause) => write!(f, "embedding unavailable: {cause}"),
        }
    }
}

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    /// Matched node.
    pub node_id: NodeId,
    /// Blended score.
    pub score: f32,
    /// Embedding similarity mapped to `[0, 1]`.
    pub semantic_score: f32,
    /// Relatedness to the context nodes in `[0, 1]`.
    pub structural_score: f32,
}

/// Result of a hybrid search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Hits ordered by descending score.
    pub candidates: Vec<RankedCandidate>,
    /// Set when the query ran without semantic scoring.
    pub degraded: Option<DegradedReason>,
}

impl SearchResponse {
    /// Returns `true` if no candidates were found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Returns `true` if the response was produced in degraded mode.
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}
