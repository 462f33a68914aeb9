//! Scorer output types.

use super::NodeId;
use serde::{Deserialize, Serialize};

/// Per-head scores for one candidate.
///
/// The semantic head is absent when no goal embedding is available.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadScores {
    /// Similarity between goal and candidate.
    pub semantic: Option<f32>,
    /// Centrality and community signal.
    pub structural: f32,
    /// Recency and co-occurrence signal from past outcomes.
    pub temporal: f32,
}

impl HeadScores {
    /// Returns the head scores as an array in fixed head order, with
    /// unavailable heads as `None`.
    #[must_use]
    pub const fn as_array(&self) -> [Option<f32>; 3] {
        [self.semantic, Some(self.structural), Some(self.temporal)]
    }

    /// Returns the unweighted mean of the available heads.
    #[must_use]
    pub fn mean(&self) -> f32 {
        let available: Vec<f32> = self.as_array().into_iter().flatten().collect();
        if available.is_empty() {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let n = available.len() as f32;
        available.iter().sum::<f32>() / n
    }
}

/// A candidate with its fused and per-head scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    /// Candidate node.
    pub candidate_id: NodeId,
    /// Fused score in `[0, 1]`.
    pub fused_score: f32,
    /// Individual head scores.
    pub per_head: HeadScores,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_skips_missing_semantic() {
        let scores = HeadScores {
            semantic: None,
            structural: 0.4,
            temporal: 0.8,
        };
        assert!((scores.mean() - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_mean_all_heads() {
        let scores = HeadScores {
            semantic: Some(0.9),
            structural: 0.3,
            temporal: 0.6,
        };
        assert!((scores.mean() - 0.6).abs() < 1e-6);
    }
}
