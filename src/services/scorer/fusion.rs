//! Context-gated fusion of head scores.
//!
//! Gates are a softmax over heads of `G · f`, where `f` describes the query
//! context. Heads that produced no score are masked out before the softmax,
//! so the gates always sum to one over the heads that are present.

use crate::models::HeadScores;

/// Number of scoring heads.
pub const HEAD_COUNT: usize = 3;

/// Number of context features.
pub const FEATURE_COUNT: usize = 4;

/// Context features that drive the gates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextFeatures(pub [f32; FEATURE_COUNT]);

impl ContextFeatures {
    /// Builds `[1, has_goal, context_size (saturating), is_capability]`.
    #[must_use]
    pub fn new(has_goal: bool, context_size: usize, is_capability: bool) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let size = context_size as f32;
        Self([
            1.0,
            f32::from(u8::from(has_goal)),
            size / (1.0 + size),
            f32::from(u8::from(is_capability)),
        ])
    }
}

/// Gate matrix, one row per head.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GateWeights {
    rows: [[f32; FEATURE_COUNT]; HEAD_COUNT],
}

impl GateWeights {
    /// Returns the gate for each head; `None` where the head is missing.
    #[must_use]
    pub fn gates(&self, heads: &HeadScores, features: &ContextFeatures) -> [Option<f32>; HEAD_COUNT] {
        let available = heads.as_array();
        let logits: Vec<Option<f32>> = self
            .rows
            .iter()
            .zip(available)
            .map(|(row, score)| {
                score.map(|_| row.iter().zip(features.0).map(|(g, f)| g * f).sum::<f32>())
            })
            .collect();
        let max = logits
            .iter()
            .flatten()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<Option<f32>> = logits.iter().map(|l| l.map(|l| (l - max).exp())).collect();
        let total: f32 = exp.iter().flatten().sum();

        let mut gates = [None; HEAD_COUNT];
        if total > 0.0 {
            for (gate, e) in gates.iter_mut().zip(exp) {
                *gate = e.map(|e| e / total);
            }
        }
        gates
    }

    /// Gated sum of the available heads, in `[0, 1]`.
    #[must_use]
    pub fn fuse(&self, heads: &HeadScores, features: &ContextFeatures) -> f32 {
        let gates = self.gates(heads, features);
        gates
            .iter()
            .zip(heads.as_array())
            .filter_map(|(g, s)| Some((*g)? * s?))
            .sum::<f32>()
            .clamp(0.0, 1.0)
    }

    /// One importance-weighted squared-error SGD step toward `target`.
    ///
    /// Returns the loss before the step.
    pub fn train_step(
        &mut self,
        heads: &HeadScores,
        features: &ContextFeatures,
        target: f32,
        weight: f32,
        learning_rate: f32,
    ) -> f32 {
        let gates = self.gates(heads, features);
        let scores = heads.as_array();
        let fused: f32 = gates
            .iter()
            .zip(scores)
            .filter_map(|(g, s)| Some((*g)? * s?))
            .sum();
        let residual = fused - target;

        for ((row, gate), score) in self.rows.iter_mut().zip(gates).zip(scores) {
            let (Some(gate), Some(score)) = (gate, score) else {
                continue;
            };
            let common = 2.0 * weight * residual * gate * (score - fused);
            for (g, f) in row.iter_mut().zip(features.0) {
                *g -= learning_rate * common * f;
            }
        }
        weight * residual * residual
    }
}

/// Fusion stage of the scorer model.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Fusion {
    /// Not enough examples yet: the unweighted mean of available heads.
    #[default]
    Untrained,
    /// Learned context gates.
    Trained(GateWeights),
}

impl Fusion {
    /// Fuses head scores into one score in `[0, 1]`.
    #[must_use]
    pub fn fuse(&self, heads: &HeadScores, features: &ContextFeatures) -> f32 {
        match self {
            Self::Untrained => heads.mean().clamp(0.0, 1.0),
            Self::Trained(weights) => weights.fuse(heads, features),
        }
    }

    /// Returns `true` once gates are learned.
    #[must_use]
    pub const fn is_trained(&self) -> bool {
        matches!(self, Self::Trained(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heads(semantic: Option<f32>) -> HeadScores {
        HeadScores {
            semantic,
            structural: 0.2,
            temporal: 0.8,
        }
    }

    #[test]
    fn test_zero_gates_equal_mean() {
        let features = ContextFeatures::new(true, 2, false);
        let weights = GateWeights::default();
        let h = heads(Some(0.5));
        assert!((weights.fuse(&h, &features) - h.mean()).abs() < 1e-6);
        assert!((Fusion::Untrained.fuse(&h, &features) - h.mean()).abs() < 1e-6);
    }

    #[test]
    fn test_missing_head_is_masked() {
        let features = ContextFeatures::new(false, 0, false);
        let gates = GateWeights::default().gates(&heads(None), &features);
        assert!(gates[0].is_none());
        assert!((gates[1].unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_training_shifts_weight_to_predictive_head() {
        let features = ContextFeatures::new(false, 1, false);
        let mut weights = GateWeights::default();
        let h = heads(None);
        for _ in 0..500 {
            weights.train_step(&h, &features, 1.0, 1.0, 0.5);
        }
        let gates = weights.gates(&h, &features);
        assert!(gates[2].unwrap() > gates[1].unwrap());
        assert!(weights.fuse(&h, &features) > h.mean());
    }

    #[test]
    fn test_context_size_saturates() {
        let features = ContextFeatures::new(true, 1_000_000, true);
        assert!(features.0[2] < 1.0);
        assert!((features.0[1] - 1.0).abs() < f32::EPSILON);
    }
}
