//! Learned bilinear projection for the semantic head.

use rand::SeedableRng;
use rand::distr::{Distribution, StandardUniform};
use rand::rngs::StdRng;

/// Projects query and candidate embeddings into a shared `p`-dimensional
/// space and scores them with `σ((W_q q)·(W_k c) / √p)`.
///
/// Both matrices are stored row-major as `p × dim`.
#[derive(Debug, Clone, PartialEq)]
pub struct BilinearProjection {
    dim: usize,
    rank: usize,
    w_query: Vec<f32>,
    w_key: Vec<f32>,
}

impl BilinearProjection {
    /// Creates a projection with small seeded random weights.
    #[must_use]
    pub fn new(dim: usize, rank: usize, seed: u64) -> Self {
        let rank = rank.max(1);
        let mut rng = StdRng::seed_from_u64(seed);
        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (dim.max(1) as f32).sqrt();
        let mut init = |n: usize| -> Vec<f32> {
            (0..n)
                .map(|_| {
                    let u: f32 = StandardUniform.sample(&mut rng);
                    2.0f32.mul_add(u, -1.0) * scale
                })
                .collect()
        };
        let w_query = init(dim * rank);
        let w_key = init(dim * rank);
        Self {
            dim,
            rank,
            w_query,
            w_key,
        }
    }

    /// Returns the input dimensionality.
    #[must_use]
    pub const fn dim(&self) -> usize {
        self.dim
    }

    /// Returns the shared-space dimensionality.
    #[must_use]
    pub const fn rank(&self) -> usize {
        self.rank
    }

    fn project(weights: &[f32], dim: usize, input: &[f32]) -> Vec<f32> {
        weights
            .chunks(dim.max(1))
            .map(|row| row.iter().zip(input).map(|(w, x)| w * x).sum())
            .collect()
    }

    #[allow(clippy::cast_precision_loss)]
    fn logit(&self, u: &[f32], v: &[f32]) -> f32 {
        let dot: f32 = u.iter().zip(v).map(|(a, b)| a * b).sum();
        dot / (self.rank as f32).sqrt()
    }

    /// Scores a query against a candidate. Returns `None` on a dimension
    /// mismatch.
    #[must_use]
    pub fn score(&self, query: &[f32], candidate: &[f32]) -> Option<f32> {
        if query.len() != self.dim || candidate.len() != self.dim {
            return None;
        }
        let u = Self::project(&self.w_query, self.dim, query);
        let v = Self::project(&self.w_key, self.dim, candidate);
        Some(sigmoid(self.logit(&u, &v)))
    }

    /// One importance-weighted binary cross-entropy SGD step.
    ///
    /// Returns the loss before the step, or `None` on a dimension mismatch.
    pub fn train_step(
        &mut self,
        query: &[f32],
        candidate: &[f32],
        target: f32,
        weight: f32,
        learning_rate: f32,
    ) -> Option<f32> {
        if query.len() != self.dim || candidate.len() != self.dim {
            return None;
        }
        let u = Self::project(&self.w_query, self.dim, query);
        let v = Self::project(&self.w_key, self.dim, candidate);
        let predicted = sigmoid(self.logit(&u, &v));
        let p = predicted.clamp(1e-6, 1.0 - 1e-6);
        let loss = -weight * target.mul_add(p.ln(), (1.0 - target) * (1.0 - p).ln());

        #[allow(clippy::cast_precision_loss)]
        let inv_sqrt = 1.0 / (self.rank as f32).sqrt();
        let grad = weight * (predicted - target) * inv_sqrt * learning_rate;
        let rows = self
            .w_query
            .chunks_mut(self.dim.max(1))
            .zip(self.w_key.chunks_mut(self.dim.max(1)))
            .zip(u.iter().zip(&v));
        for ((q_row, k_row), (u_i, v_i)) in rows {
            for (w, x) in q_row.iter_mut().zip(query) {
                *w -= grad * v_i * x;
            }
            for (w, x) in k_row.iter_mut().zip(candidate) {
                *w -= grad * u_i * x;
            }
        }
        Some(loss)
    }
}

/// Logistic function.
#[must_use]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
