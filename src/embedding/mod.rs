//! Embedding generation.
//!
//! The engine treats the embedding provider as an external collaborator
//! behind the [`Embedder`] trait. Calls on the query path go through two
//! wrappers:
//!
//! - [`BulkheadEmbedder`] bounds concurrency and per-call latency
//! - [`CachedEmbedder`] memoizes vectors in a bounded LRU
//!
//! [`HashEmbedder`] is a deterministic offline provider used for tests and
//! as a default when no model is wired in.

// Allow cast precision loss for hash-based embedding calculations.
#![allow(clippy::cast_precision_loss)]
// Allow cast possible truncation for hash index calculations on 32-bit platforms.
#![allow(clippy::cast_possible_truncation)]

mod bulkhead;
mod cached;
mod hash;

pub use bulkhead::{BulkheadEmbedder, EmbeddingBulkheadConfig};
pub use cached::{CacheStats, CachedEmbedder};
pub use hash::HashEmbedder;

use crate::Result;
use serde::Deserialize;

/// Default embedding width.
pub const DEFAULT_DIMENSIONS: usize = 384;

/// Trait for embedding generators.
pub trait Embedder: Send + Sync {
    /// Returns the embedding dimensions.
    fn dimensions(&self) -> usize;

    /// Generates an embedding for the given text.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding generation fails.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generates embeddings for multiple texts.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding generation fails.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Embedding pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Expected embedding width; 0 disables the dimension check.
    pub dimensions: usize,
    /// Maximum cached query vectors.
    pub cache_capacity: usize,
    /// Concurrency and latency limits for provider calls.
    pub bulkhead: EmbeddingBulkheadConfig,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS,
            cache_capacity: 1024,
            bulkhead: EmbeddingBulkheadConfig::default(),
        }
    }
}

impl EmbeddingConfig {
    /// Sets the expected dimensions.
    #[must_use]
    pub const fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    /// Sets the cache capacity.
    #[must_use]
    pub const fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Applies environment variable overrides.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `CAPGRAPH_EMBEDDING_DIMENSIONS` | Expected width |
    /// | `CAPGRAPH_EMBEDDING_CACHE_CAPACITY` | Cached vectors |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("CAPGRAPH_EMBEDDING_DIMENSIONS")
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.dimensions = parsed;
        }
        if let Ok(v) = std::env::var("CAPGRAPH_EMBEDDING_CACHE_CAPACITY")
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.cache_capacity = parsed.max(1);
        }
        self.bulkhead = self.bulkhead.with_env_overrides();
        self
    }
}

/// Computes cosine similarity between two vectors.
///
/// Returns 0.0 for empty or mismatched vectors and for zero vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Maps cosine similarity from `[-1, 1]` onto `[0, 1]`.
#[must_use]
pub fn normalized_similarity(a: &[f32], b: &[f32]) -> f32 {
    f32::midpoint(cosine_similarity(a, b), 1.0).clamp(0.0, 1.0)
}

/// Scales a vector to unit length in place.
pub fn normalize(embedding: &mut [f32]) {
    let norm_sq: f32 = embedding.iter().map(|x| x * x).sum();
    if norm_sq <= 0.0 {
        return;
    }
    let inv_norm = norm_sq.sqrt().recip();
    for v in embedding.iter_mut() {
        *v *= inv_norm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let v = vec![0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
        assert!(normalized_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_mismatched_lengths() {
        assert!(cosine_similarity(&[1.0, 2.0], &[1.0]).abs() < f32::EPSILON);
        assert!(cosine_similarity(&[], &[]).abs() < f32::EPSILON);
    }

    #[test]
    fn test_normalize_unit_length() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }
}
