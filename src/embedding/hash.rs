//! Deterministic hash-based embeddings.
//!
//! Tokens and their character trigrams are hashed with SHA-256 and scattered
//! into a fixed-width vector, then normalized. Texts sharing words or word
//! fragments land close together, which is enough for offline operation and
//! tests. Vectors are stable across processes and releases, so they can be
//! persisted alongside real model output.

use super::{DEFAULT_DIMENSIONS, Embedder, normalize};
use crate::{Error, Result};
use sha2::{Digest, Sha256};

/// Maximum tokens considered per text.
const MAX_TOKENS: usize = 1000;

/// Relative weight of trigram features against whole tokens.
const TRIGRAM_WEIGHT: f32 = 0.35;

/// Embedder producing deterministic pseudo-embeddings.
#[derive(Debug, Clone, Copy)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    /// Creates an embedder with the default width.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS,
        }
    }

    /// Creates an embedder with a custom width.
    #[must_use]
    pub const fn with_dimensions(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .take(MAX_TOKENS)
            .map(str::to_lowercase)
    }

    /// Adds one feature into the vector.
    fn scatter(embedding: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let dims = embedding.len();
        for pair in digest.chunks_exact(4).take(4) {
            let slot = u16::from_le_bytes([pair[0], pair[1]]) as usize % dims;
            let magnitude = f32::from(pair[2]) / 255.0;
            let sign = if pair[3] & 1 == 0 { 1.0 } else { -1.0 };
            embedding[slot] += sign * (0.5 + magnitude) * weight;
        }
    }

    fn pseudo_embed(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimensions];
        for token in Self::tokens(text) {
            Self::scatter(&mut embedding, &token, 1.0);
            let chars: Vec<char> = token.chars().collect();
            if chars.len() > 3 {
                for window in chars.windows(3) {
                    let gram: String = window.iter().collect();
                    Self::scatter(&mut embedding, &format!("#{gram}"), TRIGRAM_WEIGHT);
                }
            }
        }
        normalize(&mut embedding);
        embedding
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl Embedder for HashEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.dimensions == 0 {
            return Err(Error::InvalidInput(
                "embedding dimensions must be positive".to_string(),
            ));
        }
        if text.trim().is_empty() {
            return Err(Error::InvalidInput("cannot embed empty text".to_string()));
        }
        Ok(self.pseudo_embed(text))
    }
}
