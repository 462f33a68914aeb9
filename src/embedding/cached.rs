//! LRU-bounded embedding cache.
//!
//! Keys are SHA-256 digests of the input text, so memory use per entry does
//! not depend on query length. Cached vectors are returned as exact copies:
//! embedding the same text twice yields bit-identical output and a single
//! call into the wrapped provider.

use super::Embedder;
use crate::Result;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default number of cached vectors.
const DEFAULT_CAPACITY: usize = 1024;

/// Hit and miss counters for an embedding cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that reached the provider.
    pub misses: u64,
    /// Vectors currently cached.
    pub entries: usize,
}

/// Embedder wrapper that memoizes results.
pub struct CachedEmbedder<E: Embedder + ?Sized> {
    inner: std::sync::Arc<E>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<E: Embedder + ?Sized> CachedEmbedder<E> {
    /// Wraps an embedder with a cache of at most `capacity` vectors.
    #[must_use]
    pub fn new(inner: std::sync::Arc<E>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or_else(|| NonZeroUsize::new(DEFAULT_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cache key for a text.
    fn key(text: &str) -> String {
        hex::encode(Sha256::digest(text.as_bytes()))
    }

    fn lookup(&self, key: &str) -> Option<Vec<f32>> {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Embedding cache mutex was poisoned, recovering");
                poisoned.into_inner()
            },
        };
        cache.get(key).cloned()
    }

    fn store(&self, key: String, embedding: &[f32]) {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.put(key, embedding.to_vec());
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("embedding_cache_hits_total").increment(1);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("embedding_cache_misses_total").increment(1);
    }

    /// Returns cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let entries = self.cache.lock().map_or(0, |c| c.len());
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }
}

impl<E: Embedder + ?Sized> Embedder for CachedEmbedder<E> {
    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = Self::key(text);
        if let Some(hit) = self.lookup(&key) {
            self.record_hit();
            return Ok(hit);
        }
        self.record_miss();
        let embedding = self.inner.embed(text)?;
        self.store(key, &embedding);
        Ok(embedding)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let keys: Vec<String> = texts.iter().map(|t| Self::key(t)).collect();
        let mut results: Vec<Option<Vec<f32>>> = keys.iter().map(|k| self.lookup(k)).collect();

        let missing: Vec<usize> = results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.is_none().then_some(i))
            .collect();
        for _ in 0..(texts.len() - missing.len()) {
            self.record_hit();
        }

        if !missing.is_empty() {
            let miss_texts: Vec<&str> = missing.iter().map(|&i| texts[i]).collect();
            let computed = self.inner.embed_batch(&miss_texts)?;
            for (&i, embedding) in missing.iter().zip(computed) {
                self.record_miss();
                self.store(keys[i].clone(), &embedding);
                results[i] = Some(embedding);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    struct CountingEmbedder {
        inner: HashEmbedder,
        calls: AtomicUsize,
    }

    impl Embedder for CountingEmbedder {
        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(text)
        }
    }

    fn counting() -> Arc<CountingEmbedder> {
        Arc::new(CountingEmbedder {
            inner: HashEmbedder::with_dimensions(32),
            calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_same_text_is_bit_identical_with_one_inner_call() {
        let inner = counting();
        let cached = CachedEmbedder::new(Arc::clone(&inner), 8);

        let first = cached.embed("summarize the changelog").unwrap();
        let second = cached.embed("summarize the changelog").unwrap();

        let first_bits: Vec<u32> = first.iter().map(|v| v.to_bits()).collect();
        let second_bits: Vec<u32> = second.iter().map(|v| v.to_bits()).collect();
        assert_eq!(first_bits, second_bits);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        let stats = cached.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_capacity_bounds_entries() {
        let cached = CachedEmbedder::new(counting(), 2);
        cached.embed("one").unwrap();
        cached.embed("two").unwrap();
        cached.embed("three").unwrap();
        assert_eq!(cached.stats().entries, 2);
    }

    #[test]
    fn test_batch_only_embeds_misses() {
        let inner = counting();
        let cached = CachedEmbedder::new(Arc::clone(&inner), 8);
        cached.embed("alpha").unwrap();

        let out = cached.embed_batch(&["alpha", "beta", "gamma"]).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(out[0], cached.embed("alpha").unwrap());
    }
}
