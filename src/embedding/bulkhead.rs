//! Bulkhead for embedding provider calls.
//!
//! Embedding generation is the only latency-significant step on the query
//! path. The bulkhead bounds it two ways:
//!
//! - a semaphore caps concurrent provider calls
//! - each call runs on a worker thread and is abandoned after a timeout
//!
//! An abandoned worker keeps its permit until the provider returns, so slow
//! providers cannot pile up more than `max_concurrent` threads.
//!
//! A timed-out call surfaces as [`Error::EmbeddingUnavailable`], which search
//! and next-step queries turn into a degraded, structural-only answer.
//!
//! # Usage
//!
//! ```rust,ignore
//! use capgraph::embedding::{BulkheadEmbedder, EmbeddingBulkheadConfig, HashEmbedder};
//! use std::sync::Arc;
//!
//! let bulkhead = BulkheadEmbedder::new(
//!     Arc::new(HashEmbedder::new()),
//!     EmbeddingBulkheadConfig::default().with_call_timeout_ms(250),
//! );
//! let embedding = bulkhead.embed("open a pull request")?;
//! ```

use super::Embedder;
use crate::{Error, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Configuration for the embedding bulkhead.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingBulkheadConfig {
    /// Maximum concurrent embedding operations.
    ///
    /// Default: 4.
    pub max_concurrent: usize,

    /// Timeout for acquiring a permit in milliseconds.
    ///
    /// Default: 1000ms.
    pub acquire_timeout_ms: u64,

    /// Timeout for a single provider call in milliseconds (0 = no timeout).
    ///
    /// Default: 2000ms.
    pub call_timeout_ms: u64,

    /// Whether to fail immediately when all permits are taken.
    ///
    /// Default: false.
    pub fail_fast: bool,
}

impl Default for EmbeddingBulkheadConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingBulkheadConfig {
    /// Creates the default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_concurrent: 4,
            acquire_timeout_ms: 1_000,
            call_timeout_ms: 2_000,
            fail_fast: false,
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// | Variable | Description | Default |
    /// |----------|-------------|---------|
    /// | `CAPGRAPH_EMBEDDING_MAX_CONCURRENT` | Max concurrent calls | 4 |
    /// | `CAPGRAPH_EMBEDDING_ACQUIRE_TIMEOUT_MS` | Permit timeout | 1000 |
    /// | `CAPGRAPH_EMBEDDING_CALL_TIMEOUT_MS` | Per-call timeout | 2000 |
    /// | `CAPGRAPH_EMBEDDING_FAIL_FAST` | Fail when full | false |
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("CAPGRAPH_EMBEDDING_MAX_CONCURRENT")
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.max_concurrent = parsed.max(1);
        }
        if let Ok(v) = std::env::var("CAPGRAPH_EMBEDDING_ACQUIRE_TIMEOUT_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.acquire_timeout_ms = parsed;
        }
        if let Ok(v) = std::env::var("CAPGRAPH_EMBEDDING_CALL_TIMEOUT_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.call_timeout_ms = parsed;
        }
        if let Ok(v) = std::env::var("CAPGRAPH_EMBEDDING_FAIL_FAST") {
            self.fail_fast = v.eq_ignore_ascii_case("true") || v == "1";
        }
        self
    }

    /// Sets the maximum concurrent operations.
    #[must_use]
    pub const fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Sets the permit acquisition timeout.
    #[must_use]
    pub const fn with_acquire_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.acquire_timeout_ms = timeout_ms;
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub const fn with_call_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.call_timeout_ms = timeout_ms;
        self
    }

    /// Sets whether to fail fast when the bulkhead is full.
    #[must_use]
    pub const fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

/// Embedder wrapper enforcing concurrency and latency limits.
pub struct BulkheadEmbedder<E: Embedder + ?Sized + 'static> {
    inner: Arc<E>,
    config: EmbeddingBulkheadConfig,
    semaphore: Arc<Semaphore>,
}

impl<E: Embedder + ?Sized + 'static> BulkheadEmbedder<E> {
    /// Creates a bulkhead-wrapped embedder.
    #[must_use]
    pub fn new(inner: Arc<E>, config: EmbeddingBulkheadConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            inner,
            config,
            semaphore,
        }
    }

    /// Returns the number of free permits.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(permit);
        }
        if self.config.fail_fast {
            metrics::counter!("embedding_bulkhead_rejections_total", "reason" => "full")
                .increment(1);
            return Err(Error::EmbeddingUnavailable(format!(
                "embedding bulkhead full (max: {})",
                self.config.max_concurrent
            )));
        }

        let timeout = Duration::from_millis(self.config.acquire_timeout_ms);
        let start = Instant::now();
        loop {
            if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
                return Ok(permit);
            }
            if start.elapsed() >= timeout {
                metrics::counter!("embedding_bulkhead_rejections_total", "reason" => "timeout")
                    .increment(1);
                return Err(Error::EmbeddingUnavailable(format!(
                    "embedding bulkhead acquire timed out after {}ms",
                    timeout.as_millis()
                )));
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// Runs a provider call under a permit and the call timeout.
    fn execute<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&E) -> Result<T> + Send + 'static,
    {
        let permit = self.acquire_permit()?;
        let start = Instant::now();

        let result = if self.config.call_timeout_ms == 0 {
            let result = call(self.inner.as_ref());
            drop(permit);
            result
        } else {
            self.call_with_timeout(operation, permit, call)
        };

        metrics::histogram!("embedding_call_duration_ms", "operation" => operation)
            .record(start.elapsed().as_secs_f64() * 1000.0);
        tracing::trace!(operation, success = result.is_ok(), "Embedding call finished");
        result
    }

    fn call_with_timeout<T, F>(
        &self,
        operation: &'static str,
        permit: OwnedSemaphorePermit,
        call: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&E) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("capgraph-embed".to_string())
            .spawn(move || {
                let result = call(inner.as_ref());
                drop(permit);
                let _ = tx.send(result);
            })
            .map_err(|e| Error::OperationFailed {
                operation: "spawn_embedding_worker".to_string(),
                cause: e.to_string(),
            })?;

        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                metrics::counter!("embedding_timeouts_total", "operation" => operation)
                    .increment(1);
                tracing::warn!(
                    operation,
                    timeout_ms = self.config.call_timeout_ms,
                    "Embedding call timed out"
                );
                Err(Error::EmbeddingUnavailable(format!(
                    "{operation} timed out after {}ms",
                    self.config.call_timeout_ms
                )))
            },
            Err(RecvTimeoutError::Disconnected) => Err(Error::EmbeddingUnavailable(format!(
                "{operation} worker exited without a result"
            ))),
        }
    }
}

impl<E: Embedder + ?Sized + 'static> Embedder for BulkheadEmbedder<E> {
    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = text.to_string();
        self.execute("embed", move |inner| inner.embed(&text))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let owned: Vec<String> = texts.iter().map(|t| (*t).to_string()).collect();
        self.execute("embed_batch", move |inner| {
            let refs: Vec<&str> = owned.iter().map(String::as_str).collect();
            inner.embed_batch(&refs)
        })
    }
}
