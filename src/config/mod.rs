//! Configuration management.
//!
//! [`EngineConfig`] gathers every component's settings. Each section is
//! optional in the TOML file and falls back to its defaults:
//!
//! ```toml
//! [storage]
//! data_dir = "/var/lib/capgraph"
//!
//! [threshold]
//! default_threshold = 0.9
//! band_low = 0.8
//! band_high = 0.9
//!
//! [planner]
//! strategy = "path_centric"
//! ```
//!
//! Environment variables (`CAPGRAPH_*`) override file values; see each
//! section's `with_env_overrides`.

use crate::embedding::EmbeddingConfig;
use crate::gc::RetentionConfig;
use crate::observability::{LoggingConfig, MetricsConfig, ObservabilityConfig};
use crate::services::{PlannerConfig, ScorerConfig, SearchConfig, ThresholdConfig, TrainingConfig};
use crate::storage::{EpisodicConfig, GraphConfig};
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Database file name inside the data directory.
pub const DATABASE_FILE: &str = "capgraph.db";

/// Where durable state lives.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory; `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    /// Returns the `SQLite` database path, if durable.
    #[must_use]
    pub fn database_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(DATABASE_FILE))
    }

    /// Applies environment variable overrides.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `CAPGRAPH_DATA_DIR` | Data directory |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("CAPGRAPH_DATA_DIR")
            && !v.trim().is_empty()
        {
            self.data_dir = Some(PathBuf::from(v));
        }
        self
    }
}

/// Main configuration for capgraph.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Graph store settings.
    pub graph: GraphConfig,
    /// Hybrid search settings.
    pub search: SearchConfig,
    /// Planner settings.
    pub planner: PlannerConfig,
    /// Scorer settings.
    pub scorer: ScorerConfig,
    /// Threshold controller settings.
    pub threshold: ThresholdConfig,
    /// Episodic store settings.
    pub episodic: EpisodicConfig,
    /// Retention schedule.
    pub retention: RetentionConfig,
    /// Embedding pipeline settings.
    pub embedding: EmbeddingConfig,
    /// Training schedule.
    pub training: TrainingConfig,
    /// Durable storage location.
    pub storage: StorageConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Metrics settings.
    pub metrics: MetricsConfig,
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::OperationFailed {
            operation: "read_config_file".to_string(),
            cause: e.to_string(),
        })?;
        Self::parse(&contents)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration.
    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::OperationFailed {
            operation: "parse_config_file".to_string(),
            cause: e.to_string(),
        })
    }

    /// Loads configuration from the default location.
    ///
    /// Checks the following paths in order:
    /// 1. Platform-specific config dir (`~/Library/Application Support/capgraph/` on macOS)
    /// 2. XDG config dir (`~/.config/capgraph/` for Unix compatibility)
    ///
    /// Returns default configuration if no config file is found. A file that
    /// fails to parse is logged and skipped.
    #[must_use]
    pub fn load_default() -> Self {
        let Some(base_dirs) = directories::BaseDirs::new() else {
            return Self::default();
        };

        let candidates = [
            base_dirs.config_dir().join("capgraph").join("config.toml"),
            base_dirs
                .home_dir()
                .join(".config")
                .join("capgraph")
                .join("config.toml"),
        ];
        for path in candidates.iter().filter(|p| p.exists()) {
            match Self::load_from_file(path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable config file");
                },
            }
        }
        Self::default()
    }

    /// Loads the default file, then a `.env` file if present, then applies
    /// environment overrides.
    #[must_use]
    pub fn from_env() -> Self {
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            tracing::warn!(error = %e, "Failed to load .env file");
        }
        Self::load_default().with_env_overrides()
    }

    /// Applies environment variable overrides to every section.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        Self {
            graph: self.graph.with_env_overrides(),
            search: self.search.with_env_overrides(),
            planner: self.planner.with_env_overrides(),
            scorer: self.scorer.with_env_overrides(),
            threshold: self.threshold.with_env_overrides(),
            episodic: self.episodic.with_env_overrides(),
            retention: self.retention.with_env_overrides(),
            embedding: self.embedding.with_env_overrides(),
            training: self.training.with_env_overrides(),
            storage: self.storage.with_env_overrides(),
            logging: self.logging.with_env_overrides(),
            metrics: self.metrics.with_env_overrides(),
        }
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage = self.storage.with_data_dir(path);
        self
    }

    /// Returns the logging and metrics sections as one observability config.
    #[must_use]
    pub fn observability(&self) -> ObservabilityConfig {
        ObservabilityConfig {
            logging: self.logging.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Rejects inconsistent settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        self.threshold.validate()?;

        let invalid = |msg: &str| Err(Error::InvalidInput(msg.to_string()));
        if !(self.graph.reinforcement_rate > 0.0 && self.graph.reinforcement_rate <= 1.0) {
            return invalid("graph.reinforcement_rate must be in (0, 1]");
        }
        if !(0.0..=1.0).contains(&self.search.min_alpha) {
            return invalid("search.min_alpha must be in [0, 1]");
        }
        if self.planner.max_cached_tables == 0 {
            return invalid("planner.max_cached_tables must be positive");
        }
        if self.episodic.max_count == 0 {
            return invalid("episodic.max_count must be positive");
        }
        if self.episodic.priority_alpha < 0.0 {
            return invalid("episodic.priority_alpha must not be negative");
        }
        if !(0.0..=1.0).contains(&self.episodic.beta_start) {
            return invalid("episodic.beta_start must be in [0, 1]");
        }
        if self.scorer.half_life_secs <= 0.0 {
            return invalid("scorer.half_life_secs must be positive");
        }
        if self.training.batch_size == 0 {
            return invalid("training.batch_size must be positive");
        }
        if self.embedding.dimensions != 0
            && self.graph.embedding_dimensions != 0
            && self.embedding.dimensions != self.graph.embedding_dimensions
        {
            return invalid("embedding.dimensions must match graph.embedding_dimensions");
        }
        Ok(())
    }
}
