//! # capgraph
//!
//! Capability graph and hyperpath suggestion engine.
//!
//! Given a natural-language goal and the actions already invoked, capgraph
//! answers "what should happen next, and how confident are we?" It keeps a
//! typed graph of tools and composite capabilities, ranks candidates with a
//! blend of semantic and structural signals, plans minimum-cost hyperpaths
//! that are maintained incrementally as the graph changes, and learns from
//! observed outcomes.
//!
//! ## Components
//!
//! - Graph store with versioned copy-on-write snapshots
//! - Hybrid semantic + structural search with a density-adaptive blend
//! - Incremental hyperpath planner with two relaxation strategies
//! - Multi-head scorer with context-gated fusion
//! - Adaptive per-context confidence thresholds
//! - Episodic outcome store with prioritized replay
//!
//! ## Example
//!
//! ```rust
//! use capgraph::{
//!     ActionDescriptor, CapabilityEngine, ContextKey, EngineConfig, GoalSpec, NodeId, Outcome,
//!     StaticCatalog,
//! };
//! use std::time::Duration;
//!
//! let engine = CapabilityEngine::in_memory(EngineConfig::default())?;
//! engine.sync_actions(&StaticCatalog::new(vec![
//!     ActionDescriptor::tool("draft_notes").with_hint("draft release notes"),
//!     ActionDescriptor::tool("publish_notes").with_hint("publish the release notes"),
//! ]))?;
//! engine.observe_execution(
//!     &capgraph::ObservedExecution::new("release", vec![])
//!         .with_provides("draft_notes", "publish_notes"),
//! )?;
//!
//! let outcome = engine.suggest_path(
//!     &GoalSpec::text("publish the release notes"),
//!     &[NodeId::new("draft_notes")],
//!     Duration::from_millis(50),
//! )?;
//! assert!(outcome.result.is_found());
//!
//! let key = ContextKey::new("release");
//! let next = engine.next_step(&[NodeId::new("draft_notes")], None, &key);
//! let best = &next.suggestions[0];
//! engine.record_outcome(&key, &best.candidate.node_id, best.confidence, Outcome::Success)?;
//! # Ok::<(), capgraph::Error>(())
//! ```
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod config;
pub mod embedding;
pub mod gc;
pub mod models;
pub mod observability;
pub mod services;
pub mod storage;

// Re-exports for convenience
pub use config::EngineConfig;
pub use embedding::Embedder;
pub use models::{
    CapabilitySpec, ContextKey, DegradedReason, Edge, EdgeKind, EdgeSource, EpisodicEvent,
    GoalSpec, HeadScores, NextStepResponse, NextStepSuggestion, Node, NodeId, NodeKind, Outcome,
    Plan, PlanOutcome, PlanResult, PlanStep, RankedCandidate, ScoredCandidate, SearchResponse,
    StructureEdge, StructureEdgeKind, ThresholdRecord,
};
pub use services::{
    ActionCatalog, ActionDescriptor, ActionInvoker, ActionKind, BackgroundHandle, CapabilityEngine,
    HybridSearch, HyperpathPlanner, MultiHeadScorer, ObservedExecution, StaticCatalog,
    ThresholdManager,
};
pub use storage::{EpisodicStore, GraphBatch, GraphSnapshot, GraphStore};

/// Error type for capgraph operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Unknown node ids, malformed capability definitions, bad configuration |
/// | `CycleRejected` | A graph edit would close a cycle among causal edges |
/// | `DataInconsistency` | Persisted rows reference missing nodes or fail to decode |
/// | `OperationFailed` | `SQLite`, I/O, lock, or background task failures |
/// | `EmbeddingUnavailable` | The embedding provider failed or timed out |
///
/// Unreachable goals, deadline expiry and degraded search are not errors:
/// they are reported through [`PlanResult`] and [`models::DegradedReason`].
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    ///
    /// Raised when:
    /// - An operation references a node id that is not in the graph
    /// - A capability lists unknown members or itself as a member
    /// - A confidence value falls outside `[0, 1]`
    /// - Configuration bounds are inconsistent
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A causal edge would introduce a cycle.
    ///
    /// The graph snapshot is left untouched when this is returned.
    #[error("edge {from} -> {to} ({kind}) rejected: it would introduce a cycle")]
    CycleRejected {
        /// Source node of the rejected arc.
        from: String,
        /// Target node of the rejected arc.
        to: String,
        /// Kind of the rejected edge.
        kind: String,
    },

    /// Stored data is inconsistent with the graph.
    ///
    /// Raised when:
    /// - A persisted edge references a node that no longer exists
    /// - A persisted row cannot be decoded
    ///
    /// Callers log and skip these; they are never fatal.
    #[error("data inconsistency: {0}")]
    DataInconsistency(String),

    /// An operation failed.
    ///
    /// Raised when:
    /// - `SQLite` database operations fail
    /// - Filesystem I/O errors occur
    /// - A lock is poisoned
    /// - A background task cannot be joined
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The embedding provider failed or timed out.
    ///
    /// Query paths convert this into a degraded, structural-only result.
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),
}

/// Result type alias for capgraph operations.
pub type Result<T> = std::result::Result<T, Error>;
