//! Storage layer.
//!
//! | Layer | Module | Role |
//! |-------|--------|------|
//! | Graph | [`graph`] | Versioned copy-on-write snapshots, single writer |
//! | Vector | [`vector`] | Nearest-neighbor index shared between snapshots |
//! | Episodic | [`episodic`] | Buffered outcome log with prioritized replay |
//! | Persistence | [`sqlite`] | Durable tables behind the [`traits`] seams |

// Allow cast precision loss for score calculations where exact precision is not critical.
#![allow(clippy::cast_precision_loss)]
// Allow significant_drop_tightening - dropping database connections slightly early
// provides no meaningful benefit.
#![allow(clippy::significant_drop_tightening)]
// Allow manual_let_else for clearer error handling in some contexts.
#![allow(clippy::manual_let_else)]
// Allow match_same_arms for explicit enum handling.
#![allow(clippy::match_same_arms)]

pub mod episodic;
pub mod graph;
pub mod locks;
pub mod sqlite;
pub mod traits;
pub mod vector;

pub use episodic::{EpisodicConfig, EpisodicStore, SampledEvent};
pub use graph::{
    ArcChange, ArcKey, BatchPolicy, BatchReport, Direction, GraphBatch, GraphChange, GraphCommit,
    GraphConfig, GraphListener, GraphOp, GraphSnapshot, GraphStore, PlannerArc, RejectedOp,
};
pub use sqlite::{SqliteEpisodicBackend, SqliteGraphPersistence, SqliteThresholdBackend};
pub use traits::{EpisodicBackend, GraphPersistence, PersistedGraph, ThresholdBackend};
pub use vector::FlatVectorIndex;
