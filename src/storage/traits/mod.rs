//! Storage backend traits.
//!
//! In-memory structures are authoritative while the engine runs; these
//! backends make them durable.
//!
//! | Trait | Persists | `SQLite` implementation |
//! |-------|----------|-------------------------|
//! | [`GraphPersistence`] | Nodes, edges, graph version | `SqliteGraphPersistence` |
//! | [`EpisodicBackend`] | Outcome events | `SqliteEpisodicBackend` |
//! | [`ThresholdBackend`] | Threshold records | `SqliteThresholdBackend` |

mod episodic;
mod graph;
mod threshold;

pub use episodic::EpisodicBackend;
pub use graph::{GraphPersistence, PersistedGraph};
pub use threshold::ThresholdBackend;
