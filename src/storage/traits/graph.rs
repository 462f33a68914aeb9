//! Graph persistence trait.

use crate::Result;
use crate::models::{Edge, Node};
use crate::storage::graph::{GraphCommit, GraphSnapshot};

/// Nodes, edges, and version read back from storage.
#[derive(Debug, Clone, Default)]
pub struct PersistedGraph {
    /// Decoded nodes.
    pub nodes: Vec<Node>,
    /// Decoded edges.
    pub edges: Vec<Edge>,
    /// Last saved graph version.
    pub version: u64,
    /// Rows that could not be decoded.
    pub skipped: usize,
}

/// Durable storage for graph snapshots.
///
/// # Error Modes
///
/// | Operation | Failure | Behavior |
/// |-----------|---------|----------|
/// | `save_snapshot` | Storage error | Nothing written (one transaction) |
/// | `apply_commit` | Storage error | Nothing written; next full save repairs |
/// | `load` | Undecodable row | Row skipped and counted in `skipped` |
pub trait GraphPersistence: Send + Sync {
    /// Replaces stored contents with a full snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn save_snapshot(&self, snapshot: &GraphSnapshot) -> Result<()>;

    /// Writes the nodes and edges touched by one commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn apply_commit(&self, snapshot: &GraphSnapshot, commit: &GraphCommit) -> Result<()>;

    /// Reads the stored graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn load(&self) -> Result<PersistedGraph>;
}
