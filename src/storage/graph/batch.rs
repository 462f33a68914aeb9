//! Graph mutation batches.
//!
//! A [`GraphBatch`] groups operations that publish together: one new
//! snapshot and one version bump for the whole batch.
//!
//! # Example
//!
//! ```rust
//! use capgraph::storage::{BatchPolicy, GraphBatch};
//! use capgraph::models::{Edge, EdgeKind, EdgeSource, Node};
//!
//! let batch = GraphBatch::new()
//!     .upsert_node(Node::tool("fetch"))
//!     .upsert_node(Node::tool("parse"))
//!     .upsert_edge(Edge::new("fetch", "parse", EdgeKind::Provides, EdgeSource::Template));
//! assert_eq!(batch.len(), 3);
//! assert_eq!(BatchPolicy::default(), BatchPolicy::AllOrNothing);
//! ```

use crate::models::{Edge, EdgeKey, EdgeKind, Node, NodeId};

/// A single graph mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphOp {
    /// Adds a node or replaces its definition.
    ///
    /// A replacement without an embedding keeps the existing one.
    UpsertNode(Node),
    /// Replaces a node's embedding.
    SetEmbedding {
        /// Node to update.
        id: NodeId,
        /// New embedding.
        embedding: Vec<f32>,
    },
    /// Adds an edge or replaces the edge with the same key.
    UpsertEdge(Edge),
    /// Records an observation, creating an observed edge if absent.
    ObserveEdge {
        /// Source node.
        from: NodeId,
        /// Target node.
        to: NodeId,
        /// Edge kind.
        kind: EdgeKind,
    },
    /// Removes an edge.
    RemoveEdge(EdgeKey),
    /// Removes a node and its incident edges.
    RemoveNode(NodeId),
}

impl GraphOp {
    /// Returns a short label for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::UpsertNode(_) => "upsert_node",
            Self::SetEmbedding { .. } => "set_embedding",
            Self::UpsertEdge(_) => "upsert_edge",
            Self::ObserveEdge { .. } => "observe_edge",
            Self::RemoveEdge(_) => "remove_edge",
            Self::RemoveNode(_) => "remove_node",
        }
    }
}

/// How a batch reacts to a rejected operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchPolicy {
    /// Any rejection rejects the whole batch; nothing is published.
    #[default]
    AllOrNothing,
    /// Rejected operations are reported and skipped; the rest publish.
    SkipRejected,
}

/// An ordered list of graph operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphBatch {
    ops: Vec<GraphOp>,
}

impl GraphBatch {
    /// Creates an empty batch.
    #[must_use]
    pub const fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Appends an operation.
    pub fn push(&mut self, op: GraphOp) {
        self.ops.push(op);
    }

    /// Appends a node upsert.
    #[must_use]
    pub fn upsert_node(mut self, node: Node) -> Self {
        self.ops.push(GraphOp::UpsertNode(node));
        self
    }

    /// Appends an edge upsert.
    #[must_use]
    pub fn upsert_edge(mut self, edge: Edge) -> Self {
        self.ops.push(GraphOp::UpsertEdge(edge));
        self
    }

    /// Appends an edge observation.
    #[must_use]
    pub fn observe_edge(
        mut self,
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        kind: EdgeKind,
    ) -> Self {
        self.ops.push(GraphOp::ObserveEdge {
            from: from.into(),
            to: to.into(),
            kind,
        });
        self
    }

    /// Appends an embedding update.
    #[must_use]
    pub fn set_embedding(mut self, id: impl Into<NodeId>, embedding: Vec<f32>) -> Self {
        self.ops.push(GraphOp::SetEmbedding {
            id: id.into(),
            embedding,
        });
        self
    }

    /// Appends an edge removal.
    #[must_use]
    pub fn remove_edge(mut self, key: EdgeKey) -> Self {
        self.ops.push(GraphOp::RemoveEdge(key));
        self
    }

    /// Appends a node removal.
    #[must_use]
    pub fn remove_node(mut self, id: impl Into<NodeId>) -> Self {
        self.ops.push(GraphOp::RemoveNode(id.into()));
        self
    }

    /// Returns the number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` if the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consumes the batch into its operations.
    #[must_use]
    pub fn into_ops(self) -> Vec<GraphOp> {
        self.ops
    }
}

impl From<Vec<GraphOp>> for GraphBatch {
    fn from(ops: Vec<GraphOp>) -> Self {
        Self { ops }
    }
}

/// An operation skipped under [`BatchPolicy::SkipRejected`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedOp {
    /// Position in the batch.
    pub index: usize,
    /// Operation label.
    pub op: &'static str,
    /// Rejection reason.
    pub reason: String,
}

/// Outcome of applying a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Graph version after the batch; unchanged if nothing applied.
    pub version: u64,
    /// Operations applied.
    pub applied: usize,
    /// Operations skipped.
    pub rejected: Vec<RejectedOp>,
}

impl BatchReport {
    /// Returns `true` if every operation applied.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}
