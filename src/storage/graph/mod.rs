//! Versioned capability graph store.
//!
//! The store holds one published [`GraphSnapshot`] at a time. Readers clone
//! the `Arc` and never wait on writers; a single writer applies each
//! [`GraphBatch`] to a private copy and publishes the result with one
//! version bump.
//!
//! # Commit Pipeline
//!
//! | Step | Under writer lock | Notes |
//! |------|-------------------|-------|
//! | Apply ops to a cloned state | Yes | Validation and cycle checks per op |
//! | Build snapshot | Yes | Vector index rebuilt only if an embedding changed |
//! | Publish | Yes | `RwLock` held for the pointer swap only |
//! | Notify listeners | Yes | In version order, with planner-arc changes |
//!
//! # Example
//!
//! ```rust
//! use capgraph::storage::graph::{Direction, GraphConfig, GraphStore};
//! use capgraph::models::{Edge, EdgeKind, EdgeSource, Node, NodeId};
//!
//! let store = GraphStore::new(GraphConfig::default());
//! store.add_node(Node::tool("a")).unwrap();
//! store.add_node(Node::tool("b")).unwrap();
//! store
//!     .add_edge(Edge::new("a", "b", EdgeKind::Provides, EdgeSource::Observed))
//!     .unwrap();
//!
//! let snapshot = store.snapshot();
//! assert_eq!(snapshot.version(), 3);
//! assert_eq!(
//!     snapshot.neighbors(&NodeId::new("a"), Direction::Outgoing),
//!     vec![NodeId::new("b")]
//! );
//! ```

mod analytics;
pub mod batch;
mod snapshot;
mod state;

pub use batch::{BatchPolicy, BatchReport, GraphBatch, GraphOp, RejectedOp};
pub use snapshot::{ArcChange, ArcKey, Direction, GraphSnapshot, PlannerArc};

use crate::models::{Edge, EdgeKey, EdgeKind, Node, NodeId};
use crate::storage::locks::{acquire_lock, read_lock, write_lock};
use crate::storage::vector::FlatVectorIndex;
use crate::{Error, Result};
use serde::Deserialize;
use state::GraphState;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tracing::instrument;

/// Graph store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Required embedding width; 0 accepts any width.
    pub embedding_dimensions: usize,
    /// Confidence gained per repeated observation of an edge.
    pub reinforcement_rate: f64,
    /// PageRank damping factor.
    pub pagerank_damping: f64,
    /// PageRank power iterations.
    pub pagerank_iterations: usize,
    /// Label propagation rounds.
    pub label_propagation_iterations: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            embedding_dimensions: crate::embedding::DEFAULT_DIMENSIONS,
            reinforcement_rate: 0.2,
            pagerank_damping: 0.85,
            pagerank_iterations: 30,
            label_propagation_iterations: 20,
        }
    }
}

impl GraphConfig {
    /// Sets the required embedding width.
    #[must_use]
    pub const fn with_embedding_dimensions(mut self, dimensions: usize) -> Self {
        self.embedding_dimensions = dimensions;
        self
    }

    /// Sets the reinforcement rate.
    #[must_use]
    pub const fn with_reinforcement_rate(mut self, rate: f64) -> Self {
        self.reinforcement_rate = rate;
        self
    }

    /// Sets the PageRank damping factor.
    #[must_use]
    pub const fn with_pagerank_damping(mut self, damping: f64) -> Self {
        self.pagerank_damping = damping;
        self
    }

    /// Applies environment variable overrides.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `CAPGRAPH_GRAPH_EMBEDDING_DIMENSIONS` | Required width |
    /// | `CAPGRAPH_GRAPH_REINFORCEMENT_RATE` | Observation reinforcement |
    /// | `CAPGRAPH_GRAPH_PAGERANK_DAMPING` | Damping factor |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("CAPGRAPH_GRAPH_EMBEDDING_DIMENSIONS")
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.embedding_dimensions = parsed;
        }
        if let Ok(v) = std::env::var("CAPGRAPH_GRAPH_REINFORCEMENT_RATE")
            && let Ok(parsed) = v.parse::<f64>()
        {
            self.reinforcement_rate = parsed.clamp(0.0, 1.0);
        }
        if let Ok(v) = std::env::var("CAPGRAPH_GRAPH_PAGERANK_DAMPING")
            && let Ok(parsed) = v.parse::<f64>()
        {
            self.pagerank_damping = parsed.clamp(0.0, 1.0);
        }
        self
    }
}

/// A node or edge touched by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphChange {
    /// Node added, replaced, or re-embedded.
    NodeUpserted(NodeId),
    /// Node removed together with its incident edges.
    NodeRemoved(NodeId),
    /// Edge added, replaced, or observed.
    EdgeUpserted(EdgeKey),
    /// Edge removed.
    EdgeRemoved(EdgeKey),
}

impl GraphChange {
    fn from_op(op: &GraphOp) -> Self {
        match op {
            GraphOp::UpsertNode(node) => Self::NodeUpserted(node.id.clone()),
            GraphOp::SetEmbedding { id, .. } => Self::NodeUpserted(id.clone()),
            GraphOp::UpsertEdge(edge) => Self::EdgeUpserted(edge.key()),
            GraphOp::ObserveEdge { from, to, kind } => {
                Self::EdgeUpserted(EdgeKey::new(from.clone(), to.clone(), *kind))
            },
            GraphOp::RemoveEdge(key) => Self::EdgeRemoved(key.clone()),
            GraphOp::RemoveNode(id) => Self::NodeRemoved(id.clone()),
        }
    }
}

/// Description of one published version.
#[derive(Debug, Clone, Default)]
pub struct GraphCommit {
    /// Version that was published.
    pub version: u64,
    /// Nodes and edges touched, in application order.
    pub changes: Vec<GraphChange>,
    /// Planner arcs whose cost changed, ordered by key.
    pub arc_changes: Vec<ArcChange>,
}

/// Receives every commit, in version order, inside the writer section.
///
/// Implementations must not call back into the store's write path.
pub trait GraphListener: Send + Sync {
    /// Called after `snapshot` has been published.
    fn on_commit(&self, snapshot: &Arc<GraphSnapshot>, commit: &GraphCommit);
}

/// Thread-safe versioned graph store.
pub struct GraphStore {
    config: GraphConfig,
    current: RwLock<Arc<GraphSnapshot>>,
    writer: Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn GraphListener>>>,
}

impl std::fmt::Debug for GraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphStore")
            .field("config", &self.config)
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

impl GraphStore {
    /// Creates an empty store at version 0.
    #[must_use]
    pub fn new(config: GraphConfig) -> Self {
        let empty = GraphSnapshot::empty(config.clone());
        Self {
            config,
            current: RwLock::new(Arc::new(empty)),
            writer: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Rebuilds a store from persisted nodes and edges.
    ///
    /// Nodes are loaded tools first so capabilities find their members.
    /// Anything that fails validation is a data inconsistency: it is logged,
    /// counted, and skipped. Returns the store and the number of skipped
    /// records.
    pub fn restore(
        config: GraphConfig,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
        version: u64,
    ) -> (Self, usize) {
        let mut state = GraphState::default();

        let (tools, mut pending): (Vec<Node>, Vec<Node>) =
            nodes.into_iter().partition(|n| !n.is_capability());
        let mut failures: Vec<(&'static str, Error)> = Vec::new();
        for node in tools {
            if let Err(e) = state.apply(GraphOp::UpsertNode(node), &config) {
                failures.push(("upsert_node", e));
            }
        }
        // Capabilities may nest; retry until a pass makes no progress.
        loop {
            let before = pending.len();
            let mut retry = Vec::new();
            let mut last_errors = Vec::new();
            for node in pending {
                if let Err(e) = state.apply(GraphOp::UpsertNode(node.clone()), &config) {
                    retry.push(node);
                    last_errors.push(("upsert_node", e));
                }
            }
            pending = retry;
            if pending.is_empty() || pending.len() == before {
                failures.extend(last_errors);
                break;
            }
        }
        for edge in edges {
            if let Err(e) = state.apply(GraphOp::UpsertEdge(edge), &config) {
                failures.push(("upsert_edge", e));
            }
        }

        let skipped = failures.len();
        for (label, e) in failures {
            let err = Error::DataInconsistency(e.to_string());
            tracing::warn!(op = label, error = %err, "Skipping persisted graph record");
            metrics::counter!("graph_data_inconsistencies_total", "kind" => label).increment(1);
        }

        let vectors = Arc::new(FlatVectorIndex::from_nodes(state.nodes.values()));
        let snapshot = GraphSnapshot::build(state, version, vectors, config.clone());
        let store = Self {
            config,
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        };
        (store, skipped)
    }

    /// Returns the store configuration.
    #[must_use]
    pub const fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        Arc::clone(&read_lock(&self.current, "graph_snapshot"))
    }

    /// Returns the current version.
    #[must_use]
    pub fn version(&self) -> u64 {
        read_lock(&self.current, "graph_snapshot").version()
    }

    /// Registers a commit listener.
    pub fn subscribe(&self, listener: Arc<dyn GraphListener>) {
        // Taking the writer lock orders registration against in-flight commits.
        let _writer = acquire_lock(&self.writer, "graph_writer");
        write_lock(&self.listeners, "graph_listeners").push(listener);
    }

    /// Applies a batch and publishes the result as one version.
    ///
    /// Under [`BatchPolicy::AllOrNothing`] the first rejected operation is
    /// returned as the error and nothing is published. Under
    /// [`BatchPolicy::SkipRejected`] rejected operations are reported and the
    /// remainder publishes. A batch that applies nothing leaves the version
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CycleRejected`] or [`Error::InvalidInput`] for a
    /// rejected operation under `AllOrNothing`.
    #[instrument(
        name = "capgraph.graph.apply_batch",
        skip(self, batch),
        fields(component = "graph", operation = "apply_batch", ops = batch.len())
    )]
    pub fn apply_batch(&self, batch: GraphBatch, policy: BatchPolicy) -> Result<BatchReport> {
        let start = Instant::now();
        let _writer = acquire_lock(&self.writer, "graph_writer");
        let current = self.snapshot();
        let mut state = current.state().clone();

        let mut changes = Vec::new();
        let mut rejected = Vec::new();
        let mut embeddings_changed = false;

        for (index, op) in batch.into_ops().into_iter().enumerate() {
            let change = GraphChange::from_op(&op);
            let label = op.label();
            match state.apply(op, &self.config) {
                Ok(effect) => {
                    embeddings_changed |= effect.embeddings_changed;
                    changes.push(change);
                },
                Err(e) => {
                    if matches!(e, Error::CycleRejected { .. }) {
                        metrics::counter!("graph_cycle_rejections_total").increment(1);
                    }
                    match policy {
                        BatchPolicy::AllOrNothing => {
                            metrics::counter!("graph_batches_rejected_total").increment(1);
                            tracing::debug!(index, op = label, error = %e, "Batch rejected");
                            return Err(e);
                        },
                        BatchPolicy::SkipRejected => {
                            tracing::warn!(index, op = label, error = %e, "Skipping rejected graph op");
                            rejected.push(RejectedOp {
                                index,
                                op: label,
                                reason: e.to_string(),
                            });
                        },
                    }
                },
            }
        }

        if changes.is_empty() {
            return Ok(BatchReport {
                version: current.version(),
                applied: 0,
                rejected,
            });
        }

        let vectors = if embeddings_changed {
            Arc::new(FlatVectorIndex::from_nodes(state.nodes.values()))
        } else {
            current.vectors_arc()
        };
        let version = current.version() + 1;
        let next = Arc::new(GraphSnapshot::build(
            state,
            version,
            vectors,
            self.config.clone(),
        ));
        let commit = GraphCommit {
            version,
            arc_changes: next.arc_delta(&current),
            changes,
        };

        *write_lock(&self.current, "graph_snapshot") = Arc::clone(&next);

        let listeners = read_lock(&self.listeners, "graph_listeners").clone();
        for listener in &listeners {
            listener.on_commit(&next, &commit);
        }

        metrics::counter!("graph_commits_total").increment(1);
        metrics::gauge!("graph_version").set(crate::gc::u64_to_f64(version));
        metrics::gauge!("graph_nodes").set(crate::gc::usize_to_f64(next.node_count()));
        metrics::histogram!("graph_commit_duration_ms").record(crate::gc::u64_to_f64(
            crate::gc::duration_to_millis(start.elapsed()),
        ));
        tracing::debug!(
            version,
            applied = commit.changes.len(),
            rejected = rejected.len(),
            arc_changes = commit.arc_changes.len(),
            "Published graph version"
        );

        Ok(BatchReport {
            version,
            applied: commit.changes.len(),
            rejected,
        })
    }

    fn apply_one(&self, op: GraphOp) -> Result<u64> {
        self.apply_batch(GraphBatch::from(vec![op]), BatchPolicy::AllOrNothing)
            .map(|report| report.version)
    }

    /// Adds or replaces a node. Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a malformed capability and
    /// [`Error::CycleRejected`] if its structure closes a causal cycle.
    pub fn add_node(&self, node: Node) -> Result<u64> {
        self.apply_one(GraphOp::UpsertNode(node))
    }

    /// Adds or replaces an edge. Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CycleRejected`] if a causal edge closes a cycle and
    /// [`Error::InvalidInput`] for unknown endpoints.
    pub fn add_edge(&self, edge: Edge) -> Result<u64> {
        self.apply_one(GraphOp::UpsertEdge(edge))
    }

    /// Records an observation of an edge. Returns the new version.
    ///
    /// # Errors
    ///
    /// Same as [`Self::add_edge`].
    pub fn observe_edge(
        &self,
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        kind: EdgeKind,
    ) -> Result<u64> {
        self.apply_one(GraphOp::ObserveEdge {
            from: from.into(),
            to: to.into(),
            kind,
        })
    }

    /// Removes a node and its incident edges. Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the node is unknown or is a member
    /// of a capability.
    pub fn remove_node(&self, id: impl Into<NodeId>) -> Result<u64> {
        self.apply_one(GraphOp::RemoveNode(id.into()))
    }

    /// Removes an edge. Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the edge is unknown.
    pub fn remove_edge(&self, key: EdgeKey) -> Result<u64> {
        self.apply_one(GraphOp::RemoveEdge(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EdgeSource;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn store_with(ids: &[&str]) -> GraphStore {
        let store = GraphStore::new(GraphConfig::default());
        let batch = ids
            .iter()
            .fold(GraphBatch::new(), |b, id| b.upsert_node(Node::tool(*id)));
        store.apply_batch(batch, BatchPolicy::AllOrNothing).unwrap();
        store
    }

    fn provides(from: &str, to: &str) -> Edge {
        Edge::new(from, to, EdgeKind::Provides, EdgeSource::Template)
    }

    #[test]
    fn test_batch_is_one_version_bump() {
        let store = store_with(&["a", "b", "c"]);
        assert_eq!(store.version(), 1);
        assert_eq!(store.snapshot().node_count(), 3);
    }

    #[test]
    fn test_all_or_nothing_rejection_leaves_snapshot() {
        let store = store_with(&["a", "b"]);
        store.add_edge(provides("a", "b")).unwrap();
        let before = store.snapshot();

        let batch = GraphBatch::new()
            .upsert_node(Node::tool("c"))
            .upsert_edge(provides("b", "a"));
        let err = store
            .apply_batch(batch, BatchPolicy::AllOrNothing)
            .unwrap_err();

        assert!(matches!(err, Error::CycleRejected { .. }));
        let after = store.snapshot();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(!after.contains(&NodeId::new("c")));
    }

    #[test]
    fn test_skip_rejected_publishes_remainder() {
        let store = store_with(&["a", "b"]);
        store.add_edge(provides("a", "b")).unwrap();
        let version = store.version();

        let batch = GraphBatch::new()
            .upsert_edge(provides("b", "a"))
            .upsert_node(Node::tool("c"));
        let report = store.apply_batch(batch, BatchPolicy::SkipRejected).unwrap();

        assert_eq!(report.version, version + 1);
        assert_eq!(report.applied, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].index, 0);
        assert!(store.snapshot().contains(&NodeId::new("c")));
    }

    #[test]
    fn test_empty_effect_keeps_version() {
        let store = store_with(&["a"]);
        let report = store
            .apply_batch(
                GraphBatch::new().remove_node("ghost"),
                BatchPolicy::SkipRejected,
            )
            .unwrap();
        assert_eq!(report.version, 1);
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn test_old_snapshot_survives_publication() {
        let store = store_with(&["a", "b"]);
        let held = store.snapshot();
        store.add_edge(provides("a", "b")).unwrap();
        assert_eq!(held.edge_count(), 0);
        assert_eq!(store.snapshot().edge_count(), 1);
    }

    #[test]
    fn test_vector_index_shared_until_embedding_changes() {
        let store = GraphStore::new(GraphConfig::default().with_embedding_dimensions(2));
        store
            .add_node(Node::tool("a").with_embedding(vec![1.0, 0.0]))
            .unwrap();
        let first = store.snapshot().vectors_arc();
        store.add_node(Node::tool("b")).unwrap();
        assert!(Arc::ptr_eq(&first, &store.snapshot().vectors_arc()));

        store
            .apply_batch(
                GraphBatch::new().set_embedding("a", vec![0.0, 1.0]),
                BatchPolicy::AllOrNothing,
            )
            .unwrap();
        let hits = store.snapshot().vector_index().search(&[0.0, 1.0], 1);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
    }

    struct CountingListener {
        last_version: AtomicU64,
        arc_changes: AtomicU64,
    }

    impl GraphListener for CountingListener {
        fn on_commit(&self, _snapshot: &Arc<GraphSnapshot>, commit: &GraphCommit) {
            self.last_version.store(commit.version, Ordering::SeqCst);
            self.arc_changes
                .fetch_add(commit.arc_changes.len() as u64, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_listener_sees_commits_with_arc_changes() {
        let store = store_with(&["a", "b"]);
        let listener = Arc::new(CountingListener {
            last_version: AtomicU64::new(0),
            arc_changes: AtomicU64::new(0),
        });
        store.subscribe(Arc::clone(&listener) as Arc<dyn GraphListener>);

        store.add_edge(provides("a", "b")).unwrap();
        assert_eq!(listener.last_version.load(Ordering::SeqCst), 2);
        assert_eq!(listener.arc_changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_restore_skips_dangling_edges() {
        let nodes = vec![Node::tool("a"), Node::tool("b")];
        let edges = vec![provides("a", "b"), provides("b", "ghost")];
        let (store, skipped) = GraphStore::restore(GraphConfig::default(), nodes, edges, 9);
        assert_eq!(skipped, 1);
        assert_eq!(store.version(), 9);
        assert_eq!(store.snapshot().edge_count(), 1);
    }
}
