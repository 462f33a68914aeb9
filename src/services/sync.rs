//! Graph synchronization service.
//!
//! Brings the graph in line with the outside world. Two inputs feed it:
//!
//! | Input | Source | Becomes |
//! |-------|--------|---------|
//! | Action catalog | [`ActionCatalog::list_actions`] | Tool and capability nodes, with embeddings |
//! | Observed execution | [`ObservedExecution`] | Observed `sequence` and `provides` edges |
//!
//! Each call publishes at most one graph version. Rejected operations (a
//! capability with unknown members, an edge that would close a cycle) are
//! logged and reported, and the rest of the batch still applies.

use crate::embedding::Embedder;
use crate::models::{
    CapabilitySpec, EdgeKind, Node, NodeId, StructureEdge,
};
use crate::storage::{BatchPolicy, BatchReport, GraphBatch, GraphStore};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Kind of a catalog action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// A single invocable action.
    Tool,
    /// A composite action over member actions.
    Capability,
}

/// An action as listed by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    /// Action id, used as the node id.
    pub id: NodeId,
    /// Tool or capability.
    pub kind: ActionKind,
    /// Text to embed; the id is used when absent.
    #[serde(default)]
    pub embedding_hint: Option<String>,
    /// Members, for capabilities.
    #[serde(default)]
    pub members: Vec<NodeId>,
    /// Relations among members, for capabilities.
    #[serde(default)]
    pub structure: Vec<StructureEdge>,
    /// Free-form metadata copied onto the node.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ActionDescriptor {
    /// Describes a tool.
    #[must_use]
    pub fn tool(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            kind: ActionKind::Tool,
            embedding_hint: None,
            members: Vec::new(),
            structure: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Describes a capability over `members`.
    #[must_use]
    pub fn capability(id: impl Into<NodeId>, members: Vec<NodeId>) -> Self {
        Self {
            kind: ActionKind::Capability,
            members,
            ..Self::tool(id)
        }
    }

    /// Sets the embedding hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.embedding_hint = Some(hint.into());
        self
    }

    /// Adds a member relation.
    #[must_use]
    pub fn with_structure_edge(mut self, edge: StructureEdge) -> Self {
        self.structure.push(edge);
        self
    }

    /// Sets the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    fn embedding_text(&self) -> &str {
        self.embedding_hint
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| self.id.as_str())
    }
}

/// Lists the actions available to the orchestrator.
pub trait ActionCatalog: Send + Sync {
    /// Returns every available action.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read.
    fn list_actions(&self) -> Result<Vec<ActionDescriptor>>;
}

/// Invokes actions.
///
/// The engine never calls this. It names the contract the orchestrator
/// fulfils when it acts on a suggestion.
pub trait ActionInvoker: Send + Sync {
    /// Runs an action with arguments.
    ///
    /// # Errors
    ///
    /// Returns the action's failure.
    fn invoke(&self, action_id: &NodeId, args: serde_json::Value) -> Result<serde_json::Value>;
}

/// A fixed in-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    actions: Vec<ActionDescriptor>,
}

impl StaticCatalog {
    /// Creates a catalog from descriptors.
    #[must_use]
    pub const fn new(actions: Vec<ActionDescriptor>) -> Self {
        Self { actions }
    }
}

impl ActionCatalog for StaticCatalog {
    fn list_actions(&self) -> Result<Vec<ActionDescriptor>> {
        Ok(self.actions.clone())
    }
}

/// A completed run, reported by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedExecution {
    /// Context the run belonged to.
    pub context_key: String,
    /// Actions in invocation order.
    pub steps: Vec<NodeId>,
    /// Observed data flow: `(producer, consumer)` pairs.
    #[serde(default)]
    pub provides: Vec<(NodeId, NodeId)>,
}

impl ObservedExecution {
    /// Creates an execution trace.
    #[must_use]
    pub fn new(context_key: impl Into<String>, steps: Vec<NodeId>) -> Self {
        Self {
            context_key: context_key.into(),
            steps,
            provides: Vec::new(),
        }
    }

    /// Adds an observed data-flow pair.
    #[must_use]
    pub fn with_provides(mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        self.provides.push((from.into(), to.into()));
        self
    }
}

/// Statistics from a catalog synchronization.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Nodes written.
    pub upserted: usize,
    /// Nodes embedded in this pass.
    pub embedded: usize,
    /// Embedding calls that failed.
    pub embedding_failures: usize,
    /// Operations the graph rejected.
    pub rejected: usize,
    /// Graph version after the pass.
    pub version: u64,
}

impl SyncStats {
    /// Returns true if nothing changed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.upserted == 0 && self.rejected == 0
    }

    /// Returns a human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.is_empty() {
            "Catalog already in sync".to_string()
        } else {
            format!(
                "Upserted: {}, Embedded: {}, Rejected: {}",
                self.upserted, self.embedded, self.rejected
            )
        }
    }
}

/// Orders descriptors so nested capabilities follow their members.
///
/// Capabilities whose members never resolve keep their catalog order at the
/// end; the graph rejects them.
fn ordered(actions: Vec<ActionDescriptor>, graph: &GraphStore) -> Vec<ActionDescriptor> {
    let snapshot = graph.snapshot();
    let (mut out, mut capabilities): (Vec<_>, Vec<_>) = actions
        .into_iter()
        .partition(|a| a.kind == ActionKind::Tool);
    let mut placed: HashSet<NodeId> = out.iter().map(|a| a.id.clone()).collect();

    while !capabilities.is_empty() {
        let (ready, waiting): (Vec<_>, Vec<_>) = capabilities.into_iter().partition(|a| {
            a.members
                .iter()
                .all(|m| placed.contains(m) || snapshot.contains(m))
        });
        if ready.is_empty() {
            out.extend(waiting);
            break;
        }
        placed.extend(ready.iter().map(|a| a.id.clone()));
        out.extend(ready);
        capabilities = waiting;
    }
    out
}

/// Writes catalog and execution data into the graph.
pub struct SyncService {
    graph: Arc<GraphStore>,
    embedder: Arc<dyn Embedder>,
}

impl SyncService {
    /// Creates a sync service.
    #[must_use]
    pub fn new(graph: Arc<GraphStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { graph, embedder }
    }

    /// Upserts every catalog action as one graph version.
    ///
    /// When embedding fails for an action, its previous embedding is kept,
    /// or it stays unembedded.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be listed.
    #[instrument(
        name = "capgraph.sync.catalog",
        skip(self, catalog),
        fields(component = "sync", operation = "catalog")
    )]
    pub fn sync_catalog(&self, catalog: &dyn ActionCatalog) -> Result<SyncStats> {
        let start = Instant::now();
        let result = (|| {
            let actions = catalog.list_actions()?;
            self.sync_actions(actions)
        })();

        let status = if result.is_ok() { "success" } else { "error" };
        metrics::counter!("graph_sync_total", "source" => "catalog", "status" => status)
            .increment(1);
        metrics::histogram!("graph_sync_duration_ms", "source" => "catalog")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        result
    }

    /// Upserts a list of actions as one graph version.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be applied.
    pub fn sync_actions(&self, actions: Vec<ActionDescriptor>) -> Result<SyncStats> {
        let snapshot = self.graph.snapshot();
        let mut stats = SyncStats::default();
        let mut batch = GraphBatch::new();

        for action in ordered(actions, &self.graph) {
            let node = match action.kind {
                ActionKind::Tool => Node::tool(action.id.clone()),
                ActionKind::Capability => {
                    let mut spec = CapabilitySpec::new(action.members.clone());
                    for edge in &action.structure {
                        spec = spec.with_edge(edge.clone());
                    }
                    Node::capability(action.id.clone(), spec)
                },
            }
            .with_metadata(action.metadata.clone());

            let node = match self.embedder.embed(action.embedding_text()) {
                Ok(embedding) => {
                    stats.embedded += 1;
                    node.with_embedding(embedding)
                },
                Err(e) => {
                    warn!(action = %action.id, error = %e, "Embedding failed, keeping previous vector");
                    metrics::counter!("sync_embedding_failures_total").increment(1);
                    stats.embedding_failures += 1;
                    match snapshot.node(&action.id).and_then(|n| n.embedding.clone()) {
                        Some(previous) => node.with_embedding(previous),
                        None => node,
                    }
                },
            };
            batch = batch.upsert_node(node);
        }

        if batch.is_empty() {
            stats.version = self.graph.version();
            return Ok(stats);
        }
        let report = self.graph.apply_batch(batch, BatchPolicy::SkipRejected)?;
        stats.upserted = report.applied;
        stats.rejected = report.rejected.len();
        stats.version = report.version;

        info!(
            upserted = stats.upserted,
            embedded = stats.embedded,
            rejected = stats.rejected,
            version = stats.version,
            "Catalog synchronized"
        );
        Ok(stats)
    }

    /// Records an observed execution as edge observations in one version.
    ///
    /// Consecutive steps become observed `sequence` edges; declared data flow
    /// becomes observed `provides` edges. Repeated steps are not linked to
    /// themselves.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the trace has no steps and no data
    /// flow, or an error if the batch cannot be applied.
    #[instrument(
        name = "capgraph.sync.execution",
        skip(self, execution),
        fields(
            component = "sync",
            operation = "execution",
            context = %execution.context_key,
            steps = execution.steps.len()
        )
    )]
    pub fn sync_execution(&self, execution: &ObservedExecution) -> Result<BatchReport> {
        if execution.steps.is_empty() && execution.provides.is_empty() {
            return Err(Error::InvalidInput(
                "observed execution has no steps".to_string(),
            ));
        }
        let mut batch = GraphBatch::new();
        for pair in execution.steps.windows(2) {
            if pair[0] != pair[1] {
                batch = batch.observe_edge(pair[0].clone(), pair[1].clone(), EdgeKind::Sequence);
            }
        }
        for (from, to) in &execution.provides {
            batch = batch.observe_edge(from.clone(), to.clone(), EdgeKind::Provides);
        }
        if batch.is_empty() {
            return Ok(BatchReport {
                version: self.graph.version(),
                ..Default::default()
            });
        }

        let report = self.graph.apply_batch(batch, BatchPolicy::SkipRejected)?;
        for rejected in &report.rejected {
            warn!(
                index = rejected.index,
                op = rejected.op,
                reason = %rejected.reason,
                "Observation rejected"
            );
        }
        metrics::counter!("graph_sync_total", "source" => "execution", "status" => "success")
            .increment(1);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::models::{EdgeKey, EdgeSource, StructureEdgeKind};
    use crate::storage::GraphConfig;

    struct BrokenEmbedder;

    impl Embedder for BrokenEmbedder {
        fn dimensions(&self) -> usize {
            32
        }

        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(Error::EmbeddingUnavailable("offline".to_string()))
        }
    }

    fn service(embedder: Arc<dyn Embedder>) -> (Arc<GraphStore>, SyncService) {
        let graph = Arc::new(GraphStore::new(
            GraphConfig::default().with_embedding_dimensions(32),
        ));
        let service = SyncService::new(Arc::clone(&graph), embedder);
        (graph, service)
    }

    fn catalog() -> StaticCatalog {
        StaticCatalog::new(vec![
            ActionDescriptor::capability(
                "ingest",
                vec![NodeId::new("fetch"), NodeId::new("parse")],
            )
            .with_structure_edge(StructureEdge::new("fetch", "parse", StructureEdgeKind::Provides)),
            ActionDescriptor::capability("pipeline", vec![NodeId::new("ingest"), NodeId::new("store")]),
            ActionDescriptor::tool("fetch").with_hint("download a url"),
            ActionDescriptor::tool("parse"),
            ActionDescriptor::tool("store"),
        ])
    }

    #[test]
    fn test_catalog_sync_is_one_version() {
        let (graph, service) = service(Arc::new(HashEmbedder::with_dimensions(32)));
        let stats = service.sync_catalog(&catalog()).unwrap();
        assert_eq!(stats.upserted, 5);
        assert_eq!(stats.rejected, 0);
        assert_eq!(stats.version, 1);
        assert_eq!(graph.version(), 1);

        let snapshot = graph.snapshot();
        assert!(snapshot.node(&NodeId::new("pipeline")).unwrap().is_capability());
        assert!(snapshot.node(&NodeId::new("fetch")).unwrap().embedding.is_some());
    }

    #[test]
    fn test_capability_with_unknown_member_rejected() {
        let (graph, service) = service(Arc::new(HashEmbedder::with_dimensions(32)));
        let catalog = StaticCatalog::new(vec![
            ActionDescriptor::tool("a"),
            ActionDescriptor::capability("broken", vec![NodeId::new("a"), NodeId::new("ghost")]),
        ]);
        let stats = service.sync_catalog(&catalog).unwrap();
        assert_eq!(stats.upserted, 1);
        assert_eq!(stats.rejected, 1);
        assert!(!graph.snapshot().contains(&NodeId::new("broken")));
    }

    #[test]
    fn test_embedding_failure_keeps_previous_vector() {
        let (graph, service) = service(Arc::new(HashEmbedder::with_dimensions(32)));
        service.sync_catalog(&catalog()).unwrap();
        let before = graph.snapshot().node(&NodeId::new("fetch")).unwrap().embedding.clone();

        let broken = SyncService::new(Arc::clone(&graph), Arc::new(BrokenEmbedder));
        let stats = broken.sync_catalog(&catalog()).unwrap();
        assert_eq!(stats.embedding_failures, 5);
        assert_eq!(stats.embedded, 0);
        let after = graph.snapshot().node(&NodeId::new("fetch")).unwrap().embedding.clone();
        assert_eq!(before, after);
    }

    #[test]
    fn test_execution_observes_edges() {
        let (graph, service) = service(Arc::new(HashEmbedder::with_dimensions(32)));
        service.sync_catalog(&catalog()).unwrap();
        let execution = ObservedExecution::new(
            "etl",
            vec![NodeId::new("fetch"), NodeId::new("parse"), NodeId::new("parse"), NodeId::new("store")],
        )
        .with_provides("parse", "store");

        let report = service.sync_execution(&execution).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.applied, 3);

        let snapshot = graph.snapshot();
        let seq = snapshot
            .edge(&EdgeKey::new("fetch", "parse", EdgeKind::Sequence))
            .unwrap();
        assert_eq!(seq.source, EdgeSource::Observed);
        assert!(
            snapshot
                .edge(&EdgeKey::new("parse", "store", EdgeKind::Provides))
                .is_some()
        );
    }

    #[test]
    fn test_cycle_closing_observation_reported() {
        let (_, service) = service(Arc::new(HashEmbedder::with_dimensions(32)));
        service.sync_catalog(&catalog()).unwrap();
        let execution = ObservedExecution::new("etl", vec![])
            .with_provides("parse", "store")
            .with_provides("store", "parse");
        let report = service.sync_execution(&execution).unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.rejected.len(), 1);
    }

    #[test]
    fn test_empty_execution_rejected() {
        let (_, service) = service(Arc::new(HashEmbedder::with_dimensions(32)));
        let result = service.sync_execution(&ObservedExecution::new("etl", vec![]));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_sync_stats_summary() {
        assert_eq!(SyncStats::default().summary(), "Catalog already in sync");
        let stats = SyncStats {
            upserted: 3,
            embedded: 2,
            rejected: 1,
            ..Default::default()
        };
        assert!(stats.summary().contains("Upserted: 3"));
    }
}
