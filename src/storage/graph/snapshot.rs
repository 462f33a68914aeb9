//! Immutable graph snapshots.
//!
//! A [`GraphSnapshot`] is one published version of the graph. Readers hold
//! an `Arc` to it for as long as they like; writers never modify it and
//! instead publish a successor. Derived structures (adjacency, planner arcs,
//! topological ranks) are built when the snapshot is created; structural
//! analytics are computed lazily on first use and cached for the snapshot's
//! lifetime.

use super::GraphConfig;
use super::analytics::GraphAnalytics;
use super::state::GraphState;
use crate::models::{
    Edge, EdgeKey, EdgeKind, EdgeSource, Node, NodeId, NodeKind, edge_weight,
};
use crate::storage::vector::FlatVectorIndex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, OnceLock};

/// Direction for neighbor queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Targets of edges leaving the node.
    Outgoing,
    /// Sources of edges entering the node.
    Incoming,
    /// Both.
    Both,
}

/// Identity of a planner arc.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArcKey {
    /// Source node.
    pub from: NodeId,
    /// Target node.
    pub to: NodeId,
    /// Capability the arc belongs to, for arcs inside a hyperedge.
    pub via: Option<NodeId>,
}

/// A planner-visible step.
///
/// Planner arcs come from `provides` relations only: top-level `provides`
/// edges, `provides` relations inside capabilities, and zero-cost exit arcs
/// from a capability's exit members to the capability itself.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerArc {
    /// Source node.
    pub from: NodeId,
    /// Target node.
    pub to: NodeId,
    /// Capability the arc belongs to, if any.
    pub via: Option<NodeId>,
    /// Traversal cost, the reciprocal of the underlying edge weight.
    pub cost: f64,
    /// Underlying edge weight in `(0, 1]`.
    pub strength: f64,
}

impl PlannerArc {
    /// Returns the arc identity.
    #[must_use]
    pub fn key(&self) -> ArcKey {
        ArcKey {
            from: self.from.clone(),
            to: self.to.clone(),
            via: self.via.clone(),
        }
    }
}

/// A planner arc that differs between two consecutive versions.
#[derive(Debug, Clone, PartialEq)]
pub struct ArcChange {
    /// Source node.
    pub from: NodeId,
    /// Target node.
    pub to: NodeId,
    /// Capability the arc belongs to, if any.
    pub via: Option<NodeId>,
    /// Cost before the change; `None` if the arc is new.
    pub old_cost: Option<f64>,
    /// Cost after the change; `None` if the arc was removed.
    pub new_cost: Option<f64>,
}

impl ArcChange {
    /// Returns `true` if the arc got cheaper or was added.
    #[must_use]
    pub fn is_decrease(&self) -> bool {
        match (self.old_cost, self.new_cost) {
            (Some(old), Some(new)) => new < old,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PlannerArcs {
    out: HashMap<NodeId, Vec<PlannerArc>>,
    inc: HashMap<NodeId, Vec<PlannerArc>>,
    costs: HashMap<ArcKey, f64>,
    rank: HashMap<NodeId, usize>,
}

impl PlannerArcs {
    fn build(state: &GraphState) -> Self {
        let mut arcs: HashMap<ArcKey, PlannerArc> = HashMap::new();
        let mut insert = |arc: PlannerArc| {
            let key = arc.key();
            match arcs.get(&key) {
                Some(existing) if existing.cost <= arc.cost => {},
                _ => {
                    arcs.insert(key, arc);
                },
            }
        };

        for edge in state.edges.values() {
            if edge.kind == EdgeKind::Provides {
                insert(PlannerArc {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    via: None,
                    cost: edge.traversal_cost(),
                    strength: edge.weight(),
                });
            }
        }

        let internal_strength = edge_weight(EdgeKind::Provides, EdgeSource::Template, 1.0);
        for node in state.nodes.values() {
            let NodeKind::Capability(spec) = &node.kind else {
                continue;
            };
            for rel in spec.provides_edges() {
                insert(PlannerArc {
                    from: rel.from.clone(),
                    to: rel.to.clone(),
                    via: Some(node.id.clone()),
                    cost: 1.0 / internal_strength,
                    strength: internal_strength,
                });
            }
            for exit in spec.exit_members() {
                insert(PlannerArc {
                    from: exit.clone(),
                    to: node.id.clone(),
                    via: Some(node.id.clone()),
                    cost: 0.0,
                    strength: 1.0,
                });
            }
        }

        let mut result = Self::default();
        let mut keys: Vec<ArcKey> = arcs.keys().cloned().collect();
        keys.sort();
        for key in keys {
            if let Some(arc) = arcs.remove(&key) {
                result.costs.insert(key, arc.cost);
                result
                    .inc
                    .entry(arc.to.clone())
                    .or_default()
                    .push(arc.clone());
                result.out.entry(arc.from.clone()).or_default().push(arc);
            }
        }
        result.rank = Self::topological_rank(state, &result.out);
        result
    }

    /// Kahn's algorithm over planner arcs, smallest id first.
    fn topological_rank(
        state: &GraphState,
        out: &HashMap<NodeId, Vec<PlannerArc>>,
    ) -> HashMap<NodeId, usize> {
        let mut in_degree: HashMap<&NodeId, usize> =
            state.nodes.keys().map(|id| (id, 0)).collect();
        for arcs in out.values() {
            for arc in arcs {
                if let Some(d) = in_degree.get_mut(&arc.to) {
                    *d += 1;
                }
            }
        }

        let mut ready: BTreeSet<&NodeId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut rank = HashMap::with_capacity(in_degree.len());
        while let Some(id) = ready.pop_first() {
            rank.insert(id.clone(), rank.len());
            for arc in out.get(id).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(&arc.to) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(&arc.to);
                    }
                }
            }
        }

        if rank.len() < in_degree.len() {
            // Unreachable while the causal check holds; keep every node ranked.
            tracing::warn!(
                unranked = in_degree.len() - rank.len(),
                "Planner arcs contain a cycle; ranking remaining nodes by id"
            );
            metrics::counter!("graph_data_inconsistencies_total", "kind" => "planner_cycle")
                .increment(1);
            let mut remaining: Vec<&NodeId> = in_degree
                .keys()
                .filter(|id| !rank.contains_key(**id))
                .copied()
                .collect();
            remaining.sort();
            for id in remaining {
                rank.insert(id.clone(), rank.len());
            }
        }
        rank
    }
}

/// One immutable version of the graph.
#[derive(Debug)]
pub struct GraphSnapshot {
    version: u64,
    state: GraphState,
    config: GraphConfig,
    vectors: Arc<FlatVectorIndex>,
    out_edges: HashMap<NodeId, Vec<EdgeKey>>,
    in_edges: HashMap<NodeId, Vec<EdgeKey>>,
    related: HashMap<NodeId, HashSet<NodeId>>,
    containing: HashMap<NodeId, Vec<NodeId>>,
    arcs: PlannerArcs,
    analytics: OnceLock<GraphAnalytics>,
}

impl GraphSnapshot {
    /// Creates the empty version-0 snapshot.
    #[must_use]
    pub fn empty(config: GraphConfig) -> Self {
        Self::build(GraphState::default(), 0, Arc::default(), config)
    }

    pub(crate) fn build(
        state: GraphState,
        version: u64,
        vectors: Arc<FlatVectorIndex>,
        config: GraphConfig,
    ) -> Self {
        let mut out_edges: HashMap<NodeId, Vec<EdgeKey>> = HashMap::new();
        let mut in_edges: HashMap<NodeId, Vec<EdgeKey>> = HashMap::new();
        let mut related: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();
        let mut containing: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

        for key in state.edges.keys() {
            out_edges.entry(key.from.clone()).or_default().push(key.clone());
            in_edges.entry(key.to.clone()).or_default().push(key.clone());
            if key.from != key.to {
                related
                    .entry(key.from.clone())
                    .or_default()
                    .insert(key.to.clone());
                related
                    .entry(key.to.clone())
                    .or_default()
                    .insert(key.from.clone());
            }
        }
        for node in state.nodes.values() {
            if let NodeKind::Capability(spec) = &node.kind {
                for member in &spec.members {
                    containing
                        .entry(member.clone())
                        .or_default()
                        .push(node.id.clone());
                    related
                        .entry(member.clone())
                        .or_default()
                        .insert(node.id.clone());
                    related
                        .entry(node.id.clone())
                        .or_default()
                        .insert(member.clone());
                }
            }
        }
        for keys in out_edges.values_mut().chain(in_edges.values_mut()) {
            keys.sort();
        }
        for caps in containing.values_mut() {
            caps.sort();
        }

        let arcs = PlannerArcs::build(&state);
        Self {
            version,
            state,
            config,
            vectors,
            out_edges,
            in_edges,
            related,
            containing,
            arcs,
            analytics: OnceLock::new(),
        }
    }

    pub(crate) const fn state(&self) -> &GraphState {
        &self.state
    }

    pub(crate) fn vectors_arc(&self) -> Arc<FlatVectorIndex> {
        Arc::clone(&self.vectors)
    }

    fn analytics(&self) -> &GraphAnalytics {
        self.analytics
            .get_or_init(|| GraphAnalytics::compute(&self.state, &self.config))
    }

    /// Returns the graph version.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Returns a node by id.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.state.nodes.get(id).map(AsRef::as_ref)
    }

    /// Returns `true` if the node exists.
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.state.nodes.contains_key(id)
    }

    /// Iterates over all nodes in unspecified order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.state.nodes.values().map(AsRef::as_ref)
    }

    /// Iterates over all edges in unspecified order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.state.edges.values()
    }

    /// Returns an edge by key.
    #[must_use]
    pub fn edge(&self, key: &EdgeKey) -> Option<&Edge> {
        self.state.edges.get(key)
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.state.nodes.len()
    }

    /// Returns the number of top-level edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.state.edges.len()
    }

    /// Returns `true` if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.nodes.is_empty()
    }

    /// Returns neighbors over top-level edges, sorted and deduplicated.
    #[must_use]
    pub fn neighbors(&self, id: &NodeId, direction: Direction) -> Vec<NodeId> {
        let mut result: BTreeSet<&NodeId> = BTreeSet::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            result.extend(self.out_edges.get(id).into_iter().flatten().map(|k| &k.to));
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            result.extend(self.in_edges.get(id).into_iter().flatten().map(|k| &k.from));
        }
        result.into_iter().cloned().collect()
    }

    /// Returns outgoing top-level edges.
    pub fn edges_from(&self, id: &NodeId) -> impl Iterator<Item = &Edge> {
        self.out_edges
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|k| self.state.edges.get(k))
    }

    /// Returns the undirected neighborhood: edge endpoints plus capability
    /// membership links in both directions.
    #[must_use]
    pub fn related(&self, id: &NodeId) -> Option<&HashSet<NodeId>> {
        self.related.get(id)
    }

    /// Returns the size of the undirected neighborhood.
    #[must_use]
    pub fn degree(&self, id: &NodeId) -> usize {
        self.related.get(id).map_or(0, HashSet::len)
    }

    /// Returns the capabilities listing `id` as a member.
    #[must_use]
    pub fn capabilities_containing(&self, id: &NodeId) -> &[NodeId] {
        self.containing.get(id).map_or(&[], Vec::as_slice)
    }

    /// Returns the directed edge density `|E| / (|V|·(|V|−1))` in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn density(&self) -> f64 {
        let n = self.state.nodes.len();
        if n < 2 {
            return 0.0;
        }
        let possible = (n * (n - 1)) as f64;
        (self.state.edges.len() as f64 / possible).clamp(0.0, 1.0)
    }

    /// Returns the community of a node.
    ///
    /// Tools are clustered over the tool-only subgraph; a capability takes the
    /// dominant community among its tool members.
    #[must_use]
    pub fn community_of(&self, id: &NodeId) -> Option<usize> {
        self.analytics().community(id)
    }

    /// Returns the PageRank of a node, normalized so the maximum is 1.
    #[must_use]
    pub fn pagerank(&self, id: &NodeId) -> Option<f32> {
        self.analytics().pagerank(id)
    }

    /// Returns node centrality in `[0, 1]`.
    ///
    /// Tools use PageRank; capabilities use hypergraph centrality.
    #[must_use]
    pub fn centrality(&self, id: &NodeId) -> Option<f32> {
        match &self.node(id)?.kind {
            NodeKind::Tool => self.analytics().pagerank(id),
            NodeKind::Capability(_) => self.analytics().hyper_centrality(id),
        }
    }

    /// Returns the vector index for this version.
    #[must_use]
    pub fn vector_index(&self) -> &FlatVectorIndex {
        &self.vectors
    }

    /// Returns planner arcs leaving a node.
    #[must_use]
    pub fn arcs_out(&self, id: &NodeId) -> &[PlannerArc] {
        self.arcs.out.get(id).map_or(&[], Vec::as_slice)
    }

    /// Returns planner arcs entering a node.
    #[must_use]
    pub fn arcs_in(&self, id: &NodeId) -> &[PlannerArc] {
        self.arcs.inc.get(id).map_or(&[], Vec::as_slice)
    }

    /// Returns the cost of a planner arc.
    #[must_use]
    pub fn arc_cost(&self, key: &ArcKey) -> Option<f64> {
        self.arcs.costs.get(key).copied()
    }

    /// Returns the number of planner arcs.
    #[must_use]
    pub fn arc_count(&self) -> usize {
        self.arcs.costs.len()
    }

    /// Returns the position of a node in a topological order of planner
    /// arcs: every arc goes from a lower to a higher rank.
    #[must_use]
    pub fn topo_rank(&self, id: &NodeId) -> Option<usize> {
        self.arcs.rank.get(id).copied()
    }

    /// Returns the planner arcs that differ from `previous`, ordered by key.
    #[must_use]
    pub fn arc_delta(&self, previous: &Self) -> Vec<ArcChange> {
        let mut keys: BTreeSet<&ArcKey> = previous.arcs.costs.keys().collect();
        keys.extend(self.arcs.costs.keys());

        keys.into_iter()
            .filter_map(|key| {
                let old_cost = previous.arcs.costs.get(key).copied();
                let new_cost = self.arcs.costs.get(key).copied();
                (old_cost != new_cost).then(|| ArcChange {
                    from: key.from.clone(),
                    to: key.to.clone(),
                    via: key.via.clone(),
                    old_cost,
                    new_cost,
                })
            })
            .collect()
    }

    /// Returns every node that can reach `id` through planner arcs,
    /// including `id` itself.
    #[must_use]
    pub fn planner_ancestors(&self, id: &NodeId) -> HashSet<NodeId> {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut queue: VecDeque<&NodeId> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            for arc in self.arcs_in(current) {
                queue.push_back(&arc.from);
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CapabilitySpec, StructureEdge, StructureEdgeKind};
    use crate::storage::graph::batch::GraphOp;

    fn snapshot(ops: Vec<GraphOp>) -> GraphSnapshot {
        let config = GraphConfig::default();
        let mut state = GraphState::default();
        for op in ops {
            state.apply(op, &config).unwrap();
        }
        let vectors = Arc::new(FlatVectorIndex::from_nodes(state.nodes.values()));
        GraphSnapshot::build(state, 1, vectors, config)
    }

    fn tools(ids: &[&str]) -> Vec<GraphOp> {
        ids.iter()
            .map(|id| GraphOp::UpsertNode(Node::tool(*id)))
            .collect()
    }

    fn edge(from: &str, to: &str, kind: EdgeKind) -> GraphOp {
        GraphOp::UpsertEdge(Edge::new(from, to, kind, EdgeSource::Template))
    }

    #[test]
    fn test_only_provides_edges_become_arcs() {
        let mut ops = tools(&["a", "b", "c", "d"]);
        ops.push(edge("a", "b", EdgeKind::Provides));
        ops.push(edge("b", "c", EdgeKind::Sequence));
        ops.push(edge("c", "d", EdgeKind::Contains));
        ops.push(edge("a", "d", EdgeKind::Dependency));
        let snap = snapshot(ops);

        assert_eq!(snap.arc_count(), 1);
        assert_eq!(snap.arcs_out(&NodeId::new("a")).len(), 1);
        assert!(snap.arcs_out(&NodeId::new("b")).is_empty());
    }

    #[test]
    fn test_capability_contributes_internal_and_exit_arcs() {
        let mut ops = tools(&["fetch", "parse"]);
        let spec = CapabilitySpec::new(vec![NodeId::new("fetch"), NodeId::new("parse")])
            .with_edge(StructureEdge::new("fetch", "parse", StructureEdgeKind::Provides));
        ops.push(GraphOp::UpsertNode(Node::capability("ingest", spec)));
        let snap = snapshot(ops);

        let internal = snap.arcs_out(&NodeId::new("fetch"));
        assert_eq!(internal.len(), 1);
        assert_eq!(internal[0].via, Some(NodeId::new("ingest")));

        let exit = snap.arcs_out(&NodeId::new("parse"));
        assert_eq!(exit.len(), 1);
        assert_eq!(exit[0].to, NodeId::new("ingest"));
        assert!(exit[0].cost.abs() < f64::EPSILON);
    }

    #[test]
    fn test_topo_rank_orders_arcs() {
        let mut ops = tools(&["c", "b", "a"]);
        ops.push(edge("a", "b", EdgeKind::Provides));
        ops.push(edge("b", "c", EdgeKind::Provides));
        let snap = snapshot(ops);

        let rank = |id: &str| snap.topo_rank(&NodeId::new(id)).unwrap();
        assert!(rank("a") < rank("b"));
        assert!(rank("b") < rank("c"));
    }

    #[test]
    fn test_density_bounds() {
        assert!(snapshot(Vec::new()).density().abs() < f64::EPSILON);
        let mut ops = tools(&["a", "b"]);
        ops.push(edge("a", "b", EdgeKind::Sequence));
        ops.push(edge("b", "a", EdgeKind::Sequence));
        assert!((snapshot(ops).density() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_neighbors_by_direction() {
        let mut ops = tools(&["a", "b", "c"]);
        ops.push(edge("a", "b", EdgeKind::Provides));
        ops.push(edge("c", "a", EdgeKind::Sequence));
        let snap = snapshot(ops);
        let a = NodeId::new("a");

        assert_eq!(snap.neighbors(&a, Direction::Outgoing), vec![NodeId::new("b")]);
        assert_eq!(snap.neighbors(&a, Direction::Incoming), vec![NodeId::new("c")]);
        assert_eq!(snap.neighbors(&a, Direction::Both).len(), 2);
    }

    #[test]
    fn test_related_includes_membership() {
        let mut ops = tools(&["x", "y"]);
        ops.push(GraphOp::UpsertNode(Node::capability(
            "cap",
            CapabilitySpec::new(vec![NodeId::new("x"), NodeId::new("y")]),
        )));
        let snap = snapshot(ops);
        assert!(snap.related(&NodeId::new("x")).unwrap().contains(&NodeId::new("cap")));
        assert_eq!(snap.degree(&NodeId::new("cap")), 2);
        assert_eq!(
            snap.capabilities_containing(&NodeId::new("y")),
            &[NodeId::new("cap")]
        );
    }

    #[test]
    fn test_arc_delta_reports_cost_changes() {
        let mut ops = tools(&["a", "b"]);
        ops.push(edge("a", "b", EdgeKind::Provides));
        let before = snapshot(ops.clone());
        ops.push(GraphOp::ObserveEdge {
            from: NodeId::new("a"),
            to: NodeId::new("b"),
            kind: EdgeKind::Provides,
        });
        let after = snapshot(ops);

        let delta = after.arc_delta(&before);
        assert_eq!(delta.len(), 1);
        assert!(delta[0].is_decrease());
    }
}
