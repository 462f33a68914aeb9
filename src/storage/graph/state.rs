//! Mutable working state behind a graph snapshot.
//!
//! A batch is applied to a private clone of the current state. Every
//! operation is validated before it touches the clone, so a rejected
//! operation leaves the state exactly as it was.
//!
//! Acyclicity is enforced over the causal arcs the planner can see:
//!
//! - top-level `dependency` and `provides` edges
//! - `provides` relations inside a capability's structure
//! - implicit exit arcs from a capability's exit members to the capability

use super::GraphConfig;
use super::batch::GraphOp;
use crate::models::{Edge, EdgeKey, EdgeKind, EdgeSource, Node, NodeId, NodeKind};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Multiset adjacency of causal arcs.
#[derive(Debug, Clone, Default)]
pub(crate) struct CausalIndex {
    out: HashMap<NodeId, HashMap<NodeId, usize>>,
}

impl CausalIndex {
    fn add(&mut self, from: &NodeId, to: &NodeId) {
        *self
            .out
            .entry(from.clone())
            .or_default()
            .entry(to.clone())
            .or_insert(0) += 1;
    }

    fn remove(&mut self, from: &NodeId, to: &NodeId) {
        if let Some(targets) = self.out.get_mut(from) {
            if let Some(count) = targets.get_mut(to) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    targets.remove(to);
                }
            }
            if targets.is_empty() {
                self.out.remove(from);
            }
        }
    }

    /// Returns `true` if `target` is reachable from `start`.
    fn reaches(&self, start: &NodeId, target: &NodeId) -> bool {
        if start == target {
            return true;
        }
        let mut stack = vec![start];
        let mut visited: HashSet<&NodeId> = HashSet::new();
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            let Some(targets) = self.out.get(current) else {
                continue;
            };
            for next in targets.keys() {
                if next == target {
                    return true;
                }
                stack.push(next);
            }
        }
        false
    }

    /// Inserts arcs one at a time, rolling back if any would close a cycle.
    ///
    /// Returns the offending arc on rejection.
    fn try_insert(&mut self, arcs: &[(NodeId, NodeId)]) -> std::result::Result<(), (NodeId, NodeId)> {
        for (i, (from, to)) in arcs.iter().enumerate() {
            if self.reaches(to, from) {
                for (f, t) in &arcs[..i] {
                    self.remove(f, t);
                }
                return Err((from.clone(), to.clone()));
            }
            self.add(from, to);
        }
        Ok(())
    }

    fn remove_all(&mut self, arcs: &[(NodeId, NodeId)]) {
        for (from, to) in arcs {
            self.remove(from, to);
        }
    }

    fn add_all(&mut self, arcs: &[(NodeId, NodeId)]) {
        for (from, to) in arcs {
            self.add(from, to);
        }
    }

    /// Returns the causal successors of a node.
    pub(crate) fn successors(&self, id: &NodeId) -> impl Iterator<Item = &NodeId> {
        self.out.get(id).into_iter().flat_map(HashMap::keys)
    }
}

/// Causal arcs contributed by a node definition.
pub(crate) fn node_causal_arcs(node: &Node) -> Vec<(NodeId, NodeId)> {
    let NodeKind::Capability(spec) = &node.kind else {
        return Vec::new();
    };
    let mut arcs: Vec<(NodeId, NodeId)> = spec
        .provides_edges()
        .map(|e| (e.from.clone(), e.to.clone()))
        .collect();
    arcs.extend(
        spec.exit_members()
            .into_iter()
            .map(|m| (m.clone(), node.id.clone())),
    );
    arcs
}

/// Causal arc contributed by an edge, if its kind is causal.
fn edge_causal_arc(edge: &Edge) -> Option<(NodeId, NodeId)> {
    edge.kind
        .is_causal()
        .then(|| (edge.from.clone(), edge.to.clone()))
}

/// What an applied operation changed beyond nodes and edges.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct OpEffect {
    pub embeddings_changed: bool,
}

/// Nodes, edges, and the causal index of one graph version.
#[derive(Debug, Clone, Default)]
pub(crate) struct GraphState {
    pub nodes: HashMap<NodeId, Arc<Node>>,
    pub edges: HashMap<EdgeKey, Edge>,
    pub causal: CausalIndex,
}

impl GraphState {
    /// Applies one operation, leaving the state untouched on error.
    pub fn apply(&mut self, op: GraphOp, config: &GraphConfig) -> Result<OpEffect> {
        match op {
            GraphOp::UpsertNode(node) => self.upsert_node(node, config),
            GraphOp::SetEmbedding { id, embedding } => self.set_embedding(&id, embedding, config),
            GraphOp::UpsertEdge(edge) => self.upsert_edge(edge),
            GraphOp::ObserveEdge { from, to, kind } => {
                self.observe_edge(from, to, kind, config.reinforcement_rate)
            },
            GraphOp::RemoveEdge(key) => {
                self.remove_edge(&key)?;
                Ok(OpEffect::default())
            },
            GraphOp::RemoveNode(id) => self.remove_node(&id),
        }
    }

    fn check_dimensions(embedding: &[f32], config: &GraphConfig) -> Result<()> {
        if config.embedding_dimensions > 0 && embedding.len() != config.embedding_dimensions {
            return Err(Error::InvalidInput(format!(
                "embedding has {} dimensions, expected {}",
                embedding.len(),
                config.embedding_dimensions
            )));
        }
        Ok(())
    }

    fn validate_capability(&self, node: &Node) -> Result<()> {
        let NodeKind::Capability(spec) = &node.kind else {
            return Ok(());
        };
        if spec.members.is_empty() {
            return Err(Error::InvalidInput(format!(
                "capability {} has no members",
                node.id
            )));
        }
        for member in &spec.members {
            if member == &node.id {
                return Err(Error::InvalidInput(format!(
                    "capability {} lists itself as a member",
                    node.id
                )));
            }
            if !self.nodes.contains_key(member) {
                return Err(Error::InvalidInput(format!(
                    "capability {} references unknown member {member}",
                    node.id
                )));
            }
        }
        for edge in &spec.structure {
            if !spec.contains(&edge.from) || !spec.contains(&edge.to) {
                return Err(Error::InvalidInput(format!(
                    "capability {} structure edge {} -> {} leaves the member set",
                    node.id, edge.from, edge.to
                )));
            }
        }
        Ok(())
    }

    fn upsert_node(&mut self, mut node: Node, config: &GraphConfig) -> Result<OpEffect> {
        self.validate_capability(&node)?;
        if let Some(embedding) = &node.embedding {
            Self::check_dimensions(embedding, config)?;
        }

        let previous = self.nodes.get(&node.id).cloned();
        let old_arcs = previous.as_deref().map(node_causal_arcs).unwrap_or_default();
        let new_arcs = node_causal_arcs(&node);

        self.causal.remove_all(&old_arcs);
        if let Err((from, to)) = self.causal.try_insert(&new_arcs) {
            self.causal.add_all(&old_arcs);
            return Err(Error::CycleRejected {
                from: from.to_string(),
                to: to.to_string(),
                kind: "capability".to_string(),
            });
        }

        let embeddings_changed = node.embedding.is_some();
        if node.embedding.is_none()
            && let Some(prev) = &previous
        {
            node.embedding.clone_from(&prev.embedding);
        }
        self.nodes.insert(node.id.clone(), Arc::new(node));
        Ok(OpEffect { embeddings_changed })
    }

    fn set_embedding(
        &mut self,
        id: &NodeId,
        embedding: Vec<f32>,
        config: &GraphConfig,
    ) -> Result<OpEffect> {
        Self::check_dimensions(&embedding, config)?;
        let Some(existing) = self.nodes.get(id) else {
            return Err(Error::InvalidInput(format!("unknown node {id}")));
        };
        let mut updated = Node::clone(existing);
        updated.embedding = Some(embedding);
        updated.updated_at = chrono::Utc::now();
        self.nodes.insert(id.clone(), Arc::new(updated));
        Ok(OpEffect {
            embeddings_changed: true,
        })
    }

    fn require_endpoints(&self, from: &NodeId, to: &NodeId) -> Result<()> {
        for id in [from, to] {
            if !self.nodes.contains_key(id) {
                return Err(Error::InvalidInput(format!("unknown node {id}")));
            }
        }
        Ok(())
    }

    fn insert_new_edge(&mut self, edge: Edge) -> Result<()> {
        if let Some(arc) = edge_causal_arc(&edge) {
            let arcs = [arc];
            if self.causal.try_insert(&arcs).is_err() {
                return Err(Error::CycleRejected {
                    from: edge.from.to_string(),
                    to: edge.to.to_string(),
                    kind: edge.kind.to_string(),
                });
            }
        }
        self.edges.insert(edge.key(), edge);
        Ok(())
    }

    fn upsert_edge(&mut self, edge: Edge) -> Result<OpEffect> {
        self.require_endpoints(&edge.from, &edge.to)?;
        let key = edge.key();
        if let Some(existing) = self.edges.get_mut(&key) {
            // Same (from, to, kind): the causal arc is unchanged.
            *existing = edge;
        } else {
            self.insert_new_edge(edge)?;
        }
        Ok(OpEffect::default())
    }

    fn observe_edge(
        &mut self,
        from: NodeId,
        to: NodeId,
        kind: EdgeKind,
        reinforcement: f64,
    ) -> Result<OpEffect> {
        self.require_endpoints(&from, &to)?;
        let key = EdgeKey::new(from.clone(), to.clone(), kind);
        if let Some(existing) = self.edges.get_mut(&key) {
            existing.observe(reinforcement);
        } else {
            self.insert_new_edge(Edge::new(from, to, kind, EdgeSource::Observed))?;
        }
        Ok(OpEffect::default())
    }

    fn remove_edge(&mut self, key: &EdgeKey) -> Result<()> {
        let Some(edge) = self.edges.remove(key) else {
            return Err(Error::InvalidInput(format!(
                "unknown edge {} -> {} ({})",
                key.from, key.to, key.kind
            )));
        };
        if let Some((from, to)) = edge_causal_arc(&edge) {
            self.causal.remove(&from, &to);
        }
        Ok(())
    }

    fn remove_node(&mut self, id: &NodeId) -> Result<OpEffect> {
        let Some(node) = self.nodes.get(id).cloned() else {
            return Err(Error::InvalidInput(format!("unknown node {id}")));
        };
        if let Some(owner) = self
            .nodes
            .values()
            .find(|n| n.kind.capability().is_some_and(|spec| spec.contains(id)))
        {
            return Err(Error::InvalidInput(format!(
                "node {id} is a member of capability {}; remove the capability first",
                owner.id
            )));
        }

        let incident: Vec<EdgeKey> = self
            .edges
            .keys()
            .filter(|k| &k.from == id || &k.to == id)
            .cloned()
            .collect();
        for key in &incident {
            self.remove_edge(key)?;
        }
        self.causal.remove_all(&node_causal_arcs(&node));
        self.nodes.remove(id);

        Ok(OpEffect {
            embeddings_changed: node.embedding.is_some(),
        })
    }
}
