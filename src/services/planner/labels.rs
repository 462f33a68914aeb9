//! Distance-to-goal label tables.
//!
//! A [`LabelTable`] holds, for one goal, the minimum planner-arc cost from
//! every node that can reach the goal, plus the arc each node leaves by.
//! Following successor arcs from any labeled node traces a minimum-cost plan.
//!
//! Planner arcs form a DAG, so a label depends only on the labels of
//! higher-ranked nodes. Every recomputation here processes nodes in
//! decreasing topological rank and touches each node at most once.

use crate::models::NodeId;
use crate::storage::{ArcKey, GraphSnapshot};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A node's label: cost to the goal and the arc taken first.
#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    /// Minimum cost to the goal.
    pub distance: f64,
    /// First arc on a minimum-cost route; `None` for the goal itself.
    pub successor: Option<ArcKey>,
}

/// Per-goal distance labels.
#[derive(Debug)]
pub struct LabelTable {
    goal: NodeId,
    labels: HashMap<NodeId, Label>,
    last_used: AtomicU64,
}

impl Clone for LabelTable {
    fn clone(&self) -> Self {
        Self {
            goal: self.goal.clone(),
            labels: self.labels.clone(),
            last_used: AtomicU64::new(self.last_used.load(Ordering::Relaxed)),
        }
    }
}

/// How a from-scratch computation ended.
#[derive(Debug)]
pub(crate) enum Computation {
    /// Every ancestor of the goal is labeled.
    Complete(LabelTable),
    /// The deadline expired; labeled nodes are final, the rest unknown.
    Expired(LabelTable),
}

impl LabelTable {
    fn seeded(goal: NodeId) -> Self {
        let mut labels = HashMap::new();
        labels.insert(
            goal.clone(),
            Label {
                distance: 0.0,
                successor: None,
            },
        );
        Self {
            goal,
            labels,
            last_used: AtomicU64::new(0),
        }
    }

    /// Computes the table for `goal` from scratch.
    #[must_use]
    pub fn compute(snapshot: &GraphSnapshot, goal: &NodeId) -> Self {
        match Self::compute_until(snapshot, goal, None) {
            Computation::Complete(table) | Computation::Expired(table) => table,
        }
    }

    pub(crate) fn compute_until(
        snapshot: &GraphSnapshot,
        goal: &NodeId,
        deadline: Option<Instant>,
    ) -> Computation {
        let mut table = Self::seeded(goal.clone());
        let mut order: Vec<(usize, NodeId)> = snapshot
            .planner_ancestors(goal)
            .into_iter()
            .filter(|id| id != goal)
            .map(|id| (snapshot.topo_rank(&id).unwrap_or(0), id))
            .collect();
        order.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        for (_, id) in order {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Computation::Expired(table);
            }
            if let Some(label) = table.best_label(snapshot, &id) {
                table.labels.insert(id, label);
            }
        }
        Computation::Complete(table)
    }

    /// Returns the goal.
    #[must_use]
    pub const fn goal(&self) -> &NodeId {
        &self.goal
    }

    /// Returns a node's label.
    #[must_use]
    pub fn label(&self, id: &NodeId) -> Option<&Label> {
        self.labels.get(id)
    }

    /// Returns a node's distance to the goal.
    #[must_use]
    pub fn distance(&self, id: &NodeId) -> Option<f64> {
        self.labels.get(id).map(|l| l.distance)
    }

    /// Returns the number of labeled nodes, the goal included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Returns `true` if only the goal is labeled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.len() <= 1
    }

    /// Iterates over all labels.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Label)> {
        self.labels.iter()
    }

    /// Returns the number of labeled nodes that leave by a tree arc.
    #[must_use]
    pub fn tree_arc_count(&self) -> usize {
        self.labels
            .values()
            .filter(|l| l.successor.is_some())
            .count()
    }

    /// Returns `true` if `key` is some node's successor arc.
    #[must_use]
    pub fn is_tree_arc(&self, key: &ArcKey) -> bool {
        self.labels
            .get(&key.from)
            .and_then(|l| l.successor.as_ref())
            .is_some_and(|s| s == key)
    }

    pub(crate) fn touch(&self, stamp: u64) {
        self.last_used.store(stamp, Ordering::Relaxed);
    }

    pub(crate) fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }

    /// Best label for `id` from the labels of its arc targets.
    ///
    /// Ties are broken by arc key, so the result is a pure function of the
    /// snapshot and the successor labels.
    pub(crate) fn best_label(&self, snapshot: &GraphSnapshot, id: &NodeId) -> Option<Label> {
        if *id == self.goal {
            return Some(Label {
                distance: 0.0,
                successor: None,
            });
        }
        let mut best: Option<(f64, &crate::storage::PlannerArc)> = None;
        for arc in snapshot.arcs_out(id) {
            let Some(next) = self.labels.get(&arc.to) else {
                continue;
            };
            let total = arc.cost + next.distance;
            if best.is_none_or(|(d, _)| total < d) {
                best = Some((total, arc));
            }
        }
        best.map(|(distance, arc)| Label {
            distance,
            successor: Some(arc.key()),
        })
    }

    /// Replaces or removes a label. Returns `true` if it changed.
    pub(crate) fn set(&mut self, id: &NodeId, label: Option<Label>) -> bool {
        match label {
            Some(label) => self.labels.insert(id.clone(), label.clone()).as_ref() != Some(&label),
            None => self.labels.remove(id).is_some(),
        }
    }

    /// Nodes whose successor chain passes through `root`, `root` included,
    /// ordered by decreasing rank.
    pub(crate) fn subtree(&self, snapshot: &GraphSnapshot, root: &NodeId) -> Vec<NodeId> {
        let mut children: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
        for (id, label) in &self.labels {
            if let Some(successor) = &label.successor {
                children.entry(&successor.to).or_default().push(id);
            }
        }
        let mut members: HashSet<NodeId> = HashSet::new();
        let mut frontier = vec![root];
        while let Some(node) = frontier.pop() {
            if !members.insert(node.clone()) {
                continue;
            }
            frontier.extend(children.get(node).into_iter().flatten().copied());
        }
        let mut ordered: Vec<NodeId> = members.into_iter().collect();
        sort_by_rank_desc(snapshot, &mut ordered);
        ordered
    }

    /// Drops labels of nodes no longer in the graph.
    pub(crate) fn retain_present(&mut self, snapshot: &GraphSnapshot) {
        self.labels.retain(|id, _| snapshot.contains(id));
    }
}

pub(crate) fn sort_by_rank_desc(snapshot: &GraphSnapshot, ids: &mut [NodeId]) {
    ids.sort_by(|a, b| {
        snapshot
            .topo_rank(b)
            .cmp(&snapshot.topo_rank(a))
            .then_with(|| a.cmp(b))
    });
}

/// Work queue that pops the highest-ranked node first.
///
/// A node is recomputed only after every node it depends on, and at most
/// once per pass.
pub(crate) struct RankQueue<'a> {
    snapshot: &'a GraphSnapshot,
    heap: BinaryHeap<(usize, std::cmp::Reverse<NodeId>)>,
    queued: HashSet<NodeId>,
    done: HashSet<NodeId>,
}

impl<'a> RankQueue<'a> {
    pub(crate) fn new(snapshot: &'a GraphSnapshot) -> Self {
        Self {
            snapshot,
            heap: BinaryHeap::new(),
            queued: HashSet::new(),
            done: HashSet::new(),
        }
    }

    pub(crate) fn push(&mut self, id: &NodeId) {
        if self.done.contains(id) || !self.queued.insert(id.clone()) {
            return;
        }
        let Some(rank) = self.snapshot.topo_rank(id) else {
            return;
        };
        self.heap.push((rank, std::cmp::Reverse(id.clone())));
    }

    /// Marks a node as final without recomputing it.
    pub(crate) fn settle(&mut self, id: &NodeId) {
        self.done.insert(id.clone());
    }

    pub(crate) fn pop(&mut self) -> Option<NodeId> {
        let (_, std::cmp::Reverse(id)) = self.heap.pop()?;
        self.queued.remove(&id);
        self.done.insert(id.clone());
        Some(id)
    }
}

/// Recomputes queued nodes and propagates changes to predecessors.
///
/// Returns the number of labels recomputed.
pub(crate) fn relax(table: &mut LabelTable, queue: &mut RankQueue<'_>) -> usize {
    let snapshot = queue.snapshot;
    let mut recomputed = 0;
    while let Some(id) = queue.pop() {
        recomputed += 1;
        let label = table.best_label(snapshot, &id);
        if table.set(&id, label) {
            for arc in snapshot.arcs_in(&id) {
                queue.push(&arc.from);
            }
        }
    }
    recomputed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Edge, EdgeKind, EdgeSource, Node};
    use crate::storage::{BatchPolicy, GraphBatch, GraphConfig, GraphStore};

    fn chain() -> GraphStore {
        let store = GraphStore::new(GraphConfig::default());
        let batch = GraphBatch::new()
            .upsert_node(Node::tool("a"))
            .upsert_node(Node::tool("b"))
            .upsert_node(Node::tool("c"))
            .upsert_node(Node::tool("d"))
            .upsert_edge(Edge::new("a", "b", EdgeKind::Provides, EdgeSource::Observed))
            .upsert_edge(Edge::new("b", "c", EdgeKind::Provides, EdgeSource::Observed))
            .upsert_edge(Edge::new("a", "c", EdgeKind::Provides, EdgeSource::Template));
        store.apply_batch(batch, BatchPolicy::AllOrNothing).unwrap();
        store
    }

    #[test]
    fn test_compute_labels_ancestors_only() {
        let store = chain();
        let snapshot = store.snapshot();
        let table = LabelTable::compute(&snapshot, &NodeId::new("c"));

        assert_eq!(table.distance(&NodeId::new("c")), Some(0.0));
        assert!(table.distance(&NodeId::new("d")).is_none());
        let b = table.distance(&NodeId::new("b")).unwrap();
        let a = table.distance(&NodeId::new("a")).unwrap();
        assert!(a > b);
    }

    #[test]
    fn test_observed_route_beats_template_shortcut() {
        let store = chain();
        let snapshot = store.snapshot();
        let table = LabelTable::compute(&snapshot, &NodeId::new("c"));

        // Two observed hops cost 2/0.7 per unit confidence factor, the template shortcut 1/0.28.
        let succ = table.label(&NodeId::new("a")).unwrap().successor.clone().unwrap();
        assert_eq!(succ.to.as_str(), "b");
    }

    #[test]
    fn test_subtree_follows_successors() {
        let store = chain();
        let snapshot = store.snapshot();
        let table = LabelTable::compute(&snapshot, &NodeId::new("c"));
        let subtree = table.subtree(&snapshot, &NodeId::new("b"));
        let ids: Vec<&str> = subtree.iter().map(NodeId::as_str).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    #[allow(clippy::panic)]
    fn test_expired_computation_keeps_goal() {
        let store = chain();
        let snapshot = store.snapshot();
        let past = Instant::now();
        match LabelTable::compute_until(&snapshot, &NodeId::new("c"), Some(past)) {
            Computation::Expired(table) => {
                assert_eq!(table.len(), 1);
                assert_eq!(table.distance(&NodeId::new("c")), Some(0.0));
            },
            Computation::Complete(_) => panic!("deadline in the past must expire"),
        }
    }
}
