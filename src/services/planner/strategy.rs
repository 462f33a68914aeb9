//! Incremental label update strategies.
//!
//! Both strategies repair a [`LabelTable`] after a commit and converge to the
//! table a from-scratch computation would produce on the new snapshot.
//!
//! | Strategy | Seeds | Best when |
//! |----------|-------|-----------|
//! | [`EdgeCentric`] | Source of every changed arc | Changes land off the current tree |
//! | [`PathCentric`] | Whole subtree below a changed tree arc | Changes hit arcs on shortest paths |

use super::labels::{Label, LabelTable, RankQueue, relax};
use crate::models::NodeId;
use crate::storage::{ArcChange, ArcKey, GraphSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Identifies an update strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Relax from the endpoints of each changed arc.
    EdgeCentric,
    /// Shift or re-seed whole subtrees hanging off changed tree arcs.
    PathCentric,
}

impl StrategyKind {
    /// Returns the metric label for this strategy.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EdgeCentric => "edge_centric",
            Self::PathCentric => "path_centric",
        }
    }

    /// Parses a strategy name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "edge_centric" | "edge" => Some(Self::EdgeCentric),
            "path_centric" | "path" => Some(Self::PathCentric),
            _ => None,
        }
    }
}

/// Repairs a label table after the planner arcs changed.
pub trait UpdateStrategy: Send + Sync {
    /// Returns which strategy this is.
    fn kind(&self) -> StrategyKind;

    /// Brings `table` up to date with `snapshot`.
    ///
    /// `changes` are the arc deltas between the snapshot the table was
    /// computed on and `snapshot`. Returns the number of labels recomputed.
    fn update(&self, table: &mut LabelTable, snapshot: &GraphSnapshot, changes: &[ArcChange])
    -> usize;
}

pub(crate) fn change_key(change: &ArcChange) -> ArcKey {
    ArcKey {
        from: change.from.clone(),
        to: change.to.clone(),
        via: change.via.clone(),
    }
}

/// Relaxes from the source of every changed arc.
#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeCentric;

impl UpdateStrategy for EdgeCentric {
    fn kind(&self) -> StrategyKind {
        StrategyKind::EdgeCentric
    }

    fn update(
        &self,
        table: &mut LabelTable,
        snapshot: &GraphSnapshot,
        changes: &[ArcChange],
    ) -> usize {
        table.retain_present(snapshot);
        let mut queue = RankQueue::new(snapshot);
        for change in changes {
            queue.push(&change.from);
        }
        relax(table, &mut queue)
    }
}

/// Works along the current shortest-path tree.
///
/// A single cheaper tree arc lowers every label below it by the same amount,
/// so the subtree is shifted in place without searching. Anything else
/// re-seeds the affected subtrees and relaxes. Off-tree increases and
/// removals cannot improve any label and are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathCentric;

impl PathCentric {
    fn shift_subtree(
        table: &mut LabelTable,
        snapshot: &GraphSnapshot,
        change: &ArcChange,
    ) -> usize {
        let subtree = table.subtree(snapshot, &change.from);
        let members: HashSet<&NodeId> = subtree.iter().collect();
        let mut queue = RankQueue::new(snapshot);
        let mut shifted = 0;

        for id in &subtree {
            let Some(successor) = table.label(id).and_then(|l| l.successor.clone()) else {
                continue;
            };
            let (Some(cost), Some(next)) =
                (snapshot.arc_cost(&successor), table.distance(&successor.to))
            else {
                continue;
            };
            table.set(
                id,
                Some(Label {
                    distance: cost + next,
                    successor: Some(successor),
                }),
            );
            queue.settle(id);
            shifted += 1;
        }

        for id in &subtree {
            for arc in snapshot.arcs_in(id) {
                if !members.contains(&arc.from) {
                    queue.push(&arc.from);
                }
            }
        }
        shifted + relax(table, &mut queue)
    }
}

impl UpdateStrategy for PathCentric {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PathCentric
    }

    fn update(
        &self,
        table: &mut LabelTable,
        snapshot: &GraphSnapshot,
        changes: &[ArcChange],
    ) -> usize {
        if let [change] = changes
            && change.old_cost.is_some()
            && change.is_decrease()
            && table.is_tree_arc(&change_key(change))
            && snapshot.contains(&change.from)
        {
            return Self::shift_subtree(table, snapshot, change);
        }

        let mut seeds: Vec<NodeId> = Vec::new();
        for change in changes {
            if table.is_tree_arc(&change_key(change)) {
                seeds.extend(table.subtree(snapshot, &change.from));
            } else if change.is_decrease() {
                seeds.push(change.from.clone());
            }
        }

        table.retain_present(snapshot);
        let mut queue = RankQueue::new(snapshot);
        for id in &seeds {
            queue.push(id);
        }
        relax(table, &mut queue)
    }
}

/// Returns the strategy implementation for a kind.
#[must_use]
pub fn strategy_for(kind: StrategyKind) -> &'static dyn UpdateStrategy {
    match kind {
        StrategyKind::EdgeCentric => &EdgeCentric,
        StrategyKind::PathCentric => &PathCentric,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Edge, EdgeKind, EdgeSource, Node};
    use crate::storage::{BatchPolicy, GraphBatch, GraphConfig, GraphStore};
    use test_case::test_case;

    fn diamond() -> GraphStore {
        let store = GraphStore::new(GraphConfig::default());
        let batch = GraphBatch::new()
            .upsert_node(Node::tool("a"))
            .upsert_node(Node::tool("b"))
            .upsert_node(Node::tool("c"))
            .upsert_node(Node::tool("d"))
            .upsert_node(Node::tool("goal"))
            .upsert_edge(Edge::new("a", "b", EdgeKind::Provides, EdgeSource::Observed))
            .upsert_edge(Edge::new("a", "c", EdgeKind::Provides, EdgeSource::Template))
            .upsert_edge(Edge::new("b", "goal", EdgeKind::Provides, EdgeSource::Observed))
            .upsert_edge(Edge::new("c", "goal", EdgeKind::Provides, EdgeSource::Template))
            .upsert_edge(Edge::new("d", "a", EdgeKind::Provides, EdgeSource::Observed));
        store.apply_batch(batch, BatchPolicy::AllOrNothing).unwrap();
        store
    }

    fn assert_tables_match(a: &LabelTable, b: &LabelTable) {
        assert_eq!(a.len(), b.len());
        for (id, label) in a.iter() {
            let other = b.distance(id).unwrap();
            assert!((label.distance - other).abs() < 1e-9, "{id} differs");
        }
    }

    fn apply_and_update(kind: StrategyKind, batch: GraphBatch) {
        let store = diamond();
        let goal = NodeId::new("goal");
        let before = store.snapshot();
        let mut table = LabelTable::compute(&before, &goal);

        store.apply_batch(batch, BatchPolicy::AllOrNothing).unwrap();
        let after = store.snapshot();
        let changes = after.arc_delta(&before);
        strategy_for(kind).update(&mut table, &after, &changes);

        assert_tables_match(&table, &LabelTable::compute(&after, &goal));
    }

    #[test_case(StrategyKind::EdgeCentric ; "edge centric")]
    #[test_case(StrategyKind::PathCentric ; "path centric")]
    fn test_tree_arc_gets_cheaper(kind: StrategyKind) {
        let batch = GraphBatch::new().observe_edge("b", "goal", EdgeKind::Provides);
        apply_and_update(kind, batch);
    }

    #[test_case(StrategyKind::EdgeCentric ; "edge centric")]
    #[test_case(StrategyKind::PathCentric ; "path centric")]
    fn test_tree_arc_removed(kind: StrategyKind) {
        let key = crate::models::EdgeKey::new("b", "goal", EdgeKind::Provides);
        apply_and_update(kind, GraphBatch::new().remove_edge(key));
    }

    #[test_case(StrategyKind::EdgeCentric ; "edge centric")]
    #[test_case(StrategyKind::PathCentric ; "path centric")]
    fn test_shortcut_added(kind: StrategyKind) {
        let batch = GraphBatch::new()
            .upsert_edge(Edge::new("d", "goal", EdgeKind::Provides, EdgeSource::Observed));
        apply_and_update(kind, batch);
    }

    #[test_case(StrategyKind::EdgeCentric ; "edge centric")]
    #[test_case(StrategyKind::PathCentric ; "path centric")]
    fn test_node_removed(kind: StrategyKind) {
        apply_and_update(kind, GraphBatch::new().remove_node("b"));
    }

    #[test]
    fn test_parse_strategy_kind() {
        assert_eq!(StrategyKind::parse("path-centric"), Some(StrategyKind::PathCentric));
        assert_eq!(StrategyKind::parse("edge"), Some(StrategyKind::EdgeCentric));
        assert_eq!(StrategyKind::parse("bogus"), None);
    }
}
