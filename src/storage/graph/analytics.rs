// Allow cast precision loss for converting counts to scores.
#![allow(clippy::cast_precision_loss)]

//! Structural analytics computed once per snapshot.
//!
//! | Signal | Applies to | Method |
//! |--------|------------|--------|
//! | PageRank | Every node | Weighted power iteration over top-level edges, max-normalized |
//! | Community | Tools | Label propagation over the undirected tool-only subgraph |
//! | Community | Capabilities | Dominant community among tool members |
//! | Hypergraph centrality | Capabilities | Member-overlap degree blended with mean member PageRank |
//!
//! Everything iterates nodes in sorted id order so results are deterministic.

use super::GraphConfig;
use super::state::GraphState;
use crate::models::{NodeId, NodeKind};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Per-snapshot structural signals.
#[derive(Debug, Clone, Default)]
pub(crate) struct GraphAnalytics {
    pagerank: HashMap<NodeId, f32>,
    communities: HashMap<NodeId, usize>,
    hyper_centrality: HashMap<NodeId, f32>,
}

impl GraphAnalytics {
    pub fn compute(state: &GraphState, config: &GraphConfig) -> Self {
        let mut ids: Vec<&NodeId> = state.nodes.keys().collect();
        ids.sort();

        let pagerank = pagerank(state, &ids, config);
        let communities = communities(state, &ids, config.label_propagation_iterations);
        let hyper_centrality = hyper_centrality(state, &ids, &pagerank);

        metrics::counter!("graph_analytics_computations_total").increment(1);
        Self {
            pagerank,
            communities,
            hyper_centrality,
        }
    }

    pub fn pagerank(&self, id: &NodeId) -> Option<f32> {
        self.pagerank.get(id).copied()
    }

    pub fn community(&self, id: &NodeId) -> Option<usize> {
        self.communities.get(id).copied()
    }

    pub fn hyper_centrality(&self, id: &NodeId) -> Option<f32> {
        self.hyper_centrality.get(id).copied()
    }
}

fn pagerank(state: &GraphState, ids: &[&NodeId], config: &GraphConfig) -> HashMap<NodeId, f32> {
    let n = ids.len();
    if n == 0 {
        return HashMap::new();
    }
    let index: HashMap<&NodeId, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut out: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
    for edge in state.edges.values() {
        if let (Some(&f), Some(&t)) = (index.get(&edge.from), index.get(&edge.to))
            && f != t
        {
            out[f].push((t, edge.weight()));
        }
    }
    let out_weight: Vec<f64> = out
        .iter()
        .map(|targets| targets.iter().map(|(_, w)| w).sum())
        .collect();

    let damping = config.pagerank_damping.clamp(0.0, 1.0);
    let base = (1.0 - damping) / n as f64;
    let mut rank = vec![1.0 / n as f64; n];

    for _ in 0..config.pagerank_iterations {
        let dangling: f64 = (0..n)
            .filter(|&i| out_weight[i] <= 0.0)
            .map(|i| rank[i])
            .sum();
        let mut next = vec![base + damping * dangling / n as f64; n];
        for (i, targets) in out.iter().enumerate() {
            if out_weight[i] <= 0.0 {
                continue;
            }
            let share = damping * rank[i] / out_weight[i];
            for &(t, w) in targets {
                next[t] += share * w;
            }
        }
        rank = next;
    }

    let max = rank.iter().copied().fold(0.0f64, f64::max);
    ids.iter()
        .zip(rank)
        .map(|(id, r)| {
            #[allow(clippy::cast_possible_truncation)]
            let normalized = if max > 0.0 { (r / max) as f32 } else { 0.0 };
            ((*id).clone(), normalized)
        })
        .collect()
}

fn communities(state: &GraphState, ids: &[&NodeId], max_iterations: usize) -> HashMap<NodeId, usize> {
    let tools: Vec<&NodeId> = ids
        .iter()
        .copied()
        .filter(|id| matches!(state.nodes[*id].kind, NodeKind::Tool))
        .collect();
    let index: HashMap<&NodeId, usize> =
        tools.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut neighbors: Vec<HashSet<usize>> = vec![HashSet::new(); tools.len()];
    for edge in state.edges.values() {
        if let (Some(&f), Some(&t)) = (index.get(&edge.from), index.get(&edge.to))
            && f != t
        {
            neighbors[f].insert(t);
            neighbors[t].insert(f);
        }
    }

    let mut labels: Vec<usize> = (0..tools.len()).collect();
    for _ in 0..max_iterations {
        let mut changed = false;
        for i in 0..tools.len() {
            if neighbors[i].is_empty() {
                continue;
            }
            let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
            for &j in &neighbors[i] {
                *counts.entry(labels[j]).or_insert(0) += 1;
            }
            // BTreeMap iterates labels ascending; keep the first maximum.
            let mut best = labels[i];
            let mut best_count = 0;
            for (label, count) in counts {
                if count > best_count {
                    best = label;
                    best_count = count;
                }
            }
            if best != labels[i] {
                labels[i] = best;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Dense community ids in order of first appearance.
    let mut dense: HashMap<usize, usize> = HashMap::new();
    let mut result: HashMap<NodeId, usize> = HashMap::new();
    for (i, id) in tools.iter().enumerate() {
        let next_id = dense.len();
        let community = *dense.entry(labels[i]).or_insert(next_id);
        result.insert((*id).clone(), community);
    }

    for id in ids {
        if let NodeKind::Capability(spec) = &state.nodes[*id].kind {
            let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
            for member in &spec.members {
                if let Some(&c) = result.get(member) {
                    *counts.entry(c).or_insert(0) += 1;
                }
            }
            let mut best: Option<(usize, usize)> = None;
            for (community, count) in counts {
                if best.is_none_or(|(_, c)| count > c) {
                    best = Some((community, count));
                }
            }
            if let Some((community, _)) = best {
                result.insert((*id).clone(), community);
            }
        }
    }
    result
}

fn hyper_centrality(
    state: &GraphState,
    ids: &[&NodeId],
    pagerank: &HashMap<NodeId, f32>,
) -> HashMap<NodeId, f32> {
    let capabilities: Vec<(&NodeId, HashSet<&NodeId>)> = ids
        .iter()
        .filter_map(|id| {
            state.nodes[*id]
                .kind
                .capability()
                .map(|spec| (*id, spec.members.iter().collect()))
        })
        .collect();

    let others = capabilities.len().saturating_sub(1);
    capabilities
        .iter()
        .map(|(id, members)| {
            let overlapping = capabilities
                .iter()
                .filter(|(other, other_members)| {
                    other != id && !members.is_disjoint(other_members)
                })
                .count();
            let overlap = if others == 0 {
                0.0
            } else {
                overlapping as f32 / others as f32
            };
            let member_mean = if members.is_empty() {
                0.0
            } else {
                members
                    .iter()
                    .map(|m| pagerank.get(*m).copied().unwrap_or(0.0))
                    .sum::<f32>()
                    / members.len() as f32
            };
            ((*id).clone(), 0.5 * overlap + 0.5 * member_mean)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CapabilitySpec, Edge, EdgeKind, EdgeSource, Node};
    use crate::storage::graph::batch::GraphOp;

    fn build(ops: Vec<GraphOp>) -> GraphState {
        let config = GraphConfig::default();
        let mut state = GraphState::default();
        for op in ops {
            state.apply(op, &config).unwrap();
        }
        state
    }

    fn seq(from: &str, to: &str) -> GraphOp {
        GraphOp::UpsertEdge(Edge::new(from, to, EdgeKind::Sequence, EdgeSource::Observed))
    }

    #[test]
    fn test_pagerank_favors_sink_of_star() {
        let mut ops: Vec<GraphOp> = ["hub", "a", "b", "c"]
            .iter()
            .map(|id| GraphOp::UpsertNode(Node::tool(*id)))
            .collect();
        ops.extend([seq("a", "hub"), seq("b", "hub"), seq("c", "hub")]);
        let state = build(ops);
        let analytics = GraphAnalytics::compute(&state, &GraphConfig::default());

        let hub = analytics.pagerank(&NodeId::new("hub")).unwrap();
        let leaf = analytics.pagerank(&NodeId::new("a")).unwrap();
        assert!((hub - 1.0).abs() < 1e-6);
        assert!(leaf < hub);
    }

    #[test]
    fn test_label_propagation_separates_components() {
        let mut ops: Vec<GraphOp> = ["a1", "a2", "a3", "b1", "b2", "b3"]
            .iter()
            .map(|id| GraphOp::UpsertNode(Node::tool(*id)))
            .collect();
        ops.extend([
            seq("a1", "a2"),
            seq("a2", "a3"),
            seq("a3", "a1"),
            seq("b1", "b2"),
            seq("b2", "b3"),
            seq("b3", "b1"),
        ]);
        let state = build(ops);
        let analytics = GraphAnalytics::compute(&state, &GraphConfig::default());

        let a = analytics.community(&NodeId::new("a1"));
        let b = analytics.community(&NodeId::new("b1"));
        assert_eq!(a, analytics.community(&NodeId::new("a3")));
        assert_eq!(b, analytics.community(&NodeId::new("b2")));
        assert_ne!(a, b);
    }

    #[test]
    fn test_capability_inherits_member_community_and_hyper_centrality() {
        let state = build(vec![
            GraphOp::UpsertNode(Node::tool("x")),
            GraphOp::UpsertNode(Node::tool("y")),
            GraphOp::UpsertNode(Node::tool("z")),
            seq("x", "y"),
            GraphOp::UpsertNode(Node::capability(
                "cap1",
                CapabilitySpec::new(vec![NodeId::new("x"), NodeId::new("y")]),
            )),
            GraphOp::UpsertNode(Node::capability(
                "cap2",
                CapabilitySpec::new(vec![NodeId::new("y"), NodeId::new("z")]),
            )),
        ]);
        let analytics = GraphAnalytics::compute(&state, &GraphConfig::default());

        assert_eq!(
            analytics.community(&NodeId::new("cap1")),
            analytics.community(&NodeId::new("x"))
        );
        let centrality = analytics.hyper_centrality(&NodeId::new("cap1")).unwrap();
        assert!(centrality >= 0.5, "overlap with cap2 contributes 0.5");
        assert!(analytics.hyper_centrality(&NodeId::new("x")).is_none());
    }
}
