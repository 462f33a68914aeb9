//! Deadline tests for the hyperpath planner.
//!
//! Queries run against long chains with forward shortcuts under small
//! non-zero deadlines. Whatever comes back must arrive promptly and be a
//! route the snapshot can actually execute.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use capgraph::services::planner::{LabelTable, PlannerConfig};
use capgraph::storage::{ArcKey, BatchPolicy, GraphConfig};
use capgraph::{
    Edge, EdgeKind, EdgeSource, GraphBatch, GraphStore, HyperpathPlanner, Node, NodeId, PlanResult,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Time allowed on top of the deadline for setup and tracing the route.
const SLACK: Duration = Duration::from_millis(250);

fn id(i: usize) -> NodeId {
    NodeId::new(format!("n{i:05}"))
}

/// A chain `n00000 -> ... -> n{len-1}` plus forward shortcuts.
///
/// Arcs are inserted in ascending `from` order so each cycle check only sees
/// the arcs already behind it.
fn chain_with_shortcuts(len: usize, shortcuts: &[(usize, usize, bool)]) -> Arc<GraphStore> {
    let mut arcs: Vec<(usize, usize, EdgeSource)> =
        (1..len).map(|i| (i - 1, i, EdgeSource::Template)).collect();
    for &(from, hop, observed) in shortcuts {
        let from = from % len;
        let to = from + hop;
        if to < len {
            let source = if observed {
                EdgeSource::Observed
            } else {
                EdgeSource::Template
            };
            arcs.push((from, to, source));
        }
    }
    arcs.sort_by_key(|&(from, to, _)| (from, to));
    arcs.dedup_by_key(|&mut (from, to, _)| (from, to));

    let mut batch = GraphBatch::new();
    for i in 0..len {
        batch = batch.upsert_node(Node::tool(id(i)));
    }
    for (from, to, source) in arcs {
        batch = batch.upsert_edge(Edge::new(id(from), id(to), EdgeKind::Provides, source));
    }
    let store = Arc::new(GraphStore::new(GraphConfig::default()));
    store.apply_batch(batch, BatchPolicy::AllOrNothing).unwrap();
    store
}

/// Checks that a plan starts at `start`, walks existing arcs, and reports
/// the sum of their costs. Returns that cost.
fn check_route(
    store: &GraphStore,
    result: &PlanResult,
    start: &NodeId,
    goal: &NodeId,
) -> Result<Option<f64>, TestCaseError> {
    let Some(plan) = result.plan() else {
        return Ok(None);
    };
    if plan.is_empty() {
        prop_assert!(result.is_partial());
        return Ok(None);
    }
    prop_assert_eq!(&plan.steps[0].node_id, start);
    prop_assert_eq!(&plan.steps[plan.len() - 1].node_id, goal);

    let snapshot = store.snapshot();
    let mut total = 0.0;
    for pair in plan.steps.windows(2) {
        let key = ArcKey {
            from: pair[0].node_id.clone(),
            to: pair[1].node_id.clone(),
            via: pair[1].via.clone(),
        };
        let cost = snapshot.arc_cost(&key);
        prop_assert!(cost.is_some(), "missing arc {:?}", key);
        total += cost.unwrap_or_default();
    }
    prop_assert!((total - plan.total_cost).abs() < 1e-6);
    Ok(Some(plan.total_cost))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Property: a small deadline returns promptly with an executable route.
    #[test]
    fn prop_small_deadline_returns_executable_route(
        len in 500usize..3000,
        shortcuts in prop::collection::vec((0usize..3000, 2usize..40, any::<bool>()), 0..400),
        deadline_us in 1u64..2000,
    ) {
        let store = chain_with_shortcuts(len, &shortcuts);
        let planner = HyperpathPlanner::new(Arc::clone(&store), PlannerConfig::default());
        let start = id(0);
        let goal = id(len - 1);
        let deadline = Duration::from_micros(deadline_us);

        let began = Instant::now();
        let result = planner.suggest_path(&goal, &[start.clone()], deadline).unwrap();
        let elapsed = began.elapsed();
        prop_assert!(elapsed <= deadline + SLACK, "took {:?} for {:?}", elapsed, deadline);
        prop_assert!(result != PlanResult::NotFound);

        let best = LabelTable::compute(&store.snapshot(), &goal)
            .distance(&start)
            .unwrap();
        let cost = check_route(&store, &result, &start, &goal)?;
        if result.is_partial() {
            prop_assert!(cost.is_none_or(|c| c >= best - 1e-6));
            prop_assert!(planner.cached_labels(&goal).is_none());
        } else {
            prop_assert!(result.is_found());
            prop_assert!(cost.is_some_and(|c| (c - best).abs() < 1e-6));
        }

        let full = planner.suggest_path(&goal, &[start.clone()], Duration::from_secs(10)).unwrap();
        prop_assert!(full.is_found());
        let full_cost = check_route(&store, &full, &start, &goal)?;
        prop_assert!(full_cost.is_some_and(|c| (c - best).abs() < 1e-6));
    }
}

#[test]
fn test_long_chain_expires_then_completes() {
    let len = 10_000;
    let store = chain_with_shortcuts(len, &[]);
    let planner = HyperpathPlanner::new(Arc::clone(&store), PlannerConfig::default());
    let start = id(0);
    let goal = id(len - 1);

    let began = Instant::now();
    let partial = planner
        .suggest_path(&goal, &[start.clone()], Duration::from_micros(1))
        .unwrap();
    assert!(began.elapsed() < Duration::from_secs(1) + SLACK);
    assert!(partial.is_partial());
    assert!(planner.cached_labels(&goal).is_none());

    let full = planner
        .suggest_path(&goal, &[start.clone()], Duration::from_secs(30))
        .unwrap();
    let plan = full.plan().unwrap();
    assert!(full.is_found());
    assert_eq!(plan.len(), len);
    assert_eq!(plan.steps[0].node_id, start);
    assert_eq!(plan.steps[len - 1].node_id, goal);
    assert!(planner.cached_labels(&goal).is_some());
}
