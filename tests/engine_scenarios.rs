//! End-to-end scenarios against the public engine API.
//!
//! Each test drives [`CapabilityEngine`] or one of its components the way an
//! agent runtime would: register actions, observe executions, plan, and
//! report outcomes.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use capgraph::storage::{Direction, EpisodicConfig};
use capgraph::{
    ActionDescriptor, CapabilityEngine, ContextKey, Edge, EdgeKind, EdgeSource, EngineConfig,
    EpisodicEvent, EpisodicStore, Error, GoalSpec, Node, NodeId, ObservedExecution, Outcome,
    PlanResult, StaticCatalog,
};
use std::time::Duration;

const DEADLINE: Duration = Duration::from_secs(5);

fn engine() -> CapabilityEngine {
    CapabilityEngine::in_memory(EngineConfig::default()).unwrap()
}

fn engine_with_tools(ids: &[&str]) -> CapabilityEngine {
    let engine = engine();
    for id in ids {
        engine.graph().add_node(Node::tool(*id)).unwrap();
    }
    engine
}

fn observed(from: &str, to: &str) -> Edge {
    Edge::new(from, to, EdgeKind::Provides, EdgeSource::Observed)
}

fn step_ids(result: &PlanResult) -> Vec<String> {
    result
        .plan()
        .map(|p| p.steps.iter().map(|s| s.node_id.as_str().to_string()).collect())
        .unwrap_or_default()
}

// ============================================================================
// Search
// ============================================================================

#[test]
fn test_search_on_empty_graph_returns_nothing() {
    let engine = engine();
    let response = engine.search("anything", 5, &[]);
    assert!(response.is_empty());
    assert!(response.degraded.is_none());
}

#[test]
fn test_search_finds_synced_action_by_description() {
    let engine = engine();
    let catalog = StaticCatalog::new(vec![
        ActionDescriptor::tool("fetch_invoice").with_hint("download an invoice pdf"),
        ActionDescriptor::tool("send_email").with_hint("send an email message"),
    ]);
    engine.sync_actions(&catalog).unwrap();

    let response = engine.search("download invoice", 2, &[]);
    assert_eq!(response.candidates[0].node_id.as_str(), "fetch_invoice");
}

// ============================================================================
// Planning
// ============================================================================

#[test]
fn test_unreachable_goal_is_not_found() {
    let engine = engine_with_tools(&["a", "b", "c"]);
    engine.graph().add_edge(observed("a", "b")).unwrap();

    let outcome = engine
        .suggest_path(&GoalSpec::node("c"), &[NodeId::new("a")], DEADLINE)
        .unwrap();
    assert_eq!(outcome.result, PlanResult::NotFound);
    assert_eq!(outcome.resolved_goal, Some(NodeId::new("c")));
    assert!(outcome.confidence.is_none());
}

#[test]
fn test_adding_an_edge_makes_goal_reachable() {
    let engine = engine_with_tools(&["a", "b", "c"]);
    engine.graph().add_edge(observed("a", "b")).unwrap();
    let starts = [NodeId::new("a")];

    let before = engine
        .suggest_path(&GoalSpec::node("c"), &starts, DEADLINE)
        .unwrap();
    assert_eq!(before.result, PlanResult::NotFound);

    engine.graph().add_edge(observed("b", "c")).unwrap();
    let after = engine
        .suggest_path(&GoalSpec::node("c"), &starts, DEADLINE)
        .unwrap();

    assert!(after.result.is_found());
    assert_eq!(step_ids(&after.result), vec!["a", "b", "c"]);
    let expected = observed("a", "b").traversal_cost() + observed("b", "c").traversal_cost();
    let cost = after.result.plan().unwrap().total_cost;
    assert!((cost - expected).abs() < 1e-9, "cost {cost} expected {expected}");
    assert!(after.confidence.is_none_or(|c| (0.0..=1.0).contains(&c)));
}

#[test]
fn test_observed_execution_builds_plannable_route() {
    let engine = engine();
    let catalog = StaticCatalog::new(vec![
        ActionDescriptor::tool("search_flights").with_hint("search for flights"),
        ActionDescriptor::tool("book_flight").with_hint("book a flight ticket"),
        ActionDescriptor::tool("email_itinerary").with_hint("email the itinerary"),
        ActionDescriptor::tool("convert_currency").with_hint("convert between currencies"),
        ActionDescriptor::tool("check_weather").with_hint("weather forecast lookup"),
        ActionDescriptor::tool("translate_text").with_hint("translate text to another language"),
        ActionDescriptor::tool("resize_image").with_hint("resize an image"),
        ActionDescriptor::tool("schedule_meeting").with_hint("schedule a calendar meeting"),
    ]);
    engine.sync_actions(&catalog).unwrap();
    engine
        .observe_execution(
            &ObservedExecution::new(
                "travel",
                vec![
                    NodeId::new("search_flights"),
                    NodeId::new("book_flight"),
                    NodeId::new("email_itinerary"),
                ],
            )
            .with_provides("search_flights", "book_flight")
            .with_provides("book_flight", "email_itinerary"),
        )
        .unwrap();

    let outcome = engine
        .suggest_path(
            &GoalSpec::text("email the itinerary"),
            &[NodeId::new("search_flights")],
            DEADLINE,
        )
        .unwrap();
    assert_eq!(outcome.resolved_goal, Some(NodeId::new("email_itinerary")));
    assert_eq!(
        step_ids(&outcome.result),
        vec!["search_flights", "book_flight", "email_itinerary"]
    );
}

// ============================================================================
// Graph integrity
// ============================================================================

#[test]
fn test_cycle_is_rejected_and_graph_unchanged() {
    let engine = engine_with_tools(&["a", "b", "c"]);
    engine.graph().add_edge(observed("a", "b")).unwrap();
    engine.graph().add_edge(observed("b", "c")).unwrap();
    let version = engine.graph().version();

    let err = engine.graph().add_edge(observed("c", "a")).unwrap_err();
    assert!(matches!(err, Error::CycleRejected { .. }));

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.version(), version);
    let a = NodeId::new("a");
    assert_eq!(snapshot.neighbors(&a, Direction::Outgoing), vec![NodeId::new("b")]);
    assert!(snapshot.neighbors(&a, Direction::Incoming).is_empty());
    assert!(
        snapshot
            .neighbors(&NodeId::new("c"), Direction::Outgoing)
            .is_empty()
    );
}

// ============================================================================
// Thresholds
// ============================================================================

#[test]
fn test_high_success_context_lowers_threshold_into_band() {
    let engine = engine_with_tools(&["act"]);
    let key = ContextKey::new("x");
    let initial = engine.get_threshold(&key);
    let action = NodeId::new("act");

    // One failure in twenty: a 95% success rate.
    for i in 0..100 {
        let outcome = if i % 20 == 19 { Outcome::Failure } else { Outcome::Success };
        engine.record_outcome(&key, &action, 0.9, outcome).unwrap();
    }

    let value = engine.get_threshold(&key);
    assert!((0.80..=0.90).contains(&value), "threshold {value}");
    assert!(value < initial);
}

#[test]
fn test_unrelated_context_keeps_default_threshold() {
    let engine = engine_with_tools(&["act"]);
    let busy = ContextKey::new("busy");
    for _ in 0..50 {
        engine
            .record_outcome(&busy, &NodeId::new("act"), 0.9, Outcome::Success)
            .unwrap();
    }
    let quiet = engine.get_threshold(&ContextKey::new("quiet"));
    assert!((quiet - engine.config().threshold.default_threshold).abs() < f64::EPSILON);
}

// ============================================================================
// Prioritized replay
// ============================================================================

#[test]
fn test_replay_frequency_follows_prediction_error() {
    let config = EpisodicConfig::default();
    let alpha = config.priority_alpha;
    let epsilon = config.priority_epsilon;
    let store = EpisodicStore::new(config, None);

    let small = EpisodicEvent::new("ctx", "small_error", 0.9, Outcome::Success);
    let large = EpisodicEvent::new("ctx", "large_error", 0.1, Outcome::Success);
    let small_id = small.id;
    let large_id = large.id;
    store.record(small).unwrap();
    store.record(large).unwrap();
    assert_eq!(store.flush(), 2);

    let mut small_draws = 0u32;
    let mut large_draws = 0u32;
    for _ in 0..100 {
        for draw in store.sample(100) {
            if draw.event.id == small_id {
                small_draws += 1;
            } else if draw.event.id == large_id {
                large_draws += 1;
            }
        }
    }
    assert_eq!(small_draws + large_draws, 10_000);

    let expected = ((0.9 + epsilon) / (0.1 + epsilon)).powf(alpha);
    let observed = f64::from(large_draws) / f64::from(small_draws);
    assert!(
        (observed - expected).abs() / expected < 0.1,
        "observed ratio {observed}, expected {expected}"
    );

    let p_large = store.probability_of(&large_id).unwrap();
    let p_small = store.probability_of(&small_id).unwrap();
    assert!((p_large / p_small - expected).abs() < 1e-9);
}
