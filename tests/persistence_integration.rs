//! Durable engine tests.
//!
//! These open a [`CapabilityEngine`] over a temporary data directory, drop
//! it, and reopen it to check that the graph, thresholds and episodic log
//! come back as they were.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use capgraph::config::DATABASE_FILE;
use capgraph::embedding::HashEmbedder;
use capgraph::storage::{EpisodicBackend, SqliteEpisodicBackend};
use capgraph::{
    ActionDescriptor, CapabilityEngine, ContextKey, EngineConfig, EpisodicEvent, GoalSpec, NodeId,
    ObservedExecution, Outcome, StaticCatalog,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const DEADLINE: Duration = Duration::from_secs(5);

fn open(dir: &Path) -> CapabilityEngine {
    let config = EngineConfig::default().with_data_dir(dir);
    CapabilityEngine::open(config, Arc::new(HashEmbedder::new())).unwrap()
}

fn seed(engine: &CapabilityEngine) {
    let catalog = StaticCatalog::new(vec![
        ActionDescriptor::tool("read_csv").with_hint("read a csv file"),
        ActionDescriptor::tool("clean_rows").with_hint("clean and deduplicate rows"),
        ActionDescriptor::tool("plot_chart").with_hint("plot a chart"),
        ActionDescriptor::capability(
            "csv_report",
            vec![NodeId::new("read_csv"), NodeId::new("clean_rows"), NodeId::new("plot_chart")],
        )
        .with_hint("build a report from a csv file"),
    ]);
    engine.sync_actions(&catalog).unwrap();
    engine
        .observe_execution(
            &ObservedExecution::new(
                "report",
                vec![NodeId::new("read_csv"), NodeId::new("clean_rows"), NodeId::new("plot_chart")],
            )
            .with_provides("read_csv", "clean_rows")
            .with_provides("clean_rows", "plot_chart"),
        )
        .unwrap();
}

#[test]
fn test_graph_survives_restart() {
    let dir = TempDir::new().unwrap();
    let (version, nodes, edges, cost) = {
        let engine = open(dir.path());
        seed(&engine);
        let outcome = engine
            .suggest_path(&GoalSpec::node("plot_chart"), &[NodeId::new("read_csv")], DEADLINE)
            .unwrap();
        let snapshot = engine.snapshot();
        (
            snapshot.version(),
            snapshot.node_count(),
            snapshot.edge_count(),
            outcome.result.plan().unwrap().total_cost,
        )
    };
    assert!(dir.path().join(DATABASE_FILE).exists());

    let engine = open(dir.path());
    let snapshot = engine.snapshot();
    assert_eq!(snapshot.version(), version);
    assert_eq!(snapshot.node_count(), nodes);
    assert_eq!(snapshot.edge_count(), edges);
    assert!(
        snapshot
            .node(&NodeId::new("clean_rows"))
            .and_then(|n| n.embedding.as_ref())
            .is_some()
    );

    let outcome = engine
        .suggest_path(&GoalSpec::node("plot_chart"), &[NodeId::new("read_csv")], DEADLINE)
        .unwrap();
    assert!(outcome.result.is_found());
    assert!((outcome.result.plan().unwrap().total_cost - cost).abs() < 1e-9);
}

#[test]
fn test_thresholds_and_outcomes_survive_restart() {
    let dir = TempDir::new().unwrap();
    let key = ContextKey::new("reporting");
    let learned = {
        let engine = open(dir.path());
        seed(&engine);
        for _ in 0..30 {
            engine
                .record_outcome(&key, &NodeId::new("plot_chart"), 0.8, Outcome::Success)
                .unwrap();
        }
        assert_eq!(engine.flush(), 30);
        engine.get_threshold(&key)
    };
    assert!((learned - EngineConfig::default().threshold.default_threshold).abs() > 1e-6);

    let engine = open(dir.path());
    assert!((engine.get_threshold(&key) - learned).abs() < 1e-9);
    assert_eq!(engine.episodic().len(), 30);
    let events = engine.episodic().by_context("reporting", 5);
    assert_eq!(events.len(), 5);
    assert!(events.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
}

#[test]
fn test_retention_prunes_old_events_everywhere() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(dir.path());
        seed(&engine);
        let old = Utc::now() - ChronoDuration::days(90);
        for _ in 0..3 {
            engine
                .report_outcome(
                    EpisodicEvent::new("reporting", "plot_chart", 0.6, Outcome::Success)
                        .with_timestamp(old),
                )
                .unwrap();
        }
        engine
            .record_outcome(
                &ContextKey::new("reporting"),
                &NodeId::new("plot_chart"),
                0.6,
                Outcome::Success,
            )
            .unwrap();
        engine.flush();

        let preview = engine.run_retention(true).unwrap();
        assert!(preview.dry_run);
        assert_eq!(preview.memory_pruned, 3);
        assert_eq!(engine.episodic().len(), 4);

        let result = engine.run_retention(false).unwrap();
        assert_eq!(result.memory_pruned, 3);
        assert_eq!(result.backend_pruned, 3);
        assert_eq!(engine.episodic().len(), 1);
    }

    let backend = SqliteEpisodicBackend::new(dir.path().join(DATABASE_FILE)).unwrap();
    assert_eq!(backend.count().unwrap(), 1);
}

#[test]
fn test_save_graph_is_noop_in_memory() {
    let engine = CapabilityEngine::in_memory(EngineConfig::default()).unwrap();
    seed(&engine);
    engine.save_graph().unwrap();
}
