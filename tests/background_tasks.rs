//! Background task tests.
//!
//! Drives the episodic flusher and the training loop started by
//! [`CapabilityEngine::spawn_background`] on a current-thread runtime.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use capgraph::services::{ScorerConfig, TrainingConfig};
use capgraph::storage::EpisodicConfig;
use capgraph::{CapabilityEngine, ContextKey, EngineConfig, Node, NodeId, Outcome};
use std::time::Duration;

fn fast_engine() -> CapabilityEngine {
    let mut config = EngineConfig::default();
    config.episodic = EpisodicConfig::default()
        .with_flush_interval_ms(10)
        .with_flush_batch_size(4);
    config.training = TrainingConfig::default()
        .with_interval_ms(20)
        .with_batch_size(8);
    config.scorer = ScorerConfig::default().with_min_examples(1, 1);
    let engine = CapabilityEngine::in_memory(config).unwrap();
    engine.graph().add_node(Node::tool("act")).unwrap();
    engine
}

fn report(engine: &CapabilityEngine, count: usize) {
    let key = ContextKey::new("bg");
    for i in 0..count {
        let outcome = if i % 3 == 0 { Outcome::Failure } else { Outcome::Success };
        engine
            .record_outcome(&key, &NodeId::new("act"), 0.6, outcome)
            .unwrap();
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[test]
fn test_flusher_drains_buffer_in_background() {
    tokio_test::block_on(async {
        let engine = fast_engine();
        let handle = engine.spawn_background();
        assert_eq!(handle.task_count(), 3);

        report(&engine, 12);
        wait_for(|| engine.episodic().len() == 12).await;
        assert_eq!(engine.episodic().pending(), 0);

        handle.shutdown().await;
    });
}

#[test]
fn test_training_loop_publishes_new_model() {
    tokio_test::block_on(async {
        let engine = fast_engine();
        let handle = engine.spawn_background();

        report(&engine, 24);
        wait_for(|| engine.scorer().model().version >= 1).await;
        assert!(engine.scorer().model().fusion.is_trained());

        handle.shutdown().await;
    });
}

#[test]
fn test_shutdown_flushes_remaining_events() {
    tokio_test::block_on(async {
        let mut config = EngineConfig::default();
        config.episodic = EpisodicConfig::default()
            .with_flush_interval_ms(60_000)
            .with_flush_batch_size(1_000);
        config.training = TrainingConfig::default().with_enabled(false);
        let engine = CapabilityEngine::in_memory(config).unwrap();
        engine.graph().add_node(Node::tool("act")).unwrap();

        let handle = engine.spawn_background();
        assert_eq!(handle.task_count(), 2);
        tokio::task::yield_now().await;
        report(&engine, 5);
        handle.shutdown().await;

        assert_eq!(engine.episodic().len(), 5);
    });
}
