//! Benchmarks for hybrid search.
//!
//! Benchmark targets:
//! - 100 actions: <2ms
//! - 1,000 actions: <10ms
//! - 5,000 actions: <50ms
//!
//! These benchmarks cover the full query path:
//! - Query embedding generation
//! - Flat vector scan
//! - Structural scoring against context nodes
//! - Density-adaptive blending

// Criterion macros generate items without docs - this is expected for benchmarks
// Benchmarks use expect/unwrap for simplicity - panics are acceptable in benchmarks
#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use capgraph::embedding::{Embedder, HashEmbedder};
use capgraph::services::{HybridSearch, SearchConfig};
use capgraph::storage::{BatchPolicy, GraphConfig};
use capgraph::{Edge, EdgeKind, EdgeSource, GraphBatch, GraphStore, Node, NodeId};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

const VERBS: &[&str] = &[
    "read", "write", "parse", "send", "fetch", "index", "render", "merge", "resize", "translate",
];
const OBJECTS: &[&str] = &[
    "file", "email", "invoice", "image", "report", "table", "message", "chart", "record", "page",
];

// ============================================================================
// Helper Functions
// ============================================================================

/// Builds a graph of `count` embedded tools with a sparse chain of edges.
fn build_graph(count: usize, embedder: &HashEmbedder) -> Arc<GraphStore> {
    let store = Arc::new(GraphStore::new(
        GraphConfig::default().with_embedding_dimensions(embedder.dimensions()),
    ));
    let mut batch = GraphBatch::new();
    for i in 0..count {
        let hint = format!(
            "{} the {} number {i}",
            VERBS[i % VERBS.len()],
            OBJECTS[(i / VERBS.len()) % OBJECTS.len()]
        );
        let embedding = embedder.embed(&hint).unwrap();
        batch = batch.upsert_node(Node::tool(format!("tool_{i:05}")).with_embedding(embedding));
    }
    for i in 1..count {
        if i % 3 == 0 {
            batch = batch.upsert_edge(Edge::new(
                format!("tool_{:05}", i - 1),
                format!("tool_{i:05}"),
                EdgeKind::Sequence,
                EdgeSource::Observed,
            ));
        }
    }
    store.apply_batch(batch, BatchPolicy::AllOrNothing).unwrap();
    store
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("hybrid_search");
    group.measurement_time(Duration::from_secs(5));

    let embedder = HashEmbedder::new();
    for count in [100usize, 1_000, 5_000] {
        let store = build_graph(count, &embedder);
        let search = HybridSearch::new(
            Arc::clone(&store),
            Arc::new(embedder),
            SearchConfig::default(),
        );
        let context = vec![NodeId::new("tool_00002"), NodeId::new("tool_00005")];

        group.bench_with_input(BenchmarkId::new("semantic_only", count), &count, |b, _| {
            b.iter(|| black_box(search.search(black_box("parse the invoice"), 10, &[])));
        });
        group.bench_with_input(BenchmarkId::new("with_context", count), &count, |b, _| {
            b.iter(|| black_box(search.search(black_box("send the email"), 10, &context)));
        });
    }
    group.finish();
}

fn bench_embedding(c: &mut Criterion) {
    let embedder = HashEmbedder::new();
    c.bench_function("hash_embed_sentence", |b| {
        b.iter(|| black_box(embedder.embed(black_box("summarize the quarterly revenue report"))));
    });
}

criterion_group!(benches, bench_search, bench_embedding);
criterion_main!(benches);
