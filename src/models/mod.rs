//! Data models for capgraph.
//!
//! This module contains the graph entities (nodes, edges, capability
//! structure), outcome events, threshold records, and the result types
//! returned by search, planning, and scoring.

mod edge;
mod events;
mod node;
mod plan;
mod scoring;
mod search;
mod threshold;

pub use edge::{DEFAULT_EDGE_CONFIDENCE, Edge, EdgeKey, EdgeKind, EdgeSource, edge_weight};
pub use events::{EpisodicEvent, Outcome, PredictionAux};
pub use node::{CapabilitySpec, Node, NodeId, NodeKind, StructureEdge, StructureEdgeKind};
pub use plan::{
    GoalSpec, NextStepCandidate, NextStepResponse, NextStepSuggestion, Plan, PlanOutcome,
    PlanResult, PlanStep,
};
pub use scoring::{HeadScores, ScoredCandidate};
pub use search::{DegradedReason, RankedCandidate, SearchResponse};
pub use threshold::{ContextKey, ThresholdRecord};
