//! Hyperpath plans and planner results.

use super::{DegradedReason, HeadScores, NodeId};
use serde::{Deserialize, Serialize};

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Node reached by this step.
    pub node_id: NodeId,
    /// Capability whose hyperedge was traversed to reach the node, if any.
    pub via: Option<NodeId>,
}

impl PlanStep {
    /// Creates a step reached through a top-level edge.
    #[must_use]
    pub fn direct(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            via: None,
        }
    }

    /// Creates a step reached through a capability.
    #[must_use]
    pub fn via(node_id: impl Into<NodeId>, capability: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            via: Some(capability.into()),
        }
    }
}

/// An ordered route from a start node to the goal.
///
/// Costs are traversal costs, not edge weights. An edge arc costs
/// `1 / weight` (see [`Edge::traversal_cost`](crate::Edge::traversal_cost)),
/// so stronger edges are cheaper. Leaving a capability through one of its
/// exit members costs nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Steps in execution order; the first step is a start node.
    pub steps: Vec<PlanStep>,
    /// Sum of the traversal costs of the arcs taken.
    pub total_cost: f64,
}

impl Plan {
    /// Returns the node ids in order.
    #[must_use]
    pub fn node_ids(&self) -> Vec<&NodeId> {
        self.steps.iter().map(|s| &s.node_id).collect()
    }

    /// Returns `true` if the plan has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

/// Result of a planning query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "plan", rename_all = "snake_case")]
pub enum PlanResult {
    /// A proven minimum-cost plan.
    Found(Plan),
    /// The deadline expired; the plan is the best established so far and
    /// may be empty.
    Partial(Plan),
    /// The goal is unreachable from every start node.
    NotFound,
}

impl PlanResult {
    /// Returns the plan, if any.
    #[must_use]
    pub const fn plan(&self) -> Option<&Plan> {
        match self {
            Self::Found(plan) | Self::Partial(plan) => Some(plan),
            Self::NotFound => None,
        }
    }

    /// Returns `true` for [`PlanResult::Found`].
    #[must_use]
    pub const fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    /// Returns `true` for [`PlanResult::Partial`].
    #[must_use]
    pub const fn is_partial(&self) -> bool {
        matches!(self, Self::Partial(_))
    }

    /// Returns the result label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Found(_) => "found",
            Self::Partial(_) => "partial",
            Self::NotFound => "not_found",
        }
    }
}

/// Goal of a planning query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalSpec {
    /// Natural-language goal, resolved through hybrid search.
    Text(String),
    /// A known node.
    Node(NodeId),
}

impl GoalSpec {
    /// Creates a text goal.
    #[must_use]
    pub fn text(goal: impl Into<String>) -> Self {
        Self::Text(goal.into())
    }

    /// Creates a node goal.
    #[must_use]
    pub fn node(id: impl Into<NodeId>) -> Self {
        Self::Node(id.into())
    }
}

/// Planning result with resolution metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOutcome {
    /// The planner result.
    pub result: PlanResult,
    /// Goal node the query resolved to, if any.
    pub resolved_goal: Option<NodeId>,
    /// Mean fused score of the plan steps after the start, if scored.
    pub confidence: Option<f32>,
    /// Set when goal resolution ran without semantic scoring.
    pub degraded: Option<DegradedReason>,
}

/// A candidate for the next action, one hyperedge hop from the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextStepCandidate {
    /// Candidate node.
    pub node_id: NodeId,
    /// Capability linking the candidate to the context, if any.
    pub via: Option<NodeId>,
    /// Structural prior in `[0, 1]`.
    pub prior: f32,
}

/// A next-step candidate after re-ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextStepSuggestion {
    /// The hop the candidate came from.
    pub candidate: NextStepCandidate,
    /// Fused scorer output in `[0, 1]`.
    pub confidence: f32,
    /// Individual head scores.
    pub per_head: HeadScores,
    /// Whether `confidence` clears the context's threshold.
    pub meets_threshold: bool,
}

/// Ranked next-step suggestions for a context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NextStepResponse {
    /// Suggestions by descending confidence.
    pub suggestions: Vec<NextStepSuggestion>,
    /// Threshold the suggestions were compared against.
    pub threshold: f64,
    /// Set when the goal could not be embedded.
    pub degraded: Option<DegradedReason>,
}

impl NextStepResponse {
    /// Returns the suggestions that clear the threshold.
    pub fn confident(&self) -> impl Iterator<Item = &NextStepSuggestion> {
        self.suggestions.iter().filter(|s| s.meets_threshold)
    }
}
