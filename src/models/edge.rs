// Allow non-const functions that use f64::clamp
#![allow(clippy::missing_const_for_fn)]

//! Typed directed edges.
//!
//! Edge strength is derived from three factors:
//!
//! ```text
//! weight = kind_weight(kind) × source_modifier(source) × (0.5 + 0.5 × confidence)
//! ```
//!
//! | Kind | Weight | Causal? |
//! |------|--------|---------|
//! | `Dependency` | 1.0 | Yes |
//! | `Contains` | 0.8 | No |
//! | `Provides` | 0.7 | Yes |
//! | `Sequence` | 0.5 | No |
//!
//! | Source | Modifier |
//! |--------|----------|
//! | `Observed` | 1.0 |
//! | `Template` | 0.4 |
//!
//! The confidence factor stays in `[0.5, 1.0]`, so an observed edge of a given
//! kind always outweighs any template edge of the same kind.
//!
//! Causal edges point in execution order: `a -> b` means `b` cannot start
//! before `a` has finished.

use super::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Confidence assigned to freshly created edges.
pub const DEFAULT_EDGE_CONFIDENCE: f64 = 0.5;

/// Kind of a top-level graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// Hard ordering constraint.
    Dependency,
    /// Data flows from source to target.
    Provides,
    /// Observed ordering without a data dependency.
    Sequence,
    /// Composite membership.
    Contains,
}

impl EdgeKind {
    /// Returns the kind as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dependency => "dependency",
            Self::Provides => "provides",
            Self::Sequence => "sequence",
            Self::Contains => "contains",
        }
    }

    /// Parses a kind from a string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "dependency" | "depends_on" => Some(Self::Dependency),
            "provides" => Some(Self::Provides),
            "sequence" => Some(Self::Sequence),
            "contains" => Some(Self::Contains),
            _ => None,
        }
    }

    /// Returns all edge kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Dependency, Self::Provides, Self::Sequence, Self::Contains]
    }

    /// Returns the base weight of the kind.
    #[must_use]
    pub const fn weight(&self) -> f64 {
        match self {
            Self::Dependency => 1.0,
            Self::Contains => 0.8,
            Self::Provides => 0.7,
            Self::Sequence => 0.5,
        }
    }

    /// Returns `true` for kinds that constrain execution order.
    ///
    /// The subgraph of causal edges must stay acyclic.
    #[must_use]
    pub const fn is_causal(&self) -> bool {
        matches!(self, Self::Dependency | Self::Provides)
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where an edge came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeSource {
    /// Derived from a static capability template or catalog declaration.
    Template,
    /// Seen in an actual execution trace.
    Observed,
}

impl EdgeSource {
    /// Returns the source as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::Observed => "observed",
        }
    }

    /// Parses a source from a string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "template" => Some(Self::Template),
            "observed" => Some(Self::Observed),
            _ => None,
        }
    }

    /// Returns the weight modifier of the source.
    #[must_use]
    pub const fn modifier(&self) -> f64 {
        match self {
            Self::Observed => 1.0,
            Self::Template => 0.4,
        }
    }
}

/// Identity of an edge: at most one edge per `(from, to, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeKey {
    /// Source node.
    pub from: NodeId,
    /// Target node.
    pub to: NodeId,
    /// Edge kind.
    pub kind: EdgeKind,
}

impl EdgeKey {
    /// Creates an edge key.
    #[must_use]
    pub fn new(from: impl Into<NodeId>, to: impl Into<NodeId>, kind: EdgeKind) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind,
        }
    }
}

/// A typed directed edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node.
    pub from: NodeId,
    /// Target node.
    pub to: NodeId,
    /// Edge kind.
    pub kind: EdgeKind,
    /// Provenance.
    pub source: EdgeSource,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Number of times the edge was seen in execution traces.
    pub observations: u64,
    /// When the edge was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Edge {
    /// Creates an edge with default confidence.
    #[must_use]
    pub fn new(
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        kind: EdgeKind,
        source: EdgeSource,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind,
            source,
            confidence: DEFAULT_EDGE_CONFIDENCE,
            observations: u64::from(source == EdgeSource::Observed),
            updated_at: Utc::now(),
        }
    }

    /// Sets the confidence, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Returns the identity of this edge.
    #[must_use]
    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(self.from.clone(), self.to.clone(), self.kind)
    }

    /// Returns the derived edge strength in `(0, 1]`.
    #[must_use]
    pub fn weight(&self) -> f64 {
        edge_weight(self.kind, self.source, self.confidence)
    }

    /// Returns the planner traversal cost, the reciprocal of the weight.
    ///
    /// Stronger edges are cheaper to traverse.
    #[must_use]
    pub fn traversal_cost(&self) -> f64 {
        1.0 / self.weight()
    }

    /// Records another observation of this edge.
    ///
    /// Promotes the source to [`EdgeSource::Observed`] and moves confidence
    /// toward 1 by `reinforcement` of the remaining gap.
    pub fn observe(&mut self, reinforcement: f64) {
        let rate = reinforcement.clamp(0.0, 1.0);
        self.source = EdgeSource::Observed;
        self.observations = self.observations.saturating_add(1);
        self.confidence = (1.0 - rate).mul_add(-(1.0 - self.confidence), 1.0).clamp(0.0, 1.0);
        self.updated_at = Utc::now();
    }
}

/// Computes the strength of an edge from its kind, source, and confidence.
#[must_use]
pub fn edge_weight(kind: EdgeKind, source: EdgeSource, confidence: f64) -> f64 {
    let confidence_factor = 0.5f64.mul_add(confidence.clamp(0.0, 1.0), 0.5);
    kind.weight() * source.modifier() * confidence_factor
}
