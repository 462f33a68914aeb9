//! Graph node types.
//!
//! A node is either a [`NodeKind::Tool`], a single invocable action, or a
//! [`NodeKind::Capability`], a reusable composite that owns an ordered member
//! set (its hyperedge) and a static structure among those members.
//!
//! # Structure Edge Kinds
//!
//! | Kind | Meaning | Ordering? |
//! |------|---------|-----------|
//! | `Provides` | The target consumes the source's output | Yes |
//! | `Sequence` | Observed to run in this order | No |
//! | `Conditional` | The target runs only on some branches | No |
//! | `Contains` | Membership of a nested composite | No |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a graph node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a new node id from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the node id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Kind of a relation inside a capability's static structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StructureEdgeKind {
    /// Observed ordering without a data dependency.
    Sequence,
    /// Genuine dependency: the target cannot start before the source.
    Provides,
    /// Branch-dependent follow-up.
    Conditional,
    /// Membership of a nested composite.
    Contains,
}

impl StructureEdgeKind {
    /// Returns the kind as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sequence => "sequence",
            Self::Provides => "provides",
            Self::Conditional => "conditional",
            Self::Contains => "contains",
        }
    }
}

/// A relation between two members of a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureEdge {
    /// Source member.
    pub from: NodeId,
    /// Target member.
    pub to: NodeId,
    /// Relation kind.
    pub kind: StructureEdgeKind,
}

impl StructureEdge {
    /// Creates a structure edge.
    #[must_use]
    pub fn new(from: impl Into<NodeId>, to: impl Into<NodeId>, kind: StructureEdgeKind) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind,
        }
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Member set and static structure of a capability.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilitySpec {
    /// Ordered members of the hyperedge.
    pub members: Vec<NodeId>,
    /// Relations among members.
    pub structure: Vec<StructureEdge>,
}

impl CapabilitySpec {
    /// Creates a capability spec with the given members and no structure.
    #[must_use]
    pub fn new(members: Vec<NodeId>) -> Self {
        Self {
            members,
            structure: Vec::new(),
        }
    }

    /// Adds a structure edge.
    #[must_use]
    pub fn with_edge(mut self, edge: StructureEdge) -> Self {
        self.structure.push(edge);
        self
    }

    /// Returns the internal `provides` relations.
    pub fn provides_edges(&self) -> impl Iterator<Item = &StructureEdge> {
        self.structure
            .iter()
            .filter(|e| e.kind == StructureEdgeKind::Provides)
    }

    /// Returns the members through which the capability is completed.
    ///
    /// These are the members without an outgoing internal `provides` edge.
    /// When the structure declares no `provides` edge at all, every member
    /// counts as an exit.
    #[must_use]
    pub fn exit_members(&self) -> Vec<&NodeId> {
        let sources: Vec<&NodeId> = self.provides_edges().map(|e| &e.from).collect();
        if sources.is_empty() {
            return self.members.iter().collect();
        }
        self.members
            .iter()
            .filter(|m| !sources.contains(m))
            .collect()
    }

    /// Returns `true` if `id` is a member.
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.contains(id)
    }
}

/// Discriminates tools from composite capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    /// A single invocable action.
    Tool,
    /// A composite action with a member set.
    Capability(CapabilitySpec),
}

impl NodeKind {
    /// Returns the kind label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Capability(_) => "capability",
        }
    }

    /// Returns the capability spec, if any.
    #[must_use]
    pub const fn capability(&self) -> Option<&CapabilitySpec> {
        match self {
            Self::Tool => None,
            Self::Capability(spec) => Some(spec),
        }
    }
}

/// A node in the capability graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node id.
    pub id: NodeId,
    /// Tool or capability.
    pub kind: NodeKind,
    /// Current embedding, at most one per node.
    pub embedding: Option<Vec<f32>>,
    /// Free-form metadata from the catalog.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// When the node was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Creates a tool node.
    #[must_use]
    pub fn tool(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Tool,
            embedding: None,
            metadata: serde_json::Value::Null,
            updated_at: Utc::now(),
        }
    }

    /// Creates a capability node.
    #[must_use]
    pub fn capability(id: impl Into<NodeId>, spec: CapabilitySpec) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Capability(spec),
            embedding: None,
            metadata: serde_json::Value::Null,
            updated_at: Utc::now(),
        }
    }

    /// Sets the embedding.
    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Sets the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Returns `true` for capability nodes.
    #[must_use]
    pub const fn is_capability(&self) -> bool {
        matches!(self.kind, NodeKind::Capability(_))
    }
}
