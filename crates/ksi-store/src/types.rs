//! Graph value types and page shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A `(type, id)` handle addressing one graph node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    /// Entity type (`agent`, `orchestration`, `session`, …).
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Globally unique id within the graph.
    pub id: String,
}

impl EntityRef {
    /// Build a handle.
    #[must_use]
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}

/// A stored entity: property bag plus bookkeeping timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Arbitrary JSON properties.
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// How `update_entity` combines new properties with stored ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// New keys overwrite, unmentioned keys survive.
    Merge,
    /// The property bag is replaced wholesale.
    Replace,
}

// ---------------------------------------------------------------------------
// Relationship
// ---------------------------------------------------------------------------

/// A stored directed relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelRecord {
    /// Source entity.
    pub from: EntityRef,
    /// Relationship kind (`parent_of`, `owns`, `spawned`, …).
    pub kind: String,
    /// Target entity.
    pub to: EntityRef,
    /// Optional JSON properties on the edge.
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// Edge direction relative to the queried entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Edges whose `from` is the queried entity.
    Out,
    /// Edges whose `to` is the queried entity.
    In,
}

// ---------------------------------------------------------------------------
// Pages
// ---------------------------------------------------------------------------

/// One page of KV entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvPage {
    /// Keys and raw values, in key order.
    pub entries: Vec<(String, Vec<u8>)>,
    /// Present when the listing was truncated by `limit`; pass it back to
    /// resume.
    pub next_token: Option<String>,
}

/// One page of relationship edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborPage {
    /// Edges, in key order.
    pub edges: Vec<RelRecord>,
    /// Present when truncated by `limit`.
    pub next_token: Option<String>,
}

/// One page of a BFS traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversePage {
    /// Visited entities with their BFS depth, in visit order. The start
    /// entity appears at depth 0.
    pub entities: Vec<(EntityRef, u32)>,
    /// Present when the walk hit `limit` before exhausting reachable
    /// entities; pass it back to resume.
    pub next_token: Option<String>,
}
