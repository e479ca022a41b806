//! Entity, intent and presence records

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form fields of a node. Merges are whole-key overwrites.
pub type Fields = Map<String, Value>;

/// Kind of mutation recorded in the offline queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl std::str::FromStr for MutationKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown mutation kind: {}", other)),
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        f.pad(name)
    }
}

/// A pending mutation made locally, owned by the offline queue until drained
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationIntent {
    /// Client-generated id; the queue assigns one when empty
    #[serde(default)]
    pub id: String,

    pub kind: MutationKind,

    pub workspace_id: String,

    /// Entity the mutation targets
    pub target_entity: String,

    #[serde(default)]
    pub payload: Fields,

    /// Unix milliseconds; set by the queue on enqueue
    #[serde(default)]
    pub enqueued_at: i64,

    #[serde(default)]
    pub retry_count: u32,
}

impl MutationIntent {
    pub fn new(
        kind: MutationKind,
        workspace_id: impl Into<String>,
        target_entity: impl Into<String>,
        payload: Fields,
    ) -> Self {
        Self {
            id: String::new(),
            kind,
            workspace_id: workspace_id.into(),
            target_entity: target_entity.into(),
            payload,
            enqueued_at: 0,
            retry_count: 0,
        }
    }

    pub fn create(workspace_id: &str, target_entity: &str, payload: Fields) -> Self {
        Self::new(MutationKind::Create, workspace_id, target_entity, payload)
    }

    pub fn update(workspace_id: &str, target_entity: &str, payload: Fields) -> Self {
        Self::new(MutationKind::Update, workspace_id, target_entity, payload)
    }

    pub fn delete(workspace_id: &str, target_entity: &str) -> Self {
        Self::new(MutationKind::Delete, workspace_id, target_entity, Fields::new())
    }

    /// Attach a caller-chosen id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Cached copy of one node. `version` is assigned by the authoritative store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub workspace_id: String,
    pub version: u64,
    #[serde(default)]
    pub fields: Fields,
    pub updated_at: i64,
}

impl EntityRecord {
    pub fn new(
        id: impl Into<String>,
        workspace_id: impl Into<String>,
        version: u64,
        fields: Fields,
        updated_at: i64,
    ) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            version,
            fields,
            updated_at,
        }
    }
}

/// Liveness of one peer in one workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub peer_id: String,
    pub display_name: String,
    /// `#rrggbb`, stable per peer id
    pub colour: String,
    /// What the peer is looking at (node id, route, ...)
    pub location: Option<String>,
    pub last_seen_at: i64,
}

/// Merge `incoming` over `base`, key by key
pub fn merge_fields(base: &Fields, incoming: &Fields) -> Fields {
    let mut merged = base.clone();
    for (key, value) in incoming {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
