//! Change event wire types

use crate::model::{EntityRecord, Fields};
use serde::{Deserialize, Serialize};

/// Topic a workspace's node events travel on
pub fn topic_for(workspace_id: &str) -> String {
    format!("workspace:{}:nodes", workspace_id)
}

/// What happened to the entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Entity created or fields changed
    Upsert,
    /// Entity removed
    Delete,
}

/// Notification that an entity changed.
///
/// Events without a `version` come from the broadcast channel and are
/// provisional. Versioned events are committed by the authoritative store.
/// Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub entity_id: String,
    /// Peer that produced the change
    pub peer_id: String,
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Unix milliseconds at the origin
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Fields>,
}

impl ChangeEvent {
    /// Unversioned live-edit carrying the latest local fields
    pub fn provisional(
        workspace_id: &str,
        entity_id: &str,
        peer_id: &str,
        fields: Fields,
        timestamp: i64,
    ) -> Self {
        Self {
            kind: ChangeKind::Upsert,
            entity_id: entity_id.to_string(),
            peer_id: peer_id.to_string(),
            workspace_id: workspace_id.to_string(),
            version: None,
            timestamp,
            payload: Some(fields),
        }
    }

    /// Unversioned live-delete
    pub fn provisional_delete(
        workspace_id: &str,
        entity_id: &str,
        peer_id: &str,
        timestamp: i64,
    ) -> Self {
        Self {
            kind: ChangeKind::Delete,
            entity_id: entity_id.to_string(),
            peer_id: peer_id.to_string(),
            workspace_id: workspace_id.to_string(),
            version: None,
            timestamp,
            payload: None,
        }
    }

    /// Committed state of a record, as emitted by the authoritative store
    pub fn committed(record: &EntityRecord, peer_id: &str) -> Self {
        Self {
            kind: ChangeKind::Upsert,
            entity_id: record.id.clone(),
            peer_id: peer_id.to_string(),
            workspace_id: record.workspace_id.clone(),
            version: Some(record.version),
            timestamp: record.updated_at,
            payload: Some(record.fields.clone()),
        }
    }

    /// Committed delete at `version`
    pub fn committed_delete(
        workspace_id: &str,
        entity_id: &str,
        peer_id: &str,
        version: u64,
        timestamp: i64,
    ) -> Self {
        Self {
            kind: ChangeKind::Delete,
            entity_id: entity_id.to_string(),
            peer_id: peer_id.to_string(),
            workspace_id: workspace_id.to_string(),
            version: Some(version),
            timestamp,
            payload: None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.version.is_none()
    }

    pub fn topic(&self) -> String {
        topic_for(&self.workspace_id)
    }

    /// Serialize event to JSON bytes
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize event from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_naming() {
        assert_eq!(topic_for("abc"), "workspace:abc:nodes");
    }

    #[test]
    fn test_provisional_event_omits_version() {
        let fields = json!({"x": 10}).as_object().cloned().unwrap();
        let event = ChangeEvent::provisional("ws-1", "node-1", "peer-a", fields, 42);

        let value: serde_json::Value = serde_json::from_slice(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], json!("upsert"));
        assert!(value.get("version").is_none());

        let parsed = ChangeEvent::from_bytes(&event.to_bytes().unwrap()).unwrap();
        assert!(parsed.is_provisional());
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_committed_event_carries_record() {
        let record = EntityRecord::new(
            "node-1",
            "ws-1",
            7,
            json!({"title": "Plan"}).as_object().cloned().unwrap(),
            1_000,
        );
        let event = ChangeEvent::committed(&record, "peer-b");

        assert_eq!(event.version, Some(7));
        assert_eq!(event.timestamp, 1_000);
        assert_eq!(event.payload.unwrap()["title"], json!("Plan"));
        assert_eq!(event.peer_id, "peer-b");
    }

    #[test]
    fn test_garbage_bytes_rejected() {
        assert!(ChangeEvent::from_bytes(b"{not json").is_err());
    }
}
