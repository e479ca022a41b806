//! Authoritative store adapter
//!
//! The system of record sits behind [`AuthoritativeStore`]: insert, update
//! and delete return the committed version, and every commit is announced
//! on a per-workspace feed. [`InMemoryAuthority`] is the in-process
//! implementation used for local runs and tests.

use crate::clock::{system_clock, SharedClock};
use crate::engine::SyncEngine;
use crate::model::{merge_fields, EntityRecord, Fields};
use crate::protocol::ChangeEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Errors reported by the authoritative store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorityError {
    #[error("authoritative store unavailable: {0}")]
    Unavailable(String),

    #[error("entity not found: {0}")]
    NotFound(String),
}

/// Typed interface to the system of record
#[async_trait]
pub trait AuthoritativeStore: Send + Sync {
    /// Create an entity. Re-inserting a live entity merges into it.
    async fn insert(
        &self,
        workspace_id: &str,
        entity_id: &str,
        fields: Fields,
        origin_peer: &str,
    ) -> Result<EntityRecord, AuthorityError>;

    /// Merge `fields` over the stored record
    async fn update(
        &self,
        workspace_id: &str,
        entity_id: &str,
        fields: Fields,
        origin_peer: &str,
    ) -> Result<EntityRecord, AuthorityError>;

    /// Delete an entity. Returns the version of the deletion.
    async fn delete(
        &self,
        workspace_id: &str,
        entity_id: &str,
        origin_peer: &str,
    ) -> Result<u64, AuthorityError>;

    /// Every live record of a workspace
    async fn fetch(&self, workspace_id: &str) -> Result<Vec<EntityRecord>, AuthorityError>;

    /// Committed change feed of a workspace
    fn subscribe(&self, workspace_id: &str) -> broadcast::Receiver<ChangeEvent>;
}

type EntityKey = (String, String);

#[derive(Default)]
struct AuthorityState {
    records: HashMap<EntityKey, EntityRecord>,
    /// Version at which a deleted entity was removed
    tombstones: HashMap<EntityKey, u64>,
}

impl AuthorityState {
    fn last_version(&self, key: &EntityKey) -> u64 {
        self.records
            .get(key)
            .map(|record| record.version)
            .or_else(|| self.tombstones.get(key).copied())
            .unwrap_or(0)
    }
}

/// In-process system of record with per-entity monotonic versions
pub struct InMemoryAuthority {
    state: Mutex<AuthorityState>,
    feeds: Mutex<HashMap<String, broadcast::Sender<ChangeEvent>>>,
    feed_capacity: usize,
    clock: SharedClock,
    offline: AtomicBool,
    fail_next: AtomicUsize,
}

impl InMemoryAuthority {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(AuthorityState::default()),
            feeds: Mutex::new(HashMap::new()),
            feed_capacity: 1024,
            clock,
            offline: AtomicBool::new(false),
            fail_next: AtomicUsize::new(0),
        }
    }

    /// Simulate a partition: every call fails while offline
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` write or fetch calls
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Current committed record, if live
    pub fn record(&self, workspace_id: &str, entity_id: &str) -> Option<EntityRecord> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .records
            .get(&(workspace_id.to_string(), entity_id.to_string()))
            .cloned()
    }

    fn check_available(&self) -> Result<(), AuthorityError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AuthorityError::Unavailable("offline".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(AuthorityError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn emit(&self, event: ChangeEvent) {
        let feeds = self.feeds.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = feeds.get(&event.workspace_id) {
            let _ = sender.send(event);
        }
    }

    fn commit(
        &self,
        workspace_id: &str,
        entity_id: &str,
        fields: Fields,
        origin_peer: &str,
        must_exist: bool,
    ) -> Result<EntityRecord, AuthorityError> {
        self.check_available()?;
        let key = (workspace_id.to_string(), entity_id.to_string());

        let record = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let existing = state.records.get(&key);
            if must_exist && existing.is_none() {
                return Err(AuthorityError::NotFound(entity_id.to_string()));
            }

            let merged = match existing {
                Some(record) => merge_fields(&record.fields, &fields),
                None => fields,
            };
            let record = EntityRecord::new(
                entity_id,
                workspace_id,
                state.last_version(&key) + 1,
                merged,
                self.clock.now_ms(),
            );
            state.tombstones.remove(&key);
            state.records.insert(key, record.clone());
            record
        };

        tracing::debug!(
            "Committed {}/{} at version {}",
            workspace_id,
            entity_id,
            record.version
        );
        self.emit(ChangeEvent::committed(&record, origin_peer));
        Ok(record)
    }
}

impl Default for InMemoryAuthority {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthoritativeStore for InMemoryAuthority {
    async fn insert(
        &self,
        workspace_id: &str,
        entity_id: &str,
        fields: Fields,
        origin_peer: &str,
    ) -> Result<EntityRecord, AuthorityError> {
        self.commit(workspace_id, entity_id, fields, origin_peer, false)
    }

    async fn update(
        &self,
        workspace_id: &str,
        entity_id: &str,
        fields: Fields,
        origin_peer: &str,
    ) -> Result<EntityRecord, AuthorityError> {
        self.commit(workspace_id, entity_id, fields, origin_peer, true)
    }

    async fn delete(
        &self,
        workspace_id: &str,
        entity_id: &str,
        origin_peer: &str,
    ) -> Result<u64, AuthorityError> {
        self.check_available()?;
        let key = (workspace_id.to_string(), entity_id.to_string());

        let version = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(version) = state.tombstones.get(&key) {
                // Replayed delete
                return Ok(*version);
            }
            if !state.records.contains_key(&key) {
                return Err(AuthorityError::NotFound(entity_id.to_string()));
            }
            let version = state.last_version(&key) + 1;
            state.records.remove(&key);
            state.tombstones.insert(key, version);
            version
        };

        self.emit(ChangeEvent::committed_delete(
            workspace_id,
            entity_id,
            origin_peer,
            version,
            self.clock.now_ms(),
        ));
        Ok(version)
    }

    async fn fetch(&self, workspace_id: &str) -> Result<Vec<EntityRecord>, AuthorityError> {
        self.check_available()?;
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<EntityRecord> = state
            .records
            .values()
            .filter(|record| record.workspace_id == workspace_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    fn subscribe(&self, workspace_id: &str) -> broadcast::Receiver<ChangeEvent> {
        let mut feeds = self.feeds.lock().unwrap_or_else(|e| e.into_inner());
        feeds
            .entry(workspace_id.to_string())
            .or_insert_with(|| broadcast::channel(self.feed_capacity).0)
            .subscribe()
    }
}

/// Drives committed events from the authoritative feed into an engine
pub struct AuthoritySubscriber {
    handle: Option<JoinHandle<()>>,
}

impl AuthoritySubscriber {
    /// Start delivering the engine's workspace feed.
    ///
    /// If the feed overflows, the engine re-syncs from a full fetch.
    pub fn spawn(authority: Arc<dyn AuthoritativeStore>, engine: Arc<SyncEngine>) -> Self {
        let mut feed = authority.subscribe(engine.workspace_id());

        let handle = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(event) => {
                        if let Err(e) = engine.apply_authoritative(event).await {
                            tracing::error!("Failed to apply committed event: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Missed {} committed events, reconciling", skipped);
                        if let Err(e) = engine.reconcile(authority.as_ref()).await {
                            tracing::warn!("Reconcile after lag failed: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("Authoritative feed closed");
                        break;
                    }
                }
            }
        });

        Self {
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn stop(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for AuthoritySubscriber {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChangeKind;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_versions_increase_per_entity() {
        let authority = InMemoryAuthority::new();

        let a1 = authority.insert("ws", "a", fields(json!({"x": 1})), "p1").await.unwrap();
        let b1 = authority.insert("ws", "b", fields(json!({"x": 1})), "p1").await.unwrap();
        let a2 = authority.update("ws", "a", fields(json!({"y": 2})), "p2").await.unwrap();

        assert_eq!((a1.version, b1.version, a2.version), (1, 1, 2));
        assert_eq!(a2.fields["x"], json!(1));
        assert_eq!(a2.fields["y"], json!(2));
    }

    #[tokio::test]
    async fn test_update_missing_entity_fails() {
        let authority = InMemoryAuthority::new();
        let err = authority.update("ws", "ghost", Fields::new(), "p1").await.unwrap_err();
        assert_eq!(err, AuthorityError::NotFound("ghost".to_string()));
    }

    #[tokio::test]
    async fn test_delete_is_versioned_and_replayable() {
        let authority = InMemoryAuthority::new();
        authority.insert("ws", "a", Fields::new(), "p1").await.unwrap();

        assert_eq!(authority.delete("ws", "a", "p1").await.unwrap(), 2);
        assert_eq!(authority.delete("ws", "a", "p1").await.unwrap(), 2);
        assert!(authority.record("ws", "a").is_none());

        let revived = authority.insert("ws", "a", Fields::new(), "p1").await.unwrap();
        assert_eq!(revived.version, 3);
    }

    #[tokio::test]
    async fn test_feed_announces_commits_with_origin() {
        let authority = InMemoryAuthority::new();
        let mut feed = authority.subscribe("ws");

        authority.insert("ws", "a", fields(json!({"x": 1})), "p1").await.unwrap();
        authority.delete("ws", "a", "p2").await.unwrap();

        let insert = feed.recv().await.unwrap();
        assert_eq!((insert.kind, insert.version, insert.peer_id.as_str()), (ChangeKind::Upsert, Some(1), "p1"));
        let delete = feed.recv().await.unwrap();
        assert_eq!((delete.kind, delete.version, delete.peer_id.as_str()), (ChangeKind::Delete, Some(2), "p2"));
    }

    #[tokio::test]
    async fn test_offline_and_injected_failures() {
        let authority = InMemoryAuthority::new();

        authority.set_offline(true);
        assert!(matches!(
            authority.insert("ws", "a", Fields::new(), "p1").await,
            Err(AuthorityError::Unavailable(_))
        ));
        authority.set_offline(false);

        authority.fail_next(2);
        assert!(authority.fetch("ws").await.is_err());
        assert!(authority.fetch("ws").await.is_err());
        assert!(authority.fetch("ws").await.is_ok());
    }

    #[tokio::test]
    async fn test_fetch_is_scoped_to_workspace() {
        let authority = InMemoryAuthority::new();
        authority.insert("ws-a", "n2", Fields::new(), "p1").await.unwrap();
        authority.insert("ws-a", "n1", Fields::new(), "p1").await.unwrap();
        authority.insert("ws-b", "n3", Fields::new(), "p1").await.unwrap();

        let ids: Vec<String> = authority
            .fetch("ws-a")
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.id)
            .collect();
        assert_eq!(ids, vec!["n1", "n2"]);
    }
}
