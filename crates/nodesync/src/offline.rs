//! Offline action queue
//!
//! Mutations made while offline (or before the authority confirms them)
//! are appended here. Each workspace has its own queue, persisted under
//! [`keys::queue`], so sessions sharing a state directory never overwrite
//! each other's intents. A drain walks the
//! queue in FIFO order; an intent leaves only when its handler succeeds or
//! after `max_retries` failed attempts.
//!
//! Concurrent `drain` calls on one queue serialize: the second waits for
//! the first and then makes its own pass over whatever is left.

use crate::clock::{system_clock, SharedClock};
use crate::model::MutationIntent;
use crate::store::{keys, LocalStore};
use crate::{Result, SyncError};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default attempts before an intent is dropped
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Failure reported by a drain handler for one intent
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<crate::AuthorityError> for HandlerError {
    fn from(e: crate::AuthorityError) -> Self {
        Self(e.to_string())
    }
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Intents confirmed and removed
    pub success: usize,
    /// Intents dropped after exhausting their retries
    pub failed: usize,
    /// Intents that failed this pass but stay queued
    pub retained: usize,
    /// The pass stopped early on request
    pub cancelled: bool,
    /// The intents counted in `failed`, in drop order
    pub dropped: Vec<MutationIntent>,
}

/// Persisted FIFO of pending mutation intents
pub struct OfflineQueue {
    workspace_id: String,
    store: Arc<LocalStore>,
    pending: Mutex<VecDeque<MutationIntent>>,
    drain_lock: Mutex<()>,
    cancel_requested: AtomicBool,
    max_retries: u32,
    clock: SharedClock,
}

impl OfflineQueue {
    /// Open the queue of `workspace_id`, restoring intents persisted by an earlier run
    pub async fn open(
        store: Arc<LocalStore>,
        workspace_id: &str,
        max_retries: u32,
    ) -> Result<Self> {
        Self::open_with_clock(store, workspace_id, max_retries, system_clock()).await
    }

    pub async fn open_with_clock(
        store: Arc<LocalStore>,
        workspace_id: &str,
        max_retries: u32,
        clock: SharedClock,
    ) -> Result<Self> {
        if workspace_id.is_empty() || workspace_id.contains('/') {
            return Err(SyncError::InvalidKey(keys::queue(workspace_id)));
        }
        let restored: VecDeque<MutationIntent> = store
            .read(&keys::queue(workspace_id))
            .await?
            .unwrap_or_default();

        if !restored.is_empty() {
            tracing::info!(
                "Loaded {} pending actions for workspace {} from disk",
                restored.len(),
                workspace_id
            );
        }

        Ok(Self {
            workspace_id: workspace_id.to_string(),
            store,
            pending: Mutex::new(restored),
            drain_lock: Mutex::new(()),
            cancel_requested: AtomicBool::new(false),
            max_retries: max_retries.max(1),
            clock,
        })
    }

    /// Workspaces with a queue persisted in `store`, sorted
    pub async fn workspaces(store: &LocalStore) -> Result<Vec<String>> {
        Ok(store
            .list(keys::QUEUE_PREFIX)
            .await?
            .iter()
            .filter_map(|key| keys::queue_workspace(key))
            .map(str::to_string)
            .collect())
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Append an intent to the tail. Returns its id.
    ///
    /// An intent whose id is already queued is not added twice. Intents
    /// for another workspace are rejected.
    pub async fn enqueue(&self, mut intent: MutationIntent) -> Result<String> {
        if intent.workspace_id != self.workspace_id {
            return Err(SyncError::WorkspaceMismatch {
                expected: self.workspace_id.clone(),
                actual: intent.workspace_id,
            });
        }
        if intent.id.is_empty() {
            intent.id = uuid::Uuid::new_v4().to_string();
        }
        if intent.enqueued_at == 0 {
            intent.enqueued_at = self.clock.now_ms();
        }
        let id = intent.id.clone();

        let mut pending = self.pending.lock().await;
        if pending.iter().any(|queued| queued.id == id) {
            tracing::debug!("Intent {} already queued, skipping", id);
            return Ok(id);
        }

        pending.push_back(intent);
        if let Err(e) = self.persist(&pending).await {
            pending.pop_back();
            return Err(e);
        }

        tracing::debug!("Queued intent {} ({} pending)", id, pending.len());
        Ok(id)
    }

    /// Drain without progress reporting
    pub async fn drain<H, Fut>(&self, handler: H) -> Result<DrainReport>
    where
        H: FnMut(MutationIntent) -> Fut,
        Fut: Future<Output = std::result::Result<(), HandlerError>>,
    {
        self.drain_with_progress(handler, |_, _| {}).await
    }

    /// Run every intent queued at the start of the pass through `handler`.
    ///
    /// `on_progress(processed, total)` fires after each item. Intents
    /// enqueued during the pass are left for the next one. A storage
    /// failure while persisting the queue aborts the pass.
    pub async fn drain_with_progress<H, Fut, P>(
        &self,
        mut handler: H,
        mut on_progress: P,
    ) -> Result<DrainReport>
    where
        H: FnMut(MutationIntent) -> Fut,
        Fut: Future<Output = std::result::Result<(), HandlerError>>,
        P: FnMut(usize, usize),
    {
        let _drain_guard = self.drain_lock.lock().await;
        self.cancel_requested.store(false, Ordering::SeqCst);

        let snapshot: Vec<String> = self
            .pending
            .lock()
            .await
            .iter()
            .map(|intent| intent.id.clone())
            .collect();
        let total = snapshot.len();
        let mut report = DrainReport::default();

        if total == 0 {
            return Ok(report);
        }
        tracing::info!("Draining {} pending actions", total);

        for (index, id) in snapshot.iter().enumerate() {
            if self.cancel_requested.swap(false, Ordering::SeqCst) {
                tracing::info!("Drain cancelled after {} of {} actions", index, total);
                report.cancelled = true;
                break;
            }

            let intent = {
                let pending = self.pending.lock().await;
                pending.iter().find(|intent| &intent.id == id).cloned()
            };

            if let Some(intent) = intent {
                let outcome = handler(intent).await;
                self.settle(id, outcome, &mut report).await?;
            }

            on_progress(index + 1, total);
        }

        tracing::info!(
            "Drain finished: {} succeeded, {} failed, {} retained",
            report.success,
            report.failed,
            report.retained
        );
        Ok(report)
    }

    async fn settle(
        &self,
        id: &str,
        outcome: std::result::Result<(), HandlerError>,
        report: &mut DrainReport,
    ) -> Result<()> {
        let mut pending = self.pending.lock().await;
        let Some(position) = pending.iter().position(|intent| intent.id == id) else {
            return Ok(());
        };

        match outcome {
            Ok(()) => {
                pending.remove(position);
                report.success += 1;
            }
            Err(e) => {
                let intent = &mut pending[position];
                intent.retry_count += 1;

                if intent.retry_count >= self.max_retries {
                    tracing::warn!(
                        "Dropping intent {} ({} {}) after {} attempts: {}",
                        id,
                        intent.kind,
                        intent.target_entity,
                        intent.retry_count,
                        e
                    );
                    report.dropped.extend(pending.remove(position));
                    report.failed += 1;
                } else {
                    tracing::warn!(
                        "Intent {} failed (attempt {}/{}): {}",
                        id,
                        intent.retry_count,
                        self.max_retries,
                        e
                    );
                    report.retained += 1;
                }
            }
        }

        self.persist(&pending).await
    }

    /// Ask an in-flight drain to stop before its next item
    pub fn cancel_drain(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    /// Snapshot of the queued intents, head first
    pub async fn pending(&self) -> Vec<MutationIntent> {
        self.pending.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    /// Drop every queued intent. Returns how many were removed.
    pub async fn clear(&self) -> Result<usize> {
        let mut pending = self.pending.lock().await;
        let removed = pending.len();
        pending.clear();
        self.persist(&pending).await?;
        tracing::info!("Cleared {} pending actions", removed);
        Ok(removed)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    async fn persist(&self, pending: &VecDeque<MutationIntent>) -> Result<()> {
        self.store.write(&keys::queue(&self.workspace_id), pending).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Fields, MutationKind};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    fn payload(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    async fn open_queue(temp: &assert_fs::TempDir) -> OfflineQueue {
        let store = Arc::new(LocalStore::new(temp.path()));
        OfflineQueue::open(store, "ws", DEFAULT_MAX_RETRIES).await.unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_assigns_unique_ids() {
        let temp = assert_fs::TempDir::new().unwrap();
        let queue = open_queue(&temp).await;

        let a = queue.enqueue(MutationIntent::update("ws", "n1", Fields::new())).await.unwrap();
        let b = queue.enqueue(MutationIntent::update("ws", "n1", Fields::new())).await.unwrap();
        let c = queue
            .enqueue(MutationIntent::delete("ws", "n1").with_id("mine"))
            .await
            .unwrap();

        assert_ne!(a, b);
        assert_eq!(c, "mine");
        assert_eq!(queue.len().await, 3);
        assert!(queue.pending().await.iter().all(|i| i.enqueued_at > 0));
    }

    #[tokio::test]
    async fn test_duplicate_id_is_not_queued_twice() {
        let temp = assert_fs::TempDir::new().unwrap();
        let queue = open_queue(&temp).await;

        let intent = MutationIntent::update("ws", "n1", Fields::new()).with_id("dup");
        queue.enqueue(intent.clone()).await.unwrap();
        queue.enqueue(intent).await.unwrap();

        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_drain_empty_queue() {
        let temp = assert_fs::TempDir::new().unwrap();
        let queue = open_queue(&temp).await;

        let report = queue
            .drain(|_| async { Ok::<(), HandlerError>(()) })
            .await
            .unwrap();
        assert_eq!(report.success, 0);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_drain_preserves_fifo_order() {
        let temp = assert_fs::TempDir::new().unwrap();
        let queue = open_queue(&temp).await;

        for i in 0..5 {
            queue
                .enqueue(MutationIntent::update("ws", &format!("n{}", i), Fields::new()))
                .await
                .unwrap();
        }

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let report = queue
            .drain(|intent| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(intent.target_entity);
                    Ok::<(), HandlerError>(())
                }
            })
            .await
            .unwrap();

        assert_eq!(report.success, 5);
        assert_eq!(*seen.lock().unwrap(), vec!["n0", "n1", "n2", "n3", "n4"]);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_create_update_delete_offline_then_drain() {
        let temp = assert_fs::TempDir::new().unwrap();
        let queue = open_queue(&temp).await;

        queue.enqueue(MutationIntent::create("ws", "A", payload(json!({"x": 1})))).await.unwrap();
        queue.enqueue(MutationIntent::update("ws", "A", payload(json!({"x": 2})))).await.unwrap();
        queue.enqueue(MutationIntent::delete("ws", "A")).await.unwrap();

        let kinds = Arc::new(StdMutex::new(Vec::new()));
        let report = queue
            .drain(|intent| {
                let kinds = kinds.clone();
                async move {
                    kinds.lock().unwrap().push(intent.kind);
                    Ok::<(), HandlerError>(())
                }
            })
            .await
            .unwrap();

        assert_eq!(report, DrainReport { success: 3, ..Default::default() });
        assert!(queue.is_empty().await);
        assert_eq!(
            *kinds.lock().unwrap(),
            vec![MutationKind::Create, MutationKind::Update, MutationKind::Delete]
        );
    }

    #[tokio::test]
    async fn test_intent_failing_three_times_is_dropped() {
        let temp = assert_fs::TempDir::new().unwrap();
        let queue = open_queue(&temp).await;
        queue.enqueue(MutationIntent::update("ws", "n1", Fields::new())).await.unwrap();

        let always_fail = |_: MutationIntent| async { Err::<(), _>(HandlerError::new("offline")) };

        let first = queue.drain(always_fail).await.unwrap();
        assert_eq!((first.success, first.failed, first.retained), (0, 0, 1));
        assert_eq!(queue.pending().await[0].retry_count, 1);

        let second = queue.drain(always_fail).await.unwrap();
        assert_eq!((second.failed, second.retained), (0, 1));

        let third = queue.drain(always_fail).await.unwrap();
        assert_eq!((third.success, third.failed, third.retained), (0, 1, 0));
        assert_eq!(third.dropped.len(), 1);
        assert_eq!(third.dropped[0].target_entity, "n1");
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_intent_failing_twice_then_succeeding() {
        let temp = assert_fs::TempDir::new().unwrap();
        let queue = open_queue(&temp).await;
        queue.enqueue(MutationIntent::update("ws", "n1", Fields::new())).await.unwrap();

        let attempts = Arc::new(StdMutex::new(0));
        let mut total_success = 0;
        let mut total_failed = 0;
        for _ in 0..3 {
            let report = queue
                .drain(|_| {
                    let attempts = attempts.clone();
                    async move {
                        let mut attempts = attempts.lock().unwrap();
                        *attempts += 1;
                        if *attempts <= 2 {
                            Err(HandlerError::new("flaky"))
                        } else {
                            Ok(())
                        }
                    }
                })
                .await
                .unwrap();
            total_success += report.success;
            total_failed += report.failed;
        }

        assert_eq!(total_success, 1);
        assert_eq!(total_failed, 0);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_remaining_items() {
        let temp = assert_fs::TempDir::new().unwrap();
        let queue = open_queue(&temp).await;
        for name in ["a", "bad", "c"] {
            queue.enqueue(MutationIntent::update("ws", name, Fields::new())).await.unwrap();
        }

        let report = queue
            .drain(|intent| async move {
                if intent.target_entity == "bad" {
                    Err(HandlerError::new("rejected"))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(report.success, 2);
        assert_eq!(report.retained, 1);
        let left = queue.pending().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].target_entity, "bad");
    }

    #[tokio::test]
    async fn test_progress_reports_each_item() {
        let temp = assert_fs::TempDir::new().unwrap();
        let queue = open_queue(&temp).await;
        for i in 0..3 {
            queue.enqueue(MutationIntent::update("ws", &i.to_string(), Fields::new())).await.unwrap();
        }

        let mut progress = Vec::new();
        queue
            .drain_with_progress(
                |_| async { Ok::<(), HandlerError>(()) },
                |processed, total| progress.push((processed, total)),
            )
            .await
            .unwrap();

        assert_eq!(progress, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let temp = assert_fs::TempDir::new().unwrap();
        {
            let queue = open_queue(&temp).await;
            queue.enqueue(MutationIntent::create("ws", "A", payload(json!({"x": 1})))).await.unwrap();
            queue.enqueue(MutationIntent::update("ws", "B", Fields::new())).await.unwrap();
            queue
                .drain(|intent| async move {
                    if intent.target_entity == "A" {
                        Err(HandlerError::new("timeout"))
                    } else {
                        Ok(())
                    }
                })
                .await
                .unwrap();
        }

        let reopened = open_queue(&temp).await;
        let pending = reopened.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target_entity, "A");
        assert_eq!(pending[0].retry_count, 1);
        assert_eq!(pending[0].payload["x"], json!(1));
    }

    #[tokio::test]
    async fn test_corrupt_queue_file_opens_empty() {
        let temp = assert_fs::TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("queue/ws")).unwrap();
        std::fs::write(temp.path().join("queue/ws/pending_actions.json"), b"\x00\x01garbage").unwrap();

        let queue = open_queue(&temp).await;
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_enqueue_during_drain_is_kept_for_next_pass() {
        let temp = assert_fs::TempDir::new().unwrap();
        let queue = open_queue(&temp).await;
        queue.enqueue(MutationIntent::update("ws", "first", Fields::new())).await.unwrap();

        let q = &queue;
        let report = q
            .drain(|intent| async move {
                if intent.target_entity == "first" {
                    if let Err(e) = q
                        .enqueue(MutationIntent::update("ws", "late", Fields::new()))
                        .await
                    {
                        return Err(HandlerError::new(e.to_string()));
                    }
                }
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(report.success, 1);
        let left = queue.pending().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].target_entity, "late");

        let next = queue
            .drain(|_| async { Ok::<(), HandlerError>(()) })
            .await
            .unwrap();
        assert_eq!(next.success, 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_drains_serialize() {
        let temp = assert_fs::TempDir::new().unwrap();
        let queue = open_queue(&temp).await;
        for i in 0..10 {
            queue.enqueue(MutationIntent::update("ws", &format!("n{}", i), Fields::new())).await.unwrap();
        }

        let calls: Arc<StdMutex<HashMap<String, usize>>> = Arc::new(StdMutex::new(HashMap::new()));
        let handler = |intent: MutationIntent| {
            let calls = calls.clone();
            async move {
                tokio::task::yield_now().await;
                *calls.lock().unwrap().entry(intent.id).or_insert(0) += 1;
                Ok::<(), HandlerError>(())
            }
        };

        let (a, b) = tokio::join!(queue.drain(handler), queue.drain(handler));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.success + b.success, 10);
        assert_eq!(a.failed + b.failed, 0);
        assert!(calls.lock().unwrap().values().all(|&count| count == 1));
        assert_eq!(calls.lock().unwrap().len(), 10);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_cancel_stops_between_items() {
        let temp = assert_fs::TempDir::new().unwrap();
        let queue = open_queue(&temp).await;
        for i in 0..4 {
            queue.enqueue(MutationIntent::update("ws", &i.to_string(), Fields::new())).await.unwrap();
        }

        let q = &queue;
        let report = q
            .drain(|_| {
                q.cancel_drain();
                async { Ok::<(), HandlerError>(()) }
            })
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.success, 1);
        assert_eq!(queue.len().await, 3);
    }

    #[tokio::test]
    async fn test_clear() {
        let temp = assert_fs::TempDir::new().unwrap();
        let queue = open_queue(&temp).await;
        queue.enqueue(MutationIntent::delete("ws", "x")).await.unwrap();

        assert_eq!(queue.clear().await.unwrap(), 1);
        assert!(open_queue(&temp).await.is_empty().await);
    }

    #[tokio::test]
    async fn test_workspaces_sharing_a_store_keep_their_own_intents() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(temp.path()));
        let a = OfflineQueue::open(store.clone(), "ws-a", 3).await.unwrap();
        let b = OfflineQueue::open(store.clone(), "ws-b", 3).await.unwrap();

        a.enqueue(MutationIntent::create("ws-a", "n1", Fields::new())).await.unwrap();
        b.enqueue(MutationIntent::create("ws-b", "n2", Fields::new())).await.unwrap();
        a.enqueue(MutationIntent::update("ws-a", "n1", Fields::new())).await.unwrap();

        assert_eq!(
            OfflineQueue::workspaces(&store).await.unwrap(),
            vec!["ws-a".to_string(), "ws-b".to_string()]
        );

        let reopened_a = OfflineQueue::open(store.clone(), "ws-a", 3).await.unwrap();
        let reopened_b = OfflineQueue::open(store.clone(), "ws-b", 3).await.unwrap();
        assert_eq!(reopened_a.len().await, 2);
        assert_eq!(reopened_b.pending().await[0].target_entity, "n2");
    }

    #[tokio::test]
    async fn test_workspace_id_must_be_one_key_segment() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(temp.path()));

        for workspace in ["", "a/b"] {
            let result = OfflineQueue::open(store.clone(), workspace, 3).await;
            assert!(matches!(result, Err(SyncError::InvalidKey(_))), "{:?}", workspace);
        }
    }

    #[tokio::test]
    async fn test_enqueue_for_other_workspace_is_rejected() {
        let temp = assert_fs::TempDir::new().unwrap();
        let queue = open_queue(&temp).await;

        let err = queue
            .enqueue(MutationIntent::delete("elsewhere", "n1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::WorkspaceMismatch { .. }));
        assert!(queue.is_empty().await);
    }
}
