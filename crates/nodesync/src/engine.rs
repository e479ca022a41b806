//! Sync engine orchestration
//!
//! Owns the cached entity map of one workspace. Local mutations are
//! applied optimistically, queued for the authoritative store and
//! broadcast after a debounce window. Remote events, whether live
//! broadcasts or committed changes, go through [`resolve`].

use crate::authority::AuthoritativeStore;
use crate::broadcast::ChangeBroadcaster;
use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::model::{EntityRecord, Fields, MutationIntent, MutationKind};
use crate::offline::{DrainReport, HandlerError, OfflineQueue};
use crate::protocol::ChangeEvent;
use crate::resolver::{resolve, ApplyOutcome, CachedEntity, Resolution};
use crate::store::{keys, LocalStore};
use crate::{Result, SyncError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Cache resource holding the workspace's nodes
const NODES_RESOURCE: &str = "nodes";

/// Where an incoming event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplySource {
    /// Live peer broadcast; own echoes are ignored
    Broadcast,
    /// Committed change from the authoritative store
    Authority,
}

type EntityMap = Arc<Mutex<HashMap<String, CachedEntity>>>;

/// Main sync engine
pub struct SyncEngine {
    workspace_id: String,
    peer_id: String,
    entities: EntityMap,
    store: Arc<LocalStore>,
    queue: Arc<OfflineQueue>,
    broadcaster: Arc<ChangeBroadcaster>,
    debouncer: Debouncer,
    clock: SharedClock,
    persist_lock: tokio::sync::Mutex<()>,
}

impl SyncEngine {
    /// Create the engine, restoring the workspace cache from the local store
    pub async fn open(
        config: &SyncConfig,
        store: Arc<LocalStore>,
        queue: Arc<OfflineQueue>,
        broadcaster: Arc<ChangeBroadcaster>,
        clock: SharedClock,
    ) -> Result<Self> {
        let cache_key = keys::cache(&config.workspace_id, NODES_RESOURCE);
        let restored: HashMap<String, CachedEntity> = store
            .read::<BTreeMap<String, CachedEntity>>(&cache_key)
            .await?
            .unwrap_or_default()
            .into_iter()
            .collect();

        if !restored.is_empty() {
            tracing::info!(
                "Restored {} cached nodes for workspace {}",
                restored.len(),
                config.workspace_id
            );
        }

        Ok(Self {
            workspace_id: config.workspace_id.clone(),
            peer_id: config.peer_id.clone(),
            entities: Arc::new(Mutex::new(restored)),
            store,
            queue,
            broadcaster,
            debouncer: Debouncer::new(config.debounce()),
            clock,
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    //
    // Incoming events
    //

    /// Apply an event from any source
    pub async fn apply(&self, event: ChangeEvent, source: ApplySource) -> Result<ApplyOutcome> {
        if event.workspace_id != self.workspace_id {
            tracing::debug!(
                "Ignoring event for workspace {} (joined {})",
                event.workspace_id,
                self.workspace_id
            );
            return Ok(ApplyOutcome::Ignored);
        }
        if source == ApplySource::Broadcast && event.peer_id == self.peer_id {
            return Ok(ApplyOutcome::Ignored);
        }

        let now = self.clock.now_ms();
        let outcome = {
            let mut entities = self.lock_entities();
            let resolution = resolve(entities.get(&event.entity_id), &event, now);
            let outcome = resolution.outcome();
            match resolution {
                Resolution::Provisional(next) | Resolution::Canonical(next) => {
                    entities.insert(event.entity_id.clone(), next);
                }
                Resolution::Stale { incoming, local } => {
                    tracing::debug!(
                        "Discarding stale event for {} (v{} < v{})",
                        event.entity_id,
                        incoming,
                        local
                    );
                }
                Resolution::Duplicate => {}
            }
            outcome
        };

        if outcome.changed() {
            self.persist_cache().await?;
        }
        Ok(outcome)
    }

    /// Apply a live peer broadcast
    pub async fn apply_broadcast(&self, event: ChangeEvent) -> Result<ApplyOutcome> {
        self.apply(event, ApplySource::Broadcast).await
    }

    /// Apply a committed change from the authoritative feed
    pub async fn apply_authoritative(&self, event: ChangeEvent) -> Result<ApplyOutcome> {
        self.apply(event, ApplySource::Authority).await
    }

    //
    // Local mutations
    //

    /// Create a node locally. Returns its id.
    pub async fn create_local(&self, fields: Fields) -> Result<String> {
        let entity_id = uuid::Uuid::new_v4().to_string();
        self.mutate_local(MutationIntent::create(&self.workspace_id, &entity_id, fields))
            .await?;
        Ok(entity_id)
    }

    /// Merge `fields` into an existing node
    pub async fn update_local(&self, entity_id: &str, fields: Fields) -> Result<()> {
        self.require_live(entity_id)?;
        self.mutate_local(MutationIntent::update(&self.workspace_id, entity_id, fields))
            .await
    }

    pub async fn delete_local(&self, entity_id: &str) -> Result<()> {
        self.require_live(entity_id)?;
        self.mutate_local(MutationIntent::delete(&self.workspace_id, entity_id))
            .await
    }

    async fn mutate_local(&self, intent: MutationIntent) -> Result<()> {
        let now = self.clock.now_ms();
        let event = match intent.kind {
            MutationKind::Create | MutationKind::Update => ChangeEvent::provisional(
                &self.workspace_id,
                &intent.target_entity,
                &self.peer_id,
                intent.payload.clone(),
                now,
            ),
            MutationKind::Delete => ChangeEvent::provisional_delete(
                &self.workspace_id,
                &intent.target_entity,
                &self.peer_id,
                now,
            ),
        };

        {
            let mut entities = self.lock_entities();
            if let Resolution::Provisional(next) =
                resolve(entities.get(&intent.target_entity), &event, now)
            {
                entities.insert(intent.target_entity.clone(), next);
            }
        }

        self.persist_cache().await?;
        let entity_id = intent.target_entity.clone();
        self.queue.enqueue(intent).await?;
        self.schedule_broadcast(&entity_id);
        Ok(())
    }

    fn require_live(&self, entity_id: &str) -> Result<()> {
        let entities = self.lock_entities();
        match entities.get(entity_id) {
            Some(entity) if !entity.is_deleted() => Ok(()),
            _ => Err(SyncError::UnknownEntity(entity_id.to_string())),
        }
    }

    //
    // Broadcasts
    //

    /// Publish the entity's state once no further edit arrives within the window
    fn schedule_broadcast(&self, entity_id: &str) {
        let entities = self.entities.clone();
        let broadcaster = self.broadcaster.clone();
        let clock = self.clock.clone();
        let workspace_id = self.workspace_id.clone();
        let peer_id = self.peer_id.clone();
        let id = entity_id.to_string();

        self.debouncer.schedule(entity_id, move || {
            let state = {
                let entities = entities.lock().unwrap_or_else(|e| e.into_inner());
                entities.get(&id).cloned()
            };
            let Some(state) = state else {
                return;
            };

            let now = clock.now_ms();
            let event = match state.current {
                Some(record) => {
                    ChangeEvent::provisional(&workspace_id, &id, &peer_id, record.fields, now)
                }
                None => ChangeEvent::provisional_delete(&workspace_id, &id, &peer_id, now),
            };
            let reached = broadcaster.publish(event);
            tracing::trace!("Broadcast {} to {} subscribers", id, reached);
        });
    }

    /// Publish every pending debounced broadcast now
    pub fn flush_broadcasts(&self) -> usize {
        self.debouncer.flush()
    }

    pub fn pending_broadcasts(&self) -> usize {
        self.debouncer.pending_count()
    }

    //
    // Authoritative store
    //

    /// Push queued intents to the authoritative store
    pub async fn sync_pending(&self, authority: &dyn AuthoritativeStore) -> Result<DrainReport> {
        self.sync_pending_with_progress(authority, |_, _| {}).await
    }

    pub async fn sync_pending_with_progress<P>(
        &self,
        authority: &dyn AuthoritativeStore,
        on_progress: P,
    ) -> Result<DrainReport>
    where
        P: FnMut(usize, usize),
    {
        let report = self
            .queue
            .drain_with_progress(
                move |intent| self.commit_intent(authority, intent),
                on_progress,
            )
            .await?;
        self.roll_back_dropped(&report).await?;
        Ok(report)
    }

    /// Undo the optimistic state of intents a drain gave up on.
    ///
    /// An entity still targeted by a queued intent is left alone. Otherwise
    /// it returns to its last canonical state (or disappears if it was
    /// never confirmed) and peers are told to do the same.
    pub async fn roll_back_dropped(&self, report: &DrainReport) -> Result<usize> {
        if report.dropped.is_empty() {
            return Ok(0);
        }
        let still_queued = self.queued_targets().await;
        let mut reverted = HashSet::new();
        let mut events = Vec::new();

        {
            let mut entities = self.lock_entities();
            for intent in &report.dropped {
                let id = &intent.target_entity;
                if still_queued.contains(id) || reverted.contains(id) {
                    continue;
                }
                let Some(entity) = entities.get(id) else {
                    continue;
                };
                if !entity.provisional {
                    continue;
                }

                self.debouncer.cancel(id);
                let event = match &entity.canonical {
                    Some(record) => ChangeEvent::committed(record, &self.peer_id),
                    None if entity.canonical_version > 0 => ChangeEvent::committed_delete(
                        &self.workspace_id,
                        id,
                        &self.peer_id,
                        entity.canonical_version,
                        self.clock.now_ms(),
                    ),
                    None => ChangeEvent::provisional_delete(
                        &self.workspace_id,
                        id,
                        &self.peer_id,
                        self.clock.now_ms(),
                    ),
                };

                if entity.canonical_version == 0 {
                    entities.remove(id);
                } else if let Some(entity) = entities.get_mut(id) {
                    entity.current = entity.canonical.clone();
                    entity.provisional = false;
                }
                tracing::warn!("Rolled back unconfirmed changes to {}", id);
                reverted.insert(id.clone());
                events.push(event);
            }
        }

        if events.is_empty() {
            return Ok(0);
        }
        self.persist_cache().await?;
        let count = events.len();
        for event in events {
            self.broadcaster.publish(event);
        }
        Ok(count)
    }

    async fn queued_targets(&self) -> HashSet<String> {
        self.queue
            .pending()
            .await
            .into_iter()
            .map(|intent| intent.target_entity)
            .collect()
    }

    async fn commit_intent(
        &self,
        authority: &dyn AuthoritativeStore,
        intent: MutationIntent,
    ) -> std::result::Result<(), HandlerError> {
        let workspace_id = intent.workspace_id.as_str();
        let entity_id = intent.target_entity.as_str();

        let event = match intent.kind {
            MutationKind::Create => {
                let record = authority
                    .insert(workspace_id, entity_id, intent.payload.clone(), &self.peer_id)
                    .await?;
                ChangeEvent::committed(&record, &self.peer_id)
            }
            MutationKind::Update => {
                let record = authority
                    .update(workspace_id, entity_id, intent.payload.clone(), &self.peer_id)
                    .await?;
                ChangeEvent::committed(&record, &self.peer_id)
            }
            MutationKind::Delete => {
                let version = authority
                    .delete(workspace_id, entity_id, &self.peer_id)
                    .await?;
                ChangeEvent::committed_delete(
                    workspace_id,
                    entity_id,
                    &self.peer_id,
                    version,
                    self.clock.now_ms(),
                )
            }
        };

        // The write is committed; a cache failure here must not requeue it
        if let Err(e) = self.apply(event, ApplySource::Authority).await {
            tracing::warn!("Committed {} but failed to cache it: {}", entity_id, e);
        }
        Ok(())
    }

    /// Re-sync from a full fetch. Returns how many entities changed.
    ///
    /// The snapshot plus this peer's queued edits is the new truth. Local
    /// edits still in the queue are kept while upstream has no newer
    /// version. Any other unconfirmed state is dropped: it reverts to the
    /// snapshot, or disappears if upstream never had the entity. Entities
    /// missing from the snapshot are tombstoned.
    pub async fn reconcile(&self, authority: &dyn AuthoritativeStore) -> Result<usize> {
        let snapshot = authority.fetch(&self.workspace_id).await?;
        let queued = self.queued_targets().await;
        let now = self.clock.now_ms();
        let mut changed = 0;

        {
            let mut entities = self.lock_entities();

            for record in &snapshot {
                let local = entities.get(&record.id);
                if let Some(local) = local {
                    if local.provisional
                        && queued.contains(&record.id)
                        && record.version == local.canonical_version
                    {
                        continue;
                    }
                }
                let event = ChangeEvent::committed(record, &self.peer_id);
                if let Resolution::Canonical(next) = resolve(local, &event, now) {
                    entities.insert(record.id.clone(), next);
                    changed += 1;
                }
            }

            let upstream: HashSet<&str> =
                snapshot.iter().map(|record| record.id.as_str()).collect();
            entities.retain(|id, entity| {
                if upstream.contains(id.as_str()) || (entity.provisional && queued.contains(id)) {
                    return true;
                }
                if entity.canonical_version == 0 {
                    tracing::debug!("Dropping unconfirmed node {}", id);
                    changed += 1;
                    return false;
                }
                if entity.current.is_some() || entity.canonical.is_some() || entity.provisional {
                    entity.current = None;
                    entity.canonical = None;
                    entity.provisional = false;
                    changed += 1;
                }
                true
            });
        }

        tracing::info!(
            "Reconciled workspace {}: {} records upstream, {} changed",
            self.workspace_id,
            snapshot.len(),
            changed
        );
        if changed > 0 {
            self.persist_cache().await?;
        }
        Ok(changed)
    }

    //
    // Cache
    //

    /// Drop every cached entity, in memory and on disk
    pub async fn invalidate_cache(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        self.lock_entities().clear();
        for key in self.store.list(&keys::cache_prefix(&self.workspace_id)).await? {
            self.store.delete(&key).await?;
        }
        tracing::info!("Invalidated cache for workspace {}", self.workspace_id);
        Ok(())
    }

    /// Visible state of a node
    pub fn get(&self, entity_id: &str) -> Option<EntityRecord> {
        self.lock_entities()
            .get(entity_id)
            .and_then(|entity| entity.current.clone())
    }

    /// Full local state of a node, tombstones included
    pub fn cached(&self, entity_id: &str) -> Option<CachedEntity> {
        self.lock_entities().get(entity_id).cloned()
    }

    /// Every live node, sorted by id
    pub fn records(&self) -> Vec<EntityRecord> {
        let mut records: Vec<EntityRecord> = self
            .lock_entities()
            .values()
            .filter_map(|entity| entity.current.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub async fn persist_cache(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot: BTreeMap<String, CachedEntity> = self
            .lock_entities()
            .iter()
            .map(|(id, entity)| (id.clone(), entity.clone()))
            .collect();

        self.store
            .write(&keys::cache(&self.workspace_id, NODES_RESOURCE), &snapshot)
            .await
    }

    fn lock_entities(&self) -> std::sync::MutexGuard<'_, HashMap<String, CachedEntity>> {
        self.entities.lock().unwrap_or_else(|e| e.into_inner())
    }
}

type FireFn = Box<dyn FnOnce() + Send>;

struct Pending {
    generation: u64,
    handle: JoinHandle<()>,
    fire: FireFn,
}

/// Per-key trailing-edge debounce.
///
/// Scheduling a key again restarts its window; only the last callback runs.
pub struct Debouncer {
    window: Duration,
    pending: Arc<Mutex<HashMap<String, Pending>>>,
    next_generation: AtomicU64,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn schedule<F>(&self, key: &str, fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let pending = self.pending.clone();
        let window = self.window;
        let timer_key = key.to_string();

        let mut slots = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slots.remove(key) {
            previous.handle.abort();
        }

        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let due = {
                let mut slots = pending.lock().unwrap_or_else(|e| e.into_inner());
                match slots.get(&timer_key) {
                    Some(slot) if slot.generation == generation => slots.remove(&timer_key),
                    _ => None,
                }
            };
            if let Some(slot) = due {
                (slot.fire)();
            }
        });

        slots.insert(
            key.to_string(),
            Pending {
                generation,
                handle,
                fire: Box::new(fire),
            },
        );
    }

    /// Run every pending callback immediately. Returns how many ran.
    pub fn flush(&self) -> usize {
        let due: Vec<Pending> = {
            let mut slots = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            slots.drain().map(|(_, slot)| slot).collect()
        };
        let count = due.len();
        for slot in due {
            slot.handle.abort();
            (slot.fire)();
        }
        count
    }

    /// Drop a pending callback without running it
    pub fn cancel(&self, key: &str) -> bool {
        let mut slots = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match slots.remove(key) {
            Some(slot) => {
                slot.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        let mut slots = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for (_, slot) in slots.drain() {
            slot.handle.abort();
        }
    }
}
