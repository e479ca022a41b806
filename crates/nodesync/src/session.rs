//! Per-workspace sync session
//!
//! A session bundles the engine of one workspace with its broadcast
//! listener, authoritative feed and presence. Several sessions can run
//! side by side in one process: each has its own store root and only
//! sees its own workspace topic.

use crate::authority::{AuthoritativeStore, AuthoritySubscriber};
use crate::broadcast::{ChangeBroadcaster, Subscription};
use crate::clock::{system_clock, SharedClock};
use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::model::{EntityRecord, Fields, MutationIntent, PresenceRecord};
use crate::offline::{DrainReport, HandlerError, OfflineQueue};
use crate::presence::{PresenceEntry, PresenceTracker};
use crate::protocol::ChangeEvent;
use crate::store::LocalStore;
use crate::{Result, SyncError};
use nodesync_common::PeerIdentity;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// One peer's connection to one workspace
pub struct WorkspaceSession {
    config: SyncConfig,
    identity: PeerIdentity,
    engine: Arc<SyncEngine>,
    broadcaster: Arc<ChangeBroadcaster>,
    authority: Arc<dyn AuthoritativeStore>,
    presence: Arc<PresenceTracker>,
    listener: Option<JoinHandle<()>>,
    subscriber: Option<AuthoritySubscriber>,
}

impl WorkspaceSession {
    /// Open the session's queue and cache. Nothing is started yet.
    pub async fn open(
        config: SyncConfig,
        store: Arc<LocalStore>,
        broadcaster: Arc<ChangeBroadcaster>,
        authority: Arc<dyn AuthoritativeStore>,
        presence: Arc<PresenceTracker>,
    ) -> Result<Self> {
        Self::open_with_clock(config, store, broadcaster, authority, presence, system_clock())
            .await
    }

    pub async fn open_with_clock(
        config: SyncConfig,
        store: Arc<LocalStore>,
        broadcaster: Arc<ChangeBroadcaster>,
        authority: Arc<dyn AuthoritativeStore>,
        presence: Arc<PresenceTracker>,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(
            OfflineQueue::open_with_clock(
                store.clone(),
                &config.workspace_id,
                config.max_retries,
                clock.clone(),
            )
            .await?,
        );
        let engine = Arc::new(
            SyncEngine::open(&config, store, queue, broadcaster.clone(), clock).await?,
        );

        Ok(Self {
            identity: config.identity(),
            config,
            engine,
            broadcaster,
            authority,
            presence,
            listener: None,
            subscriber: None,
        })
    }

    /// Start listening, announce presence and catch up with the authority.
    ///
    /// An unreachable authority is not an error: the session keeps working
    /// offline and catches up on the next reconnect.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let mut stream = self
            .broadcaster
            .stream_excluding(&self.config.workspace_id, &self.identity.peer_id);
        let engine = self.engine.clone();
        self.listener = Some(tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                if let Err(e) = engine.apply_broadcast(event).await {
                    tracing::error!("Failed to apply broadcast: {}", e);
                }
            }
        }));
        self.subscriber = Some(AuthoritySubscriber::spawn(
            self.authority.clone(),
            self.engine.clone(),
        ));

        self.presence
            .connect(&self.config.workspace_id, &self.identity, None);

        match self.engine.reconcile(self.authority.as_ref()).await {
            Ok(_) => {}
            Err(SyncError::Authority(e)) => {
                tracing::warn!("Authoritative store unreachable, working offline: {}", e);
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            "Session started: peer {} in workspace {}",
            self.identity.peer_id,
            self.config.workspace_id
        );
        Ok(())
    }

    /// Stop receiving events and leave presence. Local edits keep queueing.
    pub fn disconnect(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if let Some(subscriber) = self.subscriber.take() {
            subscriber.stop();
        }
        self.presence
            .disconnect(&self.config.workspace_id, &self.identity.peer_id);
        tracing::info!("Session disconnected from {}", self.config.workspace_id);
    }

    /// Restart after [`disconnect`](Self::disconnect) and push queued work
    pub async fn reconnect(&mut self) -> Result<DrainReport> {
        self.start().await?;
        self.sync_pending().await
    }

    /// Publish pending broadcasts, then disconnect
    pub fn shutdown(mut self) {
        self.engine.flush_broadcasts();
        self.disconnect();
    }

    pub fn is_running(&self) -> bool {
        self.listener
            .as_ref()
            .map(|listener| !listener.is_finished())
            .unwrap_or(false)
    }

    //
    // Queue
    //

    /// Queue a raw intent for this workspace. Returns its id.
    pub async fn enqueue_mutation(&self, intent: MutationIntent) -> Result<String> {
        self.check_workspace(&intent.workspace_id)?;
        self.engine.queue().enqueue(intent).await
    }

    /// Drain the queue through a caller-supplied handler.
    ///
    /// Nodes whose intents are dropped roll back to their confirmed state.
    pub async fn drain_queue<H, Fut, P>(&self, handler: H, on_progress: P) -> Result<DrainReport>
    where
        H: FnMut(MutationIntent) -> Fut,
        Fut: Future<Output = std::result::Result<(), HandlerError>>,
        P: FnMut(usize, usize),
    {
        let report = self
            .engine
            .queue()
            .drain_with_progress(handler, on_progress)
            .await?;
        self.engine.roll_back_dropped(&report).await?;
        Ok(report)
    }

    /// Drain the queue against the authoritative store
    pub async fn sync_pending(&self) -> Result<DrainReport> {
        let report = self.engine.sync_pending(self.authority.as_ref()).await?;
        if report.failed > 0 {
            tracing::warn!("{} actions could not be synced", report.failed);
        }
        Ok(report)
    }

    pub async fn sync_pending_with_progress<P>(&self, on_progress: P) -> Result<DrainReport>
    where
        P: FnMut(usize, usize),
    {
        self.engine
            .sync_pending_with_progress(self.authority.as_ref(), on_progress)
            .await
    }

    pub fn cancel_drain(&self) {
        self.engine.queue().cancel_drain();
    }

    //
    // Changes
    //

    /// Observe every change broadcast in this workspace
    pub fn subscribe_to_changes<F>(&self, on_event: F) -> Subscription
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        self.broadcaster
            .subscribe(&self.config.workspace_id, on_event)
    }

    /// Publish an event on this workspace's topic. Returns subscribers reached.
    pub fn publish_change(&self, event: ChangeEvent) -> Result<usize> {
        self.check_workspace(&event.workspace_id)?;
        Ok(self.broadcaster.publish(event))
    }

    pub async fn create_node(&self, fields: Fields) -> Result<String> {
        self.engine.create_local(fields).await
    }

    pub async fn update_node(&self, entity_id: &str, fields: Fields) -> Result<()> {
        self.engine.update_local(entity_id, fields).await
    }

    pub async fn delete_node(&self, entity_id: &str) -> Result<()> {
        self.engine.delete_local(entity_id).await
    }

    pub fn node(&self, entity_id: &str) -> Option<EntityRecord> {
        self.engine.get(entity_id)
    }

    pub fn nodes(&self) -> Vec<EntityRecord> {
        self.engine.records()
    }

    //
    // Presence
    //

    /// Refresh this peer's presence, rejoining if it had expired
    pub fn heartbeat_presence(&self, location: Option<String>) {
        let workspace_id = &self.config.workspace_id;
        if !self
            .presence
            .heartbeat(workspace_id, &self.identity.peer_id, location.clone())
        {
            self.presence.connect(workspace_id, &self.identity, location);
        }
    }

    pub fn list_presence(&self) -> Vec<PresenceRecord> {
        self.presence.list(&self.config.workspace_id)
    }

    pub fn list_presence_with_status(&self) -> Vec<PresenceEntry> {
        self.presence.list_with_status(&self.config.workspace_id)
    }

    //
    // Accessors
    //

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    fn check_workspace(&self, workspace_id: &str) -> Result<()> {
        if workspace_id != self.config.workspace_id {
            return Err(SyncError::WorkspaceMismatch {
                expected: self.config.workspace_id.clone(),
                actual: workspace_id.to_string(),
            });
        }
        Ok(())
    }
}

impl Drop for WorkspaceSession {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}
