//! Per-workspace change fan-out.
//!
//! One `tokio::sync::broadcast` channel per workspace topic. Publishing never
//! blocks and never fails: with no subscribers the event is simply dropped.
//! A subscriber that falls more than `capacity` events behind skips the
//! missed events, so delivery is at most once and callers must reconcile
//! against the authoritative store to recover.

use crate::protocol::{topic_for, ChangeEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Snapshot of broadcaster counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub published: u64,
    pub delivered: u64,
    pub lagged: u64,
    pub topics: usize,
}

#[derive(Default)]
struct AtomicStats {
    published: AtomicU64,
    delivered: AtomicU64,
    lagged: AtomicU64,
}

/// Topic hub shared by every peer attached to it
pub struct ChangeBroadcaster {
    topics: RwLock<HashMap<String, broadcast::Sender<Arc<ChangeEvent>>>>,
    capacity: usize,
    stats: Arc<AtomicStats>,
}

impl ChangeBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: Arc::new(AtomicStats::default()),
        }
    }

    /// Fire-and-forget publish. Returns how many subscribers were reached.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        let topic = event.topic();

        let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = topics.get(&topic) else {
            tracing::trace!("No subscribers on {}, dropping event", topic);
            return 0;
        };

        sender.send(Arc::new(event)).unwrap_or(0)
    }

    /// Receive every event of a workspace, including one's own
    pub fn stream(&self, workspace_id: &str) -> ChangeStream {
        ChangeStream {
            receiver: self.sender_for(workspace_id).subscribe(),
            exclude_peer: None,
            stats: self.stats.clone(),
        }
    }

    /// Receive a workspace's events except those published by `peer_id`
    pub fn stream_excluding(&self, workspace_id: &str, peer_id: &str) -> ChangeStream {
        ChangeStream {
            exclude_peer: Some(peer_id.to_string()),
            ..self.stream(workspace_id)
        }
    }

    /// Invoke `callback` for each event of a workspace until unsubscribed
    pub fn subscribe<F>(&self, workspace_id: &str, callback: F) -> Subscription
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        Subscription::spawn(self.stream(workspace_id), callback)
    }

    /// Like [`subscribe`](Self::subscribe) with the peer's own events filtered out
    pub fn subscribe_excluding<F>(&self, workspace_id: &str, peer_id: &str, callback: F) -> Subscription
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        Subscription::spawn(self.stream_excluding(workspace_id, peer_id), callback)
    }

    /// Live receivers on a workspace topic
    pub fn subscriber_count(&self, workspace_id: &str) -> usize {
        let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
        topics
            .get(&topic_for(workspace_id))
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Drop a topic nobody listens to. Returns true if removed.
    pub fn remove_if_idle(&self, workspace_id: &str) -> bool {
        let topic = topic_for(workspace_id);
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        match topics.get(&topic) {
            Some(sender) if sender.receiver_count() == 0 => {
                topics.remove(&topic);
                true
            }
            _ => false,
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
        BroadcastStats {
            published: self.stats.published.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            lagged: self.stats.lagged.load(Ordering::Relaxed),
            topics: topics.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn sender_for(&self, workspace_id: &str) -> broadcast::Sender<Arc<ChangeEvent>> {
        let topic = topic_for(workspace_id);
        {
            let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
            if let Some(sender) = topics.get(&topic) {
                return sender.clone();
            }
        }

        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for ChangeBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Async receiver for one workspace topic
pub struct ChangeStream {
    receiver: broadcast::Receiver<Arc<ChangeEvent>>,
    exclude_peer: Option<String>,
    stats: Arc<AtomicStats>,
}

impl ChangeStream {
    /// Next event, or `None` once the topic is gone
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.exclude_peer.as_deref() == Some(event.peer_id.as_str()) {
                        continue;
                    }
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    return Some((*event).clone());
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Subscriber lagged, {} events skipped", skipped);
                    self.stats.lagged.fetch_add(skipped, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Handle to a callback subscription. Dropping it unsubscribes.
pub struct Subscription {
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    fn spawn<F>(mut stream: ChangeStream, mut callback: F) -> Self
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                callback(event);
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Stop delivery to this subscription
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    pub fn is_active(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}
