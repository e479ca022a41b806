//! Presence tracking
//!
//! Ephemeral per-workspace liveness. A peer is idle once its last
//! heartbeat is older than the idle threshold and disappears entirely
//! after the TTL. Nothing here is persisted.

use crate::clock::{system_clock, SharedClock};
use crate::config::SyncConfig;
use crate::model::PresenceRecord;
use nodesync_common::PeerIdentity;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;

/// A presence record with its idle flag at listing time
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub record: PresenceRecord,
    pub idle: bool,
}

/// True once `now - last_seen_at > threshold_ms`
pub fn is_idle(record: &PresenceRecord, now: i64, threshold_ms: u64) -> bool {
    silent_longer_than(record, now, threshold_ms)
}

fn is_expired(record: &PresenceRecord, now: i64, ttl_ms: u64) -> bool {
    silent_longer_than(record, now, ttl_ms)
}

fn silent_longer_than(record: &PresenceRecord, now: i64, limit_ms: u64) -> bool {
    let limit = i64::try_from(limit_ms).unwrap_or(i64::MAX);
    now.saturating_sub(record.last_seen_at) > limit
}

/// Stable `#rrggbb` colour for a peer
pub fn colour_for(peer_id: &str) -> String {
    let digest = Sha256::digest(peer_id.as_bytes());
    let hue = u16::from_be_bytes([digest[0], digest[1]]) % 360;
    let (r, g, b) = hsl_to_rgb(hue as f64, 0.65, 0.5);
    format!("#{:02x}{:02x}{:02x}", r, g, b)
}

fn hsl_to_rgb(hue: f64, saturation: f64, lightness: f64) -> (u8, u8, u8) {
    let chroma = (1.0 - (2.0 * lightness - 1.0).abs()) * saturation;
    let sector = hue / 60.0;
    let x = chroma * (1.0 - (sector % 2.0 - 1.0).abs());
    let (r, g, b) = match sector as u32 {
        0 => (chroma, x, 0.0),
        1 => (x, chroma, 0.0),
        2 => (0.0, chroma, x),
        3 => (0.0, x, chroma),
        4 => (x, 0.0, chroma),
        _ => (chroma, 0.0, x),
    };
    let m = lightness - chroma / 2.0;
    let channel = |value: f64| ((value + m) * 255.0).round() as u8;
    (channel(r), channel(g), channel(b))
}

/// Presence of every peer, keyed by workspace then peer id
pub struct PresenceTracker {
    workspaces: RwLock<HashMap<String, HashMap<String, PresenceRecord>>>,
    clock: SharedClock,
    idle_threshold_ms: u64,
    ttl_ms: u64,
}

impl PresenceTracker {
    pub fn new(clock: SharedClock, idle_threshold_ms: u64, ttl_ms: u64) -> Self {
        Self {
            workspaces: RwLock::new(HashMap::new()),
            clock,
            idle_threshold_ms,
            ttl_ms,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            system_clock(),
            config.idle_threshold_ms,
            config.presence_ttl_ms,
        )
    }

    /// Announce a peer, replacing any earlier record
    pub fn connect(
        &self,
        workspace_id: &str,
        identity: &PeerIdentity,
        location: Option<String>,
    ) -> PresenceRecord {
        let record = PresenceRecord {
            peer_id: identity.peer_id.clone(),
            display_name: identity.display_name.clone(),
            colour: colour_for(&identity.peer_id),
            location,
            last_seen_at: self.clock.now_ms(),
        };

        let mut workspaces = self.workspaces.write().unwrap_or_else(|e| e.into_inner());
        workspaces
            .entry(workspace_id.to_string())
            .or_default()
            .insert(record.peer_id.clone(), record.clone());
        tracing::debug!("Peer {} joined {}", record.peer_id, workspace_id);
        record
    }

    /// Refresh a peer's `last_seen_at`, and its location when given.
    ///
    /// Returns false when the peer had no live record; one is created
    /// with the peer id as its display name.
    pub fn heartbeat(&self, workspace_id: &str, peer_id: &str, location: Option<String>) -> bool {
        let now = self.clock.now_ms();
        let mut workspaces = self.workspaces.write().unwrap_or_else(|e| e.into_inner());
        let peers = workspaces.entry(workspace_id.to_string()).or_default();

        match peers.get_mut(peer_id) {
            Some(record) if !is_expired(record, now, self.ttl_ms) => {
                record.last_seen_at = now;
                if location.is_some() {
                    record.location = location;
                }
                true
            }
            _ => {
                peers.insert(
                    peer_id.to_string(),
                    PresenceRecord {
                        peer_id: peer_id.to_string(),
                        display_name: peer_id.to_string(),
                        colour: colour_for(peer_id),
                        location,
                        last_seen_at: now,
                    },
                );
                false
            }
        }
    }

    /// Remove a peer. Returns true if it was present.
    pub fn disconnect(&self, workspace_id: &str, peer_id: &str) -> bool {
        let mut workspaces = self.workspaces.write().unwrap_or_else(|e| e.into_inner());
        let removed = workspaces
            .get_mut(workspace_id)
            .and_then(|peers| peers.remove(peer_id))
            .is_some();
        if removed {
            tracing::debug!("Peer {} left {}", peer_id, workspace_id);
        }
        removed
    }

    /// Non-expired records of a workspace, sorted by peer id
    pub fn list(&self, workspace_id: &str) -> Vec<PresenceRecord> {
        self.list_with_status(workspace_id)
            .into_iter()
            .map(|entry| entry.record)
            .collect()
    }

    /// Like [`list`](Self::list) with each record's idle flag
    pub fn list_with_status(&self, workspace_id: &str) -> Vec<PresenceEntry> {
        let now = self.clock.now_ms();
        let mut workspaces = self.workspaces.write().unwrap_or_else(|e| e.into_inner());
        let Some(peers) = workspaces.get_mut(workspace_id) else {
            return Vec::new();
        };

        peers.retain(|_, record| !is_expired(record, now, self.ttl_ms));
        let mut entries: Vec<PresenceEntry> = peers
            .values()
            .map(|record| PresenceEntry {
                idle: is_idle(record, now, self.idle_threshold_ms),
                record: record.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.record.peer_id.cmp(&b.record.peer_id));
        entries
    }

    /// `None` if the peer has no live record
    pub fn is_idle(&self, workspace_id: &str, peer_id: &str) -> Option<bool> {
        let now = self.clock.now_ms();
        let workspaces = self.workspaces.read().unwrap_or_else(|e| e.into_inner());
        workspaces
            .get(workspace_id)
            .and_then(|peers| peers.get(peer_id))
            .filter(|record| !is_expired(record, now, self.ttl_ms))
            .map(|record| is_idle(record, now, self.idle_threshold_ms))
    }

    /// Drop expired records in every workspace. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut workspaces = self.workspaces.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for peers in workspaces.values_mut() {
            let before = peers.len();
            peers.retain(|_, record| !is_expired(record, now, self.ttl_ms));
            removed += before - peers.len();
        }
        workspaces.retain(|_, peers| !peers.is_empty());
        removed
    }

    pub fn idle_threshold_ms(&self) -> u64 {
        self.idle_threshold_ms
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn tracker() -> (Arc<ManualClock>, PresenceTracker) {
        let clock = Arc::new(ManualClock::new(0));
        let tracker = PresenceTracker::new(clock.clone(), 30_000, 120_000);
        (clock, tracker)
    }

    #[test]
    fn test_idle_then_expired() {
        let (clock, tracker) = tracker();
        tracker.heartbeat("ws", "P", None);

        clock.set(31_000);
        assert_eq!(tracker.is_idle("ws", "P"), Some(true));
        let listed = tracker.list_with_status("ws");
        assert_eq!(listed.len(), 1);
        assert!(listed[0].idle);

        clock.set(121_000);
        assert!(tracker.list("ws").is_empty());
        assert_eq!(tracker.is_idle("ws", "P"), None);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let (clock, tracker) = tracker();
        tracker.heartbeat("ws", "P", None);

        clock.set(30_000);
        assert_eq!(tracker.is_idle("ws", "P"), Some(false));
        clock.set(120_000);
        assert_eq!(tracker.list("ws").len(), 1);
    }

    #[test]
    fn test_huge_thresholds_never_trip() {
        let clock = Arc::new(ManualClock::new(0));
        let tracker = PresenceTracker::new(clock.clone(), u64::MAX - 1, u64::MAX);
        tracker.heartbeat("ws", "P", None);

        clock.set(i64::MAX);
        assert_eq!(tracker.is_idle("ws", "P"), Some(false));
        assert_eq!(tracker.list("ws").len(), 1);
    }

    #[test]
    fn test_heartbeat_refreshes_and_updates_location() {
        let (clock, tracker) = tracker();
        tracker.connect("ws", &PeerIdentity::new("P", "Pat"), Some("n1".to_string()));

        clock.set(25_000);
        assert!(tracker.heartbeat("ws", "P", Some("n2".to_string())));
        clock.set(50_000);
        assert!(tracker.heartbeat("ws", "P", None));

        clock.set(70_000);
        let record = &tracker.list("ws")[0];
        assert_eq!(record.display_name, "Pat");
        assert_eq!(record.location.as_deref(), Some("n2"));
        assert_eq!(record.last_seen_at, 50_000);
        assert_eq!(tracker.is_idle("ws", "P"), Some(false));
    }

    #[test]
    fn test_heartbeat_after_expiry_rejoins() {
        let (clock, tracker) = tracker();
        tracker.connect("ws", &PeerIdentity::new("P", "Pat"), None);

        clock.set(200_000);
        assert!(!tracker.heartbeat("ws", "P", None));
        assert_eq!(tracker.list("ws")[0].display_name, "P");
    }

    #[test]
    fn test_workspaces_do_not_share_presence() {
        let (_, tracker) = tracker();
        tracker.heartbeat("ws-a", "P", None);
        tracker.heartbeat("ws-b", "Q", None);

        let a: Vec<String> = tracker.list("ws-a").into_iter().map(|r| r.peer_id).collect();
        assert_eq!(a, vec!["P"]);
        assert!(tracker.disconnect("ws-b", "Q"));
        assert!(tracker.list("ws-b").is_empty());
        assert!(!tracker.disconnect("ws-b", "Q"));
    }

    #[test]
    fn test_purge_expired() {
        let (clock, tracker) = tracker();
        tracker.heartbeat("ws", "old", None);
        clock.set(100_000);
        tracker.heartbeat("ws", "new", None);

        clock.set(130_000);
        assert_eq!(tracker.purge_expired(), 1);
        assert_eq!(tracker.list("ws").len(), 1);
    }

    #[test]
    fn test_colour_is_stable_hex() {
        let colour = colour_for("peer-1");
        assert_eq!(colour, colour_for("peer-1"));
        assert_eq!(colour.len(), 7);
        assert!(colour.starts_with('#'));
        assert!(colour[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
