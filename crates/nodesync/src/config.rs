//! Configuration for one workspace session

use nodesync_common::PeerIdentity;
use nodesync_config::Config;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings of a [`WorkspaceSession`](crate::WorkspaceSession)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Workspace to join (scopes broadcasts, cache and presence)
    pub workspace_id: String,

    /// Stable id of this peer
    pub peer_id: String,

    /// Name shown to other peers
    pub display_name: String,

    /// Root of the local store
    pub state_dir: PathBuf,

    /// Attempts before a queued intent is dropped (default: 3)
    pub max_retries: u32,

    /// Broadcast debounce window (default: 120ms)
    pub debounce_ms: u64,

    /// Presence idle threshold (default: 30 seconds)
    pub idle_threshold_ms: u64,

    /// Presence expiry (default: 2 minutes)
    pub presence_ttl_ms: u64,

    /// Per-topic broadcast buffer
    pub broadcast_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workspace_id: String::new(),
            peer_id: String::new(),
            display_name: "nodesync peer".to_string(),
            state_dir: PathBuf::from(".nodesync/state"),
            max_retries: crate::offline::DEFAULT_MAX_RETRIES,
            debounce_ms: 120,
            idle_threshold_ms: 30_000,
            presence_ttl_ms: 120_000,
            broadcast_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Load config from TOML file
    pub fn from_toml(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Build from the workspace config file and a local identity
    pub fn from_config(config: &Config, workspace_id: &str, identity: &PeerIdentity) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            peer_id: identity.peer_id.clone(),
            display_name: identity.display_name.clone(),
            state_dir: config.state_dir(),
            max_retries: config.queue.max_retries,
            debounce_ms: config.sync.debounce_ms,
            idle_threshold_ms: config.presence.idle_threshold_ms,
            presence_ttl_ms: config.presence.ttl_ms,
            broadcast_capacity: config.sync.broadcast_capacity,
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity::new(self.peer_id.clone(), self.display_name.clone())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workspace_id.is_empty() {
            anyhow::bail!("workspace_id cannot be empty");
        }
        if self.peer_id.is_empty() {
            anyhow::bail!("peer_id cannot be empty");
        }
        if self.max_retries == 0 {
            anyhow::bail!("max_retries must be at least 1");
        }
        if self.presence_ttl_ms <= self.idle_threshold_ms {
            anyhow::bail!("presence_ttl_ms must exceed idle_threshold_ms");
        }
        Ok(())
    }
}
