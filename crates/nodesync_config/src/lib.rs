//! Configuration management for nodesync
//!
//! This crate handles loading and validating `.nodesync/config.toml`

use nodesync_common::{NodeError, Result, NODESYNC_DIR};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the configuration inside the nodesync directory
pub const CONFIG_FILE: &str = "config.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Workspace root path (set programmatically, not in TOML)
    #[serde(skip)]
    pub root: PathBuf,

    /// Offline queue settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Broadcast and debounce settings
    #[serde(default)]
    pub sync: SyncSection,

    /// Presence settings
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Local store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Identity settings
    #[serde(default)]
    pub identity: IdentityConfig,
}

/// Queue configuration ([queue])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Attempts before an intent is dropped and counted as failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

/// Sync configuration ([sync])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    /// Quiet period before a burst of local edits is broadcast
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Events buffered per subscriber before it starts lagging
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

fn default_debounce_ms() -> u64 {
    120
}
fn default_broadcast_capacity() -> usize {
    256
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

/// Presence configuration ([presence])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,

    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
}

fn default_idle_threshold_ms() -> u64 {
    30_000
}
fn default_ttl_ms() -> u64 {
    120_000
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            idle_threshold_ms: default_idle_threshold_ms(),
            ttl_ms: default_ttl_ms(),
        }
    }
}

/// Store configuration ([store])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// State directory, relative to the workspace root unless absolute
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(NODESYNC_DIR).join("state")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

/// Identity configuration ([identity])
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IdentityConfig {
    #[serde(default)]
    pub display_name: String,
}

impl Config {
    /// Path of the config file for a workspace root
    pub fn path_for(workspace_root: &Path) -> PathBuf {
        workspace_root.join(NODESYNC_DIR).join(CONFIG_FILE)
    }

    /// Load configuration from workspace root
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let config_path = Self::path_for(workspace_root);

        if !config_path.exists() {
            tracing::debug!("No config at {:?}, using defaults", config_path);
            return Ok(Self {
                root: workspace_root.to_path_buf(),
                ..Default::default()
            });
        }

        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| NodeError::ConfigError(format!("Failed to read config: {}", e)))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| NodeError::ConfigError(format!("Failed to parse config: {}", e)))?;

        config.root = workspace_root.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration to `.nodesync/config.toml` under its root
    pub fn save(&self) -> Result<PathBuf> {
        let config_path = Self::path_for(&self.root);
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| NodeError::ConfigError(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    /// Reject values the sync core cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_retries == 0 {
            return Err(NodeError::ConfigError(
                "queue.max_retries must be at least 1".to_string(),
            ));
        }
        if self.sync.broadcast_capacity == 0 {
            return Err(NodeError::ConfigError(
                "sync.broadcast_capacity must be at least 1".to_string(),
            ));
        }
        if self.presence.ttl_ms <= self.presence.idle_threshold_ms {
            return Err(NodeError::ConfigError(format!(
                "presence.ttl_ms ({}) must exceed presence.idle_threshold_ms ({})",
                self.presence.ttl_ms, self.presence.idle_threshold_ms
            )));
        }
        Ok(())
    }

    /// Absolute state directory for this workspace
    pub fn state_dir(&self) -> PathBuf {
        if self.store.state_dir.is_absolute() {
            self.store.state_dir.clone()
        } else {
            self.root.join(&self.store.state_dir)
        }
    }
}
