//! Common types and errors for nodesync
//!
//! This crate provides the shared error type, exit codes and telemetry
//! setup used across all nodesync components.

pub mod telemetry;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core error types shared by the configuration and tooling crates
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Workspace not initialized: {0}")]
    NotInitialized(String),

    #[error("Invalid input: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Stable identity of one peer participating in a workspace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Stable peer id, generated once per installation
    pub peer_id: String,

    /// Human readable name shown to other peers
    pub display_name: String,
}

impl PeerIdentity {
    pub fn new(peer_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, NodeError>;

/// Directory (relative to the workspace root) holding nodesync state
pub const NODESYNC_DIR: &str = ".nodesync";

/// Exit code for any failed command
pub const EXIT_ERROR: i32 = 1;
