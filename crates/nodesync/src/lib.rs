//! # nodesync
//!
//! Offline-tolerant synchronization of workspace nodes across peers.
//!
//! ## Architecture
//!
//! - **Local store**: atomic, key-addressed JSON documents under a state directory
//! - **Offline queue**: FIFO mutation intents persisted to the local store, drained with bounded retry
//! - **Broadcaster**: per-workspace live-edit fan-out, best effort
//! - **Authority**: the system of record, reached through [`AuthoritativeStore`]
//! - **Engine**: version-based last-write-wins reconciliation plus debounced broadcasts
//! - **Presence**: heartbeat liveness with idle and TTL windows
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nodesync::{
//!     ChangeBroadcaster, InMemoryAuthority, LocalStore, PresenceTracker, SyncConfig,
//!     WorkspaceSession,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SyncConfig {
//!         workspace_id: "my-workspace".to_string(),
//!         peer_id: "peer-123".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let store = Arc::new(LocalStore::new(&config.state_dir));
//!     let broadcaster = Arc::new(ChangeBroadcaster::new(config.broadcast_capacity));
//!     let authority = Arc::new(InMemoryAuthority::new());
//!     let presence = Arc::new(PresenceTracker::from_config(&config));
//!
//!     let mut session =
//!         WorkspaceSession::open(config, store, broadcaster, authority, presence).await?;
//!     session.start().await?;
//!
//!     let report = session.sync_pending().await?;
//!     if report.failed > 0 {
//!         eprintln!("{} actions could not be synced", report.failed);
//!     }
//!     Ok(())
//! }
//! ```

pub mod authority;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod engine;
pub mod model;
pub mod offline;
pub mod presence;
pub mod protocol;
pub mod resolver;
pub mod session;
pub mod settings;
pub mod store;

pub use authority::{AuthoritativeStore, AuthorityError, AuthoritySubscriber, InMemoryAuthority};
pub use broadcast::{ChangeBroadcaster, ChangeStream, Subscription};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use engine::{ApplySource, SyncEngine};
pub use model::{EntityRecord, Fields, MutationIntent, MutationKind, PresenceRecord};
pub use offline::{DrainReport, HandlerError, OfflineQueue};
pub use presence::{PresenceEntry, PresenceTracker};
pub use protocol::{ChangeEvent, ChangeKind};
pub use resolver::{ApplyOutcome, CachedEntity, Resolution};
pub use session::WorkspaceSession;
pub use settings::LocalSettings;
pub use store::LocalStore;

/// Common result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur during sync operations
///
/// Stale events and malformed cache files are not errors: they are
/// discarded or treated as a cache miss and only logged at debug level.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Storage unavailable for {key}: {source}")]
    StorageUnavailable {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Authoritative store error: {0}")]
    Authority(#[from] AuthorityError),

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Workspace mismatch: expected {expected}, got {actual}")]
    WorkspaceMismatch { expected: String, actual: String },

    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),
}

impl SyncError {
    pub(crate) fn storage(key: impl Into<String>, source: std::io::Error) -> Self {
        SyncError::StorageUnavailable {
            key: key.into(),
            source,
        }
    }

    /// Whether the user should be told local state could not be saved
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, SyncError::StorageUnavailable { .. })
    }
}
