//! Per-device settings kept in the local store

use crate::presence::colour_for;
use crate::store::{keys, LocalStore};
use crate::Result;
use nodesync_common::PeerIdentity;
use serde::{Deserialize, Serialize};

/// Identity of this device, generated on first run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSettings {
    pub peer_id: String,
    pub display_name: String,
    pub colour: String,
}

impl LocalSettings {
    /// Load saved settings, or create and save new ones.
    ///
    /// A non-empty `display_name` overrides the saved one.
    pub async fn load_or_init(store: &LocalStore, display_name: &str) -> Result<Self> {
        if let Some(mut settings) = store.read::<LocalSettings>(keys::SETTINGS).await? {
            if !display_name.is_empty() && settings.display_name != display_name {
                settings.display_name = display_name.to_string();
                settings.save(store).await?;
            }
            return Ok(settings);
        }

        let peer_id = uuid::Uuid::new_v4().to_string();
        let settings = Self {
            colour: colour_for(&peer_id),
            display_name: if display_name.is_empty() {
                format!("peer-{}", &peer_id[..8])
            } else {
                display_name.to_string()
            },
            peer_id,
        };
        settings.save(store).await?;
        tracing::info!("Generated peer id {}", settings.peer_id);
        Ok(settings)
    }

    pub async fn save(&self, store: &LocalStore) -> Result<()> {
        store.write(keys::SETTINGS, self).await
    }

    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity::new(self.peer_id.clone(), self.display_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_run_generates_and_persists() {
        let dir = assert_fs::TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());

        let first = LocalSettings::load_or_init(&store, "").await.unwrap();
        assert!(first.display_name.starts_with("peer-"));
        assert!(dir.path().join("config/settings.json").exists());

        let again = LocalSettings::load_or_init(&store, "").await.unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_display_name_override_is_saved() {
        let dir = assert_fs::TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());

        let first = LocalSettings::load_or_init(&store, "Ada").await.unwrap();
        let renamed = LocalSettings::load_or_init(&store, "Grace").await.unwrap();
        assert_eq!(first.peer_id, renamed.peer_id);

        let reloaded = LocalSettings::load_or_init(&store, "").await.unwrap();
        assert_eq!(reloaded.display_name, "Grace");
        assert_eq!(reloaded.identity().peer_id, first.peer_id);
    }
}
