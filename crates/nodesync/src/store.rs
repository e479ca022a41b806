//! Durable local store
//!
//! Key-addressed JSON documents under a state directory. Every value is
//! wrapped in a schema envelope. Writes land in a temporary sibling file
//! which is synced and then renamed over the target, so a reader sees
//! either the previous value or the new one.

use crate::{Result, SyncError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Schema version written into every envelope
pub const SCHEMA_VERSION: u32 = 1;

const KEY_SUFFIX: &str = ".json";
const TMP_SUFFIX: &str = ".tmp";

/// Namespaced keys of the persisted layout
pub mod keys {
    /// Prefix of every workspace's offline queue
    pub const QUEUE_PREFIX: &str = "queue/";

    const QUEUE_DOCUMENT: &str = "pending_actions.json";

    /// Local settings (peer identity)
    pub const SETTINGS: &str = "config/settings.json";

    /// Cached resource of one workspace
    pub fn cache(workspace_id: &str, resource: &str) -> String {
        format!("cache/{}/{}.json", workspace_id, resource)
    }

    /// Prefix of every cached resource of one workspace
    pub fn cache_prefix(workspace_id: &str) -> String {
        format!("cache/{}/", workspace_id)
    }

    /// Offline action queue of one workspace
    pub fn queue(workspace_id: &str) -> String {
        format!("{}{}/{}", QUEUE_PREFIX, workspace_id, QUEUE_DOCUMENT)
    }

    /// Workspace id of a key produced by [`queue`]
    pub fn queue_workspace(key: &str) -> Option<&str> {
        key.strip_prefix(QUEUE_PREFIX)?
            .strip_suffix(QUEUE_DOCUMENT)?
            .strip_suffix('/')
            .filter(|workspace| !workspace.is_empty() && !workspace.contains('/'))
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    schema_version: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    schema_version: u32,
    data: T,
}

/// JSON document store rooted at one directory
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Store rooted at `root`. Directories are created on first write.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read the value stored under `key`.
    ///
    /// Missing, unparsable or foreign-schema documents all read as `None`.
    pub async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.path_for(key)?;

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                tracing::error!("Failed to read {}: {}", key, e);
                return Err(SyncError::storage(key, e));
            }
        };

        match serde_json::from_slice::<Envelope<T>>(&bytes) {
            Ok(envelope) if envelope.schema_version == SCHEMA_VERSION => Ok(Some(envelope.data)),
            Ok(envelope) => {
                tracing::debug!(
                    "Ignoring {} with schema version {} (expected {})",
                    key,
                    envelope.schema_version,
                    SCHEMA_VERSION
                );
                Ok(None)
            }
            Err(e) => {
                tracing::debug!("Malformed document at {}, treating as miss: {}", key, e);
                Ok(None)
            }
        }
    }

    /// Atomically replace the value stored under `key`
    pub async fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let path = self.path_for(key)?;
        let bytes = serde_json::to_vec_pretty(&EnvelopeRef {
            schema_version: SCHEMA_VERSION,
            data: value,
        })?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::storage(key, e))?;
        }

        let tmp_path = tmp_path_for(&path);
        let result: std::io::Result<()> = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &path).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            tracing::error!("Failed to write {}: {}", key, e);
            return Err(SyncError::storage(key, e));
        }

        tracing::trace!("Wrote {} ({} bytes)", key, bytes.len());
        Ok(())
    }

    /// All keys starting with `prefix`, sorted
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(SyncError::storage(prefix, e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| SyncError::storage(prefix, e))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| SyncError::storage(prefix, e))?;
                let path = entry.path();

                if file_type.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.key_for(&path) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    /// Remove `key`. Returns false if nothing was stored.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SyncError::storage(key, e)),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        let mut path = self.root.clone();
        for segment in key.split('/') {
            path.push(segment);
        }
        Ok(path)
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let segments: Vec<&str> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        let key = segments.join("/");
        key.ends_with(KEY_SUFFIX).then_some(key)
    }
}

fn validate_key(key: &str) -> Result<()> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || !key.ends_with(KEY_SUFFIX)
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");

    if invalid {
        return Err(SyncError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{}.{}{}",
        file_name,
        uuid::Uuid::new_v4().simple(),
        TMP_SUFFIX
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_write_then_read() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = LocalStore::new(temp.path());

        let value = json!({"nodes": [{"id": "a", "x": 1}], "label": "board"});
        store.write("cache/ws-1/nodes.json", &value).await.unwrap();

        let read: Option<serde_json::Value> = store.read("cache/ws-1/nodes.json").await.unwrap();
        assert_eq!(read, Some(value));
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = LocalStore::new(temp.path());

        let read: Option<u32> = store.read(keys::SETTINGS).await.unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_document_is_miss() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = LocalStore::new(temp.path());
        std::fs::create_dir_all(temp.path().join("queue/ws")).unwrap();
        std::fs::write(temp.path().join("queue/ws/pending_actions.json"), b"[{\"id\": ").unwrap();

        let read: Option<Vec<serde_json::Value>> = store.read(&keys::queue("ws")).await.unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn test_unknown_schema_version_is_miss() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = LocalStore::new(temp.path());
        std::fs::create_dir_all(temp.path().join("config")).unwrap();
        std::fs::write(
            temp.path().join("config/settings.json"),
            br#"{"schema_version": 99, "data": {"peer_id": "p"}}"#,
        )
        .unwrap();

        let read: Option<serde_json::Value> = store.read(keys::SETTINGS).await.unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn test_wrong_shape_is_miss() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = LocalStore::new(temp.path());
        store.write("cache/ws/nodes.json", &"a string").await.unwrap();

        let read: Option<Vec<u64>> = store.read("cache/ws/nodes.json").await.unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_files() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = LocalStore::new(temp.path());

        for i in 0..5 {
            store.write(&keys::queue("ws"), &vec![i; 3]).await.unwrap();
        }

        let names: Vec<String> = std::fs::read_dir(temp.path().join("queue/ws"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["pending_actions.json".to_string()]);

        let read: Option<Vec<i32>> = store.read(&keys::queue("ws")).await.unwrap();
        assert_eq!(read, Some(vec![4, 4, 4]));
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = LocalStore::new(temp.path());

        store.write(&keys::cache("ws-b", "nodes"), &1).await.unwrap();
        store.write(&keys::cache("ws-a", "nodes"), &1).await.unwrap();
        store.write(&keys::cache("ws-a", "edges"), &1).await.unwrap();
        store.write(&keys::queue("ws-a"), &Vec::<u8>::new()).await.unwrap();
        std::fs::write(temp.path().join("cache/ws-a/notes.txt"), b"ignored").unwrap();

        let listed = store.list(&keys::cache_prefix("ws-a")).await.unwrap();
        assert_eq!(
            listed,
            vec!["cache/ws-a/edges.json".to_string(), "cache/ws-a/nodes.json".to_string()]
        );

        let all = store.list("").await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_queue_keys_round_trip_workspace() {
        assert_eq!(keys::queue("ws-a"), "queue/ws-a/pending_actions.json");
        assert_eq!(keys::queue_workspace(&keys::queue("ws-a")), Some("ws-a"));
        assert_eq!(keys::queue_workspace("queue/pending_actions.json"), None);
        assert_eq!(keys::queue_workspace("queue/a/b/pending_actions.json"), None);
        assert_eq!(keys::queue_workspace("cache/ws-a/nodes.json"), None);
    }

    #[tokio::test]
    async fn test_list_on_empty_root() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = LocalStore::new(temp.path().join("never-created"));
        assert!(store.list("cache/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = LocalStore::new(temp.path());
        store.write(keys::SETTINGS, &json!({"a": 1})).await.unwrap();

        assert!(store.delete(keys::SETTINGS).await.unwrap());
        assert!(!store.delete(keys::SETTINGS).await.unwrap());
        let read: Option<serde_json::Value> = store.read(keys::SETTINGS).await.unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = LocalStore::new(temp.path());

        for key in ["", "/etc/passwd.json", "cache/../x.json", "cache//x.json", "cache/x.txt"] {
            let result = store.write(key, &1).await;
            assert!(matches!(result, Err(SyncError::InvalidKey(_))), "key {:?}", key);
        }
    }

    #[tokio::test]
    async fn test_io_failure_is_storage_unavailable() {
        let temp = assert_fs::TempDir::new().unwrap();
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, b"file, not a directory").unwrap();
        let store = LocalStore::new(&blocker);

        let err = store.write(keys::SETTINGS, &1).await.unwrap_err();
        assert!(err.is_storage_unavailable());
    }
}
