//! Workspace initialization utilities for tests

use assert_fs::TempDir;
use std::fs;
use std::path::{Path, PathBuf};

/// Create a temporary directory, removed on drop
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// State directory of a workspace created by [`init_workspace`]
pub fn state_dir(workspace: &Path) -> PathBuf {
    workspace.join(".nodesync").join("state")
}

/// Temp dir with an empty `.nodesync/state` directory
///
/// ```rust
/// use nodesync_test_helpers::workspace::init_workspace;
///
/// let workspace = init_workspace();
/// assert!(workspace.path().join(".nodesync/state").exists());
/// ```
pub fn init_workspace() -> TempDir {
    let temp = temp_dir();
    fs::create_dir_all(state_dir(temp.path())).expect("Failed to create .nodesync/state");
    temp
}

/// Path of the offline queue document of `workspace_id`
pub fn queue_path(workspace: &Path, workspace_id: &str) -> PathBuf {
    state_dir(workspace)
        .join("queue")
        .join(workspace_id)
        .join("pending_actions.json")
}

/// Workspace whose offline queue for `workspace_id` already holds `intents`
///
/// Each intent is a JSON object in the queue's on-disk shape. The
/// document is wrapped in the store's schema envelope.
pub fn workspace_with_queue(workspace_id: &str, intents: &[serde_json::Value]) -> TempDir {
    let workspace = init_workspace();
    let queue_path = queue_path(workspace.path(), workspace_id);
    fs::create_dir_all(queue_path.parent().expect("queue path has a parent"))
        .expect("Failed to create queue directory");

    let document = serde_json::json!({
        "schema_version": 1,
        "data": intents,
    });
    fs::write(
        &queue_path,
        serde_json::to_string_pretty(&document).expect("Failed to encode queue"),
    )
    .expect("Failed to write queue file");

    workspace
}
