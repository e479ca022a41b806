//! CLI command builders for tests

use assert_cmd::Command;

/// Get a Command for the `nodesync` binary with a clean environment
///
/// `RUST_LOG=error` keeps log lines out of asserted stderr.
#[allow(deprecated)]
pub fn nodesync_command() -> Command {
    let mut cmd = Command::cargo_bin("nodesync").expect("Failed to find nodesync binary");
    cmd.env("RUST_LOG", "error");
    cmd
}
