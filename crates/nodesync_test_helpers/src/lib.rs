//! Shared test utilities for nodesync test suites
//!
//! # Modules
//!
//! - [`workspace`]: Temp workspaces with a `.nodesync` directory
//! - [`cli`]: Command builders with pre-configured environments
//! - [`logging`]: Test logging configuration
//! - [`assertions`]: Domain-specific predicates
//!
//! # Example
//!
//! ```rust,no_run
//! use nodesync_test_helpers::prelude::*;
//!
//! let workspace = init_workspace();
//! nodesync_command()
//!     .current_dir(workspace.path())
//!     .arg("status")
//!     .assert()
//!     .success();
//! ```

pub mod assertions;
pub mod cli;
pub mod logging;
pub mod workspace;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::assertions::*;
    pub use crate::cli::nodesync_command;
    pub use crate::logging::init_test_logging;
    pub use crate::workspace::{
        init_workspace, queue_path, state_dir, temp_dir, workspace_with_queue,
    };
}
