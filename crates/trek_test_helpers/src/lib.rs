//! Shared test utilities for Trek test suites
//!
//! # Modules
//!
//! - [`workspace`]: Temporary `.trek` workspaces and config files
//! - [`cli`]: Command builders with pre-configured environments
//! - [`logging`]: Test logging configuration
//! - [`fixtures`]: Entity builders with deterministic timestamps
//! - [`assertions`]: Domain-specific assertion helpers
//!
//! # Example
//!
//! ```rust,no_run
//! use trek_test_helpers::prelude::*;
//!
//! let workspace = init_workspace();
//! trek_command()
//!     .current_dir(workspace.path())
//!     .args(["queue", "list"])
//!     .assert()
//!     .success();
//! ```

pub mod assertions;
pub mod cli;
pub mod fixtures;
pub mod logging;
pub mod workspace;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::assertions::*;
    pub use crate::cli::{command_for, trek_command};
    pub use crate::fixtures::*;
    pub use crate::logging::{init_test_logging, suppress_logs};
    pub use crate::workspace::{init_workspace, temp_dir, workspace_with_config, write_file};
}
