//! Workspace initialization utilities for tests

use assert_fs::TempDir;
use std::fs;
use std::path::{Path, PathBuf};

/// Create a temporary directory, removed on drop
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// Initialize a Trek workspace in a temp directory
///
/// Creates `.trek/` and `.trek/sync/`, matching the default config paths.
///
/// ```rust
/// use trek_test_helpers::workspace::init_workspace;
///
/// let workspace = init_workspace();
/// assert!(workspace.path().join(".trek/sync").exists());
/// ```
pub fn init_workspace() -> TempDir {
    let temp = temp_dir();
    fs::create_dir_all(temp.path().join(".trek").join("sync"))
        .expect("Failed to create .trek directory");
    temp
}

/// Workspace with `.trek/config.toml` holding `config`
pub fn workspace_with_config(config: &str) -> TempDir {
    let workspace = init_workspace();
    write_file(workspace.path(), ".trek/config.toml", config);
    workspace
}

/// Write `content` to `relative` under `root`, creating parent directories
pub fn write_file(root: &Path, relative: &str, content: &str) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent directory");
    }
    fs::write(&path, content).expect("Failed to write file");
    path
}
