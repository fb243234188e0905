pub mod config;
pub mod pending;
pub mod queue;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use trek_sync::SyncConfig;

const DEFAULT_CONFIG_PATH: &str = ".trek/config.toml";

/// Resolve the sync config.
///
/// An explicit path must exist. Without one, `.trek/config.toml` is used
/// when present and the defaults otherwise.
pub fn load_config(explicit: Option<&Path>) -> Result<(SyncConfig, Option<PathBuf>)> {
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            Some(path.to_path_buf())
        }
        None => Some(PathBuf::from(DEFAULT_CONFIG_PATH)).filter(|p| p.exists()),
    };

    let config = match &path {
        Some(path) => SyncConfig::from_toml(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SyncConfig::default(),
    };
    config.validate()?;
    Ok((config, path))
}
