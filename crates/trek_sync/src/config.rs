//! Configuration for sync engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the sync engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// File holding the durable pending-change log
    pub queue_path: PathBuf,

    /// SQLite file backing the local store
    pub database_path: PathBuf,

    /// Failed attempts after which an entity is marked `error` (default: 3)
    pub max_attempts: u32,

    /// Backoff after the first failure, doubled per attempt (default: 2 seconds)
    #[serde(with = "duration_ms")]
    pub backoff_base: Duration,

    /// Upper bound for any backoff (default: 5 minutes)
    #[serde(with = "duration_ms")]
    pub backoff_max: Duration,

    /// Extra factor applied to backoff after a quota error (default: 4)
    pub quota_backoff_multiplier: u32,

    /// Deadline on every remote call (default: 15 seconds)
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,

    /// Concurrent uploads across distinct entities (default: 4)
    pub max_concurrent_uploads: usize,

    /// Background retry sweep period (default: 30 seconds)
    #[serde(with = "duration_ms")]
    pub retry_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_path: PathBuf::from(".trek/sync/queue.json"),
            database_path: PathBuf::from(".trek/store.db"),
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(5 * 60),
            quota_backoff_multiplier: 4,
            request_timeout: Duration::from_secs(15),
            max_concurrent_uploads: 4,
            retry_interval: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Load config from TOML file
    pub fn from_toml(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }
        if self.max_concurrent_uploads == 0 {
            anyhow::bail!("max_concurrent_uploads must be at least 1");
        }
        if self.request_timeout.is_zero() {
            anyhow::bail!("request_timeout cannot be zero");
        }
        if self.backoff_base > self.backoff_max {
            anyhow::bail!("backoff_base cannot exceed backoff_max");
        }
        if self.quota_backoff_multiplier == 0 {
            anyhow::bail!("quota_backoff_multiplier must be at least 1");
        }
        if self.queue_path.as_os_str().is_empty() {
            anyhow::bail!("queue_path cannot be empty");
        }
        Ok(())
    }
}

/// Durations are written as integer milliseconds in TOML
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[test]
    fn test_default_config_is_valid() {
        SyncConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("sync.toml");
        file.write_str(
            r#"
max_attempts = 5
request_timeout = 2500
queue_path = "/tmp/trek-queue.json"
"#,
        )
        .unwrap();

        let config = SyncConfig::from_toml(file.path()).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.queue_path, PathBuf::from("/tmp/trek-queue.json"));
        assert_eq!(config.max_concurrent_uploads, 4);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = SyncConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SyncConfig {
            backoff_base: Duration::from_secs(600),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SyncConfig {
            max_concurrent_uploads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
