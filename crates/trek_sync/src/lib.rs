//! # Trek Sync Engine
//!
//! Offline-first synchronization between the on-device store and the remote
//! document store for trips, families, memberships, games and competitions.
//!
//! ## Architecture
//!
//! - **Network monitor**: event-driven online/offline signal; reconnect drains the queue
//! - **Offline queue**: durable, coalescing log of pending changes (one entry per entity)
//! - **Remote client**: typed document translation, idempotent upsert/delete/fetch
//! - **Conflict resolver**: entity-level last-write-wins plus union merge of found regions
//! - **Listeners**: realtime member feeds for the active family
//! - **Engine**: per-entity status, upload/download/merge sequencing, retry with backoff
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trek_sync::{
//!     MemoryRemoteStore, NetworkMonitor, SqliteStore, StaticSession, SyncConfig, SyncContext,
//!     SyncEngine,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SyncConfig::default();
//!     let context = SyncContext {
//!         store: Arc::new(SqliteStore::open(&config.database_path)?),
//!         remote: Arc::new(MemoryRemoteStore::new()),
//!         session: Arc::new(StaticSession::durable("user-123")),
//!         network: Arc::new(NetworkMonitor::new(true)),
//!         clock: Arc::new(trek_common::Clock::new()),
//!     };
//!
//!     let engine = SyncEngine::new(config, context).await?;
//!     engine.start();
//!     engine.sync_all().await?;
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod doc;
pub mod engine;
pub mod gate;
pub mod listener;
pub mod network;
pub mod offline;
pub mod protocol;
pub mod remote;
pub mod resolver;
pub mod session;
pub mod store;

pub use backoff::RetryPolicy;
pub use client::{RemoteSyncClient, UploadReceipt};
pub use config::SyncConfig;
pub use engine::{SyncContext, SyncEngine, SyncReport, SyncSnapshot};
pub use gate::EntityLocks;
pub use listener::{ListenerHandle, ListenerManager};
pub use network::NetworkMonitor;
pub use offline::{OfflineQueue, QueueEntry};
pub use protocol::{ChangeEvent, ChangeKind};
pub use remote::{Document, MemoryRemoteStore, RemoteError, RemoteErrorCode, RemoteStore};
pub use resolver::{merge_found_regions, ConflictResolver, Resolution};
pub use session::{SessionProvider, StaticSession};
pub use store::{LocalStore, MemoryStore, SqliteStore};

use std::time::Duration;
use trek_common::CommonError;

/// Common result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur during sync operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote call exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("Quota exceeded: {0}")]
    Quota(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not authorized: {0}")]
    Auth(String),

    #[error("Malformed data: {0}")]
    Data(String),

    #[error("Parent family {family_id} has not been synced yet")]
    ParentNotSynced { family_id: String },

    #[error("Connectivity lost before the remote acknowledged")]
    Offline,

    #[error("Local store error: {0}")]
    Store(String),

    #[error("Model error: {0}")]
    Model(#[from] CommonError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),
}

impl SyncError {
    /// Failures worth another attempt later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_)
                | SyncError::Timeout(_)
                | SyncError::Quota(_)
                | SyncError::ParentNotSynced { .. }
                | SyncError::Offline
        )
    }

    /// Failures that mark the entity `error` with no automatic retry
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable() && !self.is_auth() && !self.is_not_found()
    }

    /// Failures that disable sync until the user signs in again
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, SyncError::Quota(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Store(e.to_string())
    }
}
