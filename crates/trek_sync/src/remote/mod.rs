//! Remote document store seam
//!
//! The canonical store is a hierarchical document database addressed by
//! slash-separated paths (`trips/{id}`, `families/{id}/members/{userId}`).
//! Implementations report failures with a transport-level [`RemoteErrorCode`];
//! [`crate::client::RemoteSyncClient`] classifies them.

mod memory;

pub use memory::{MemoryRemoteStore, SERVER_TIMESTAMP_FIELD};

use crate::protocol::ChangeEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;

/// Schema-free remote payload; typed by [`crate::doc`]
pub type Document = serde_json::Map<String, Value>;

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Status codes reported by the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorCode {
    Unavailable,
    DeadlineExceeded,
    ResourceExhausted,
    Aborted,
    NotFound,
    PermissionDenied,
    Unauthenticated,
    InvalidArgument,
    DataLoss,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct RemoteError {
    pub code: RemoteErrorCode,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: RemoteErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(RemoteErrorCode::NotFound, format!("no document at {}", path))
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fresh document key for `collection`. Generated client-side; no
    /// network round trip.
    fn new_document_id(&self, _collection: &str) -> String {
        auto_id()
    }

    async fn get(&self, path: &str) -> RemoteResult<Option<Document>>;

    /// Upsert with merge semantics: fields absent from `doc` keep their
    /// stored values and fields set to null are deleted. Returns the server
    /// commit time.
    async fn set_merge(&self, path: &str, doc: Document) -> RemoteResult<DateTime<Utc>>;

    /// Fails with [`RemoteErrorCode::NotFound`] if nothing is stored at `path`
    async fn delete(&self, path: &str) -> RemoteResult<()>;

    /// Documents in `collection` whose `field` equals `value`
    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> RemoteResult<Vec<(String, Document)>>;

    async fn list(&self, collection: &str) -> RemoteResult<Vec<(String, Document)>>;

    /// Live change feed for `collection`. Existing documents are delivered
    /// first as `added` events. The feed ends when the receiver is dropped.
    async fn subscribe(&self, collection: &str)
        -> RemoteResult<mpsc::UnboundedReceiver<ChangeEvent>>;
}

/// 20-character document key
pub fn auto_id() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..20)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Split `a/b/c/d` into (`a/b/c`, `d`)
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((collection, id)) => (collection, id),
        None => ("", path),
    }
}
