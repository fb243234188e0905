//! Remote sync client
//!
//! Translates entities to and from their documents and performs idempotent
//! upsert/delete/fetch against the remote store. Every call carries a
//! deadline; transport failures are classified into [`SyncError`] here.

use crate::doc;
use crate::protocol::ChangeEvent;
use crate::remote::{RemoteError, RemoteErrorCode, RemoteStore};
use crate::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use trek_common::{Entity, EntityKind};

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        match e.code {
            RemoteErrorCode::Unavailable
            | RemoteErrorCode::DeadlineExceeded
            | RemoteErrorCode::Aborted
            | RemoteErrorCode::Internal => SyncError::Network(e.message),
            RemoteErrorCode::ResourceExhausted => SyncError::Quota(e.message),
            RemoteErrorCode::NotFound => SyncError::NotFound(e.message),
            RemoteErrorCode::PermissionDenied | RemoteErrorCode::Unauthenticated => {
                SyncError::Auth(e.message)
            }
            RemoteErrorCode::InvalidArgument | RemoteErrorCode::DataLoss => {
                SyncError::Data(e.message)
            }
        }
    }
}

/// Remote acknowledgment of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub remote_id: String,
    /// Server commit time
    pub committed_at: DateTime<Utc>,
}

/// A fetched document: its key and the decoded entity, or why it could not
/// be decoded
pub type Fetched = (String, Result<Entity>);

#[derive(Clone)]
pub struct RemoteSyncClient {
    remote: Arc<dyn RemoteStore>,
    timeout: Duration,
}

impl RemoteSyncClient {
    pub fn new(remote: Arc<dyn RemoteStore>, timeout: Duration) -> Self {
        Self { remote, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn call<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, RemoteError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(SyncError::Timeout(self.timeout)),
        }
    }

    /// Remote key for `entity`, allocating one if it has none yet.
    ///
    /// Memberships are keyed by user id; everything else gets a fresh
    /// document key.
    pub fn allocate_remote_id(&self, entity: &Entity) -> String {
        if let Some(existing) = &entity.meta().remote_id {
            return existing.clone();
        }
        match entity {
            Entity::Member(m) => m.user_id.clone(),
            other => self.remote.new_document_id(other.kind().collection()),
        }
    }

    /// Document path of `entity` under `remote_id`.
    ///
    /// Members live under their family's document, so `family_remote_id` is
    /// required for them.
    pub fn document_path(
        entity: &Entity,
        remote_id: &str,
        family_remote_id: Option<&str>,
    ) -> Result<String> {
        match entity {
            Entity::Member(m) => {
                let family = family_remote_id.ok_or_else(|| SyncError::ParentNotSynced {
                    family_id: m.family_id.clone(),
                })?;
                Ok(members_path(family, remote_id))
            }
            other => Ok(format!("{}/{}", other.kind().collection(), remote_id)),
        }
    }

    /// Upsert `entity` with merge semantics.
    ///
    /// Uses the entity's remote id, or allocates one if it has none.
    pub async fn upload(
        &self,
        entity: &Entity,
        family_remote_id: Option<&str>,
    ) -> Result<UploadReceipt> {
        let remote_id = self.allocate_remote_id(entity);
        let path = Self::document_path(entity, &remote_id, family_remote_id)?;
        let document = doc::encode(entity)?;

        tracing::debug!(entity_id = %entity.id(), kind = %entity.kind(), %path, "Uploading");
        let committed_at = self.call(self.remote.set_merge(&path, document)).await?;
        Ok(UploadReceipt {
            remote_id,
            committed_at,
        })
    }

    /// Delete the remote copy of `entity`.
    ///
    /// Returns false without touching the network when the entity was never
    /// given a remote id. A document that is already gone counts as deleted.
    pub async fn delete(&self, entity: &Entity, family_remote_id: Option<&str>) -> Result<bool> {
        let Some(remote_id) = entity.meta().remote_id.as_deref() else {
            tracing::debug!(entity_id = %entity.id(), "Never synced, nothing to delete remotely");
            return Ok(false);
        };
        let path = Self::document_path(entity, remote_id, family_remote_id)?;

        match self.call(self.remote.delete(&path)).await {
            Ok(()) => Ok(true),
            Err(SyncError::NotFound(_)) => {
                tracing::debug!(%path, "Remote document already gone");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch one document. `Ok(None)` means it does not exist.
    pub async fn download(
        &self,
        kind: EntityKind,
        remote_id: &str,
        family_remote_id: Option<&str>,
    ) -> Result<Option<Entity>> {
        let path = match (kind, family_remote_id) {
            (EntityKind::Member, Some(family)) => members_path(family, remote_id),
            (EntityKind::Member, None) => {
                return Err(SyncError::Data(format!(
                    "member {} fetched without its family",
                    remote_id
                )))
            }
            _ => format!("{}/{}", kind.collection(), remote_id),
        };

        match self.call(self.remote.get(&path)).await {
            Ok(Some(document)) => doc::decode(kind, remote_id, document).map(Some),
            Ok(None) | Err(SyncError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Every document of a user-owned kind belonging to `user_id`
    pub async fn download_owned(&self, kind: EntityKind, user_id: &str) -> Result<Vec<Fetched>> {
        let found = self
            .call(self.remote.query(
                kind.collection(),
                "userId",
                &Value::String(user_id.to_string()),
            ))
            .await?;
        Ok(decode_all(kind, found))
    }

    /// Every membership document of a family
    pub async fn download_members(&self, family_remote_id: &str) -> Result<Vec<Fetched>> {
        let collection = members_collection(family_remote_id);
        let found = self.call(self.remote.list(&collection)).await?;
        Ok(decode_all(EntityKind::Member, found))
    }

    /// Open the live membership feed of a family
    pub async fn subscribe_members(
        &self,
        family_remote_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChangeEvent>> {
        let collection = members_collection(family_remote_id);
        self.call(self.remote.subscribe(&collection)).await
    }
}

fn decode_all(kind: EntityKind, found: Vec<(String, crate::Document)>) -> Vec<Fetched> {
    found
        .into_iter()
        .map(|(remote_id, document)| {
            let decoded = doc::decode(kind, &remote_id, document);
            (remote_id, decoded)
        })
        .collect()
}

pub fn members_collection(family_remote_id: &str) -> String {
    format!("families/{}/members", family_remote_id)
}

fn members_path(family_remote_id: &str, user_id: &str) -> String {
    format!("{}/{}", members_collection(family_remote_id), user_id)
}
