//! Realtime listener manager
//!
//! Family membership is shared and multi-writer, so it is watched live
//! instead of waiting for the next pull. Each watched family owns a
//! [`ListenerHandle`] with its own cancellation token. Handles are stopped
//! explicitly: on context change, by [`ListenerManager::stop_listening`], or
//! by [`ListenerManager::stop_all`] at session teardown.

use crate::client::RemoteSyncClient;
use crate::doc;
use crate::gate::EntityLocks;
use crate::protocol::{ChangeEvent, ChangeKind};
use crate::store::LocalStore;
use crate::{Result, SyncError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trek_common::{Entity, EntityKey, EntityKind, FamilyMember};

/// One live membership subscription
#[derive(Debug)]
pub struct ListenerHandle {
    family_id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn family_id(&self) -> &str {
        &self.family_id
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }

    /// Cancel the subscription and wait for its task to wind down
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(family_id = %self.family_id, "Listener task ended abnormally: {}", e);
        }
    }
}

pub struct ListenerManager {
    client: RemoteSyncClient,
    store: Arc<dyn LocalStore>,
    rows: Arc<EntityLocks>,
    handles: Mutex<HashMap<String, ListenerHandle>>,
    active_family: StdMutex<Option<String>>,
}

impl ListenerManager {
    pub fn new(client: RemoteSyncClient, store: Arc<dyn LocalStore>, rows: Arc<EntityLocks>) -> Self {
        Self {
            client,
            store,
            rows,
            handles: Mutex::new(HashMap::new()),
            active_family: StdMutex::new(None),
        }
    }

    /// Watch the membership of family `family_id` (local id).
    ///
    /// A family already being watched keeps its existing subscription. The
    /// family must have been uploaded so its document can be addressed.
    pub async fn start_listening(&self, family_id: &str) -> Result<()> {
        let mut handles = self.handles.lock().await;
        if let Some(existing) = handles.get(family_id) {
            if existing.is_active() {
                tracing::debug!(family_id, "Already listening");
                return Ok(());
            }
        }

        let family = self
            .store
            .get(EntityKind::Family, family_id)?
            .ok_or_else(|| SyncError::NotFound(format!("family {}", family_id)))?;
        let remote_id = family
            .meta()
            .remote_id
            .clone()
            .ok_or_else(|| SyncError::ParentNotSynced {
                family_id: family_id.to_string(),
            })?;

        let rx = self.client.subscribe_members(&remote_id).await?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_listener(
            family_id.to_string(),
            rx,
            self.store.clone(),
            self.rows.clone(),
            cancel.clone(),
        ));

        if let Some(stale) = handles.insert(
            family_id.to_string(),
            ListenerHandle {
                family_id: family_id.to_string(),
                cancel,
                task,
            },
        ) {
            stale.stop().await;
        }

        tracing::info!(family_id, %remote_id, "Started member listener");
        Ok(())
    }

    /// Stop watching a family. Returns false if it was not being watched.
    pub async fn stop_listening(&self, family_id: &str) -> bool {
        let handle = self.handles.lock().await.remove(family_id);
        match handle {
            Some(handle) => {
                handle.stop().await;
                tracing::info!(family_id, "Stopped member listener");
                true
            }
            None => false,
        }
    }

    /// Switch the session's active family, stopping the previous one's
    /// listener. `None` leaves no family watched.
    pub async fn set_active_family(&self, family_id: Option<&str>) -> Result<()> {
        let previous = {
            let mut active = self
                .active_family
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *active, family_id.map(str::to_string))
        };

        if let Some(previous) = previous {
            if Some(previous.as_str()) != family_id {
                self.stop_listening(&previous).await;
            }
        }
        match family_id {
            Some(id) => self.start_listening(id).await,
            None => Ok(()),
        }
    }

    pub fn active_family(&self) -> Option<String> {
        self.active_family
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Stop every listener. Required at session teardown.
    pub async fn stop_all(&self) -> usize {
        let drained: Vec<ListenerHandle> = self.handles.lock().await.drain().map(|(_, h)| h).collect();
        let count = drained.len();
        for handle in drained {
            handle.stop().await;
        }
        *self
            .active_family
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        if count > 0 {
            tracing::info!("Stopped {} member listeners", count);
        }
        count
    }

    pub async fn is_listening(&self, family_id: &str) -> bool {
        self.handles
            .lock()
            .await
            .get(family_id)
            .map_or(false, ListenerHandle::is_active)
    }

    pub async fn listener_count(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// Apply one change notification for `family_id`'s members
    pub async fn apply_member_change(&self, family_id: &str, event: ChangeEvent) -> Result<()> {
        apply_member_change(self.store.as_ref(), &self.rows, family_id, event).await
    }
}

impl Drop for ListenerManager {
    fn drop(&mut self) {
        let handles = self.handles.get_mut();
        if !handles.is_empty() {
            tracing::warn!(
                "Listener manager dropped with {} live listeners; cancelling",
                handles.len()
            );
            for handle in handles.values() {
                handle.cancel.cancel();
            }
        }
    }
}

async fn run_listener(
    family_id: String,
    mut rx: mpsc::UnboundedReceiver<ChangeEvent>,
    store: Arc<dyn LocalStore>,
    rows: Arc<EntityLocks>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else {
                    tracing::debug!(%family_id, "Member feed closed");
                    break;
                };
                let doc_id = event.doc_id.clone();
                if let Err(e) = apply_member_change(store.as_ref(), &rows, &family_id, event).await {
                    tracing::error!(%family_id, user_id = %doc_id, "Failed to apply member change: {}", e);
                }
            }
        }
    }
}

/// Apply a membership change notification to the local store.
///
/// Added/modified upsert by natural key `(user_id, family_id)` with every
/// field replaced from the payload; the local surrogate id is kept. A local
/// edit newer than the payload and not yet uploaded is left alone. Removed
/// soft-deletes: the row stays, marked inactive and detached from the
/// family's active members.
pub async fn apply_member_change(
    store: &dyn LocalStore,
    rows: &EntityLocks,
    family_id: &str,
    event: ChangeEvent,
) -> Result<()> {
    let user_id = event.doc_id.clone();
    let kind = event.kind;

    match kind {
        ChangeKind::Added | ChangeKind::Modified => {
            let document = event.document.ok_or_else(|| {
                SyncError::Data(format!("{:?} event for {} without payload", kind, user_id))
            })?;
            let Entity::Member(mut incoming) = doc::decode(EntityKind::Member, &user_id, document)?
            else {
                return Err(SyncError::Data(format!("member {} decoded to another kind", user_id)));
            };
            incoming.family_id = family_id.to_string();

            let existing = store.find_member(&incoming.user_id, family_id)?;
            let member_key = EntityKey::new(
                EntityKind::Member,
                existing
                    .as_ref()
                    .map_or(incoming.meta.id.as_str(), |m| m.meta.id.as_str()),
            );
            let _member_guard = rows.lock(&member_key).await;

            // re-read under the lock
            let existing = store.find_member(&incoming.user_id, family_id)?;
            if let Some(local) = &existing {
                if local.meta.needs_sync && local.meta.last_updated > incoming.meta.last_updated {
                    tracing::debug!(user_id = %incoming.user_id, family_id, "Keeping newer local member edit");
                    return Ok(());
                }
                let mut meta = local.meta.clone();
                meta.adopt_remote(&incoming.meta)?;
                incoming.meta = meta;
            }

            let member_id = incoming.meta.id.clone();
            let active = incoming.is_active;
            store.put(&Entity::Member(incoming))?;
            update_family_members(store, rows, family_id, &member_id, active).await?;
            tracing::debug!(%user_id, family_id, ?kind, "Applied member change");
        }
        ChangeKind::Removed => {
            let Some(local) = store.find_member(&user_id, family_id)? else {
                tracing::debug!(%user_id, family_id, "Removed member not known locally");
                return Ok(());
            };
            let member_key = EntityKey::new(EntityKind::Member, local.meta.id.as_str());
            let _member_guard = rows.lock(&member_key).await;

            let Some(mut local) = store.find_member(&user_id, family_id)? else {
                return Ok(());
            };
            local.is_active = false;
            let member_id = local.meta.id.clone();
            store.put(&Entity::Member(local))?;
            update_family_members(store, rows, family_id, &member_id, false).await?;
            tracing::info!(%user_id, family_id, "Member removed remotely, marked inactive");
        }
    }
    Ok(())
}

pub(crate) async fn update_family_members(
    store: &dyn LocalStore,
    rows: &EntityLocks,
    family_id: &str,
    member_id: &str,
    active: bool,
) -> Result<()> {
    let family_key = EntityKey::new(EntityKind::Family, family_id);
    let _family_guard = rows.lock(&family_key).await;

    let Some(Entity::Family(mut family)) = store.get(EntityKind::Family, family_id)? else {
        return Ok(());
    };
    let changed = if active {
        family.attach_member(member_id)
    } else {
        family.detach_member(member_id)
    };
    if changed {
        store.put(&Entity::Family(family))?;
    }
    Ok(())
}

/// Local memberships of a family that are still active
pub fn active_members(store: &dyn LocalStore, family_id: &str) -> Result<Vec<FamilyMember>> {
    Ok(store
        .members_of(family_id)?
        .into_iter()
        .filter(|m| m.is_active)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryRemoteStore, RemoteStore};
    use crate::store::MemoryStore;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;
    use trek_common::{Family, MemberRole, SyncStatus};

    struct Fixture {
        remote: Arc<MemoryRemoteStore>,
        store: Arc<MemoryStore>,
        manager: ListenerManager,
        family: Family,
    }

    fn fixture() -> Fixture {
        let remote = Arc::new(MemoryRemoteStore::new());
        let store = Arc::new(MemoryStore::new());
        let mut family = Family::new(Some("Smiths".to_string()), Utc::now());
        family.meta.remote_id = Some("F1".to_string());
        family.meta.sync_status = SyncStatus::Synced;
        family.meta.needs_sync = false;
        store.put(&family.clone().into()).unwrap();

        let client = RemoteSyncClient::new(remote.clone(), Duration::from_secs(1));
        let manager = ListenerManager::new(client, store.clone(), Arc::new(EntityLocks::new()));
        Fixture {
            remote,
            store,
            manager,
            family,
        }
    }

    fn member_doc(family_id: &str, role: &str) -> crate::Document {
        json!({
            "id": "remote-surrogate",
            "familyId": family_id,
            "role": role,
            "isActive": true,
            "invitationStatus": "accepted",
            "lastUpdated": Utc::now(),
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..50 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_added_upserts_by_natural_key() {
        let f = fixture();
        let family_id = f.family.meta.id.clone();
        let local = FamilyMember::new("u2", family_id.as_str(), MemberRole::Scout, Utc::now());
        let mut local_synced = local.clone();
        local_synced.meta.needs_sync = false;
        f.store.put(&local_synced.into()).unwrap();

        f.manager
            .apply_member_change(&family_id, ChangeEvent::modified("u2", member_doc(&family_id, "captain")))
            .await
            .unwrap();

        let members = f.store.members_of(&family_id).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].meta.id, local.meta.id);
        assert_eq!(members[0].role, MemberRole::Captain);
        assert_eq!(members[0].meta.remote_id.as_deref(), Some("u2"));
        let Some(Entity::Family(family)) = f.store.get(EntityKind::Family, &family_id).unwrap() else {
            panic!("family missing");
        };
        assert_eq!(family.member_ids, vec![local.meta.id.clone()]);
    }

    #[tokio::test]
    async fn test_removed_soft_deletes() {
        let f = fixture();
        let family_id = f.family.meta.id.clone();
        f.manager
            .apply_member_change(&family_id, ChangeEvent::added("u3", member_doc(&family_id, "scout")))
            .await
            .unwrap();
        f.manager
            .apply_member_change(&family_id, ChangeEvent::removed("u3", None))
            .await
            .unwrap();

        let member = f.store.find_member("u3", &family_id).unwrap().unwrap();
        assert!(!member.is_active);
        assert!(active_members(f.store.as_ref(), &family_id).unwrap().is_empty());
        let Some(Entity::Family(family)) = f.store.get(EntityKind::Family, &family_id).unwrap() else {
            panic!("family missing");
        };
        assert!(family.member_ids.is_empty());
    }

    #[tokio::test]
    async fn test_listener_lifecycle() {
        let f = fixture();
        let family_id = f.family.meta.id.clone();

        f.manager.start_listening(&family_id).await.unwrap();
        f.manager.start_listening(&family_id).await.unwrap();
        assert_eq!(f.remote.subscriber_count(), 1);
        assert!(f.manager.is_listening(&family_id).await);

        f.remote
            .set_merge("families/F1/members/u5", member_doc(&family_id, "scout"))
            .await
            .unwrap();
        let store = f.store.clone();
        let fid = family_id.clone();
        eventually(move || store.find_member("u5", &fid).unwrap().is_some()).await;

        assert!(f.manager.stop_listening(&family_id).await);
        assert!(!f.manager.stop_listening(&family_id).await);
        assert_eq!(f.remote.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_switching_active_family_stops_previous() {
        let f = fixture();
        let mut other = Family::new(None, Utc::now());
        other.meta.remote_id = Some("F2".to_string());
        f.store.put(&other.clone().into()).unwrap();

        f.manager.set_active_family(Some(&f.family.meta.id)).await.unwrap();
        f.manager.set_active_family(Some(&other.meta.id)).await.unwrap();
        assert!(!f.manager.is_listening(&f.family.meta.id).await);
        assert!(f.manager.is_listening(&other.meta.id).await);

        assert_eq!(f.manager.stop_all().await, 1);
        assert_eq!(f.manager.listener_count().await, 0);
        assert!(f.manager.active_family().is_none());
    }

    #[tokio::test]
    async fn test_unsynced_family_cannot_be_watched() {
        let f = fixture();
        let family = Family::new(None, Utc::now());
        f.store.put(&family.clone().into()).unwrap();

        let err = f.manager.start_listening(&family.meta.id).await.unwrap_err();
        assert!(matches!(err, SyncError::ParentNotSynced { .. }));
    }
}
