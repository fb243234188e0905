//! Sync engine orchestration
//!
//! The engine is the one entry point callers use: it records local changes,
//! uploads them directly when it can and queues them when it can't, drains
//! the queue on reconnect, pulls remote revisions through the resolver and
//! exposes per-entity and global status.
//!
//! Every upload runs under two per-entity locks. The flight gate allows one
//! in-flight remote exchange per entity; the row lock guards each
//! read-modify-write of the local row, so a pull merge and a local edit
//! never overwrite each other. Distinct entities proceed concurrently, up to
//! `max_concurrent_uploads`.

use crate::backoff::{RetryDecision, RetryPolicy};
use crate::client::{Fetched, RemoteSyncClient, UploadReceipt};
use crate::config::SyncConfig;
use crate::gate::EntityLocks;
use crate::listener::{update_family_members, ListenerManager};
use crate::network::NetworkMonitor;
use crate::offline::{OfflineQueue, QueueEntry};
use crate::remote::RemoteStore;
use crate::resolver::{ConflictResolver, Resolution};
use crate::session::SessionProvider;
use crate::store::LocalStore;
use crate::{Result, SyncError};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use trek_common::sanitizer::LogSanitizer;
use trek_common::{
    ChangeType, Clock, Entity, EntityKey, EntityKind, SyncStatus, SyncTransition,
};

/// Collaborators the engine is built from, constructed once at startup
pub struct SyncContext {
    pub store: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub session: Arc<dyn SessionProvider>,
    pub network: Arc<NetworkMonitor>,
    pub clock: Arc<Clock>,
}

/// Global sync status for display
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub is_syncing: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Sanitized, user-facing
    pub last_error: Option<String>,
    pub pending_count: usize,
    pub auth_suspended: bool,
}

/// What one sync pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub uploaded: usize,
    pub deleted: usize,
    /// Remote revisions adopted locally
    pub merged: usize,
    /// Failed attempts queued for another try
    pub retried: usize,
    /// Entities marked `error`
    pub failed: usize,
    /// Work left queued (offline, suspended)
    pub deferred: usize,
    pub skipped: usize,
}

impl SyncReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Uploaded => self.uploaded += 1,
            Outcome::Deleted => self.deleted += 1,
            Outcome::Merged | Outcome::NeedsPush => self.merged += 1,
            Outcome::Retrying => self.retried += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Deferred => self.deferred += 1,
            Outcome::Skipped | Outcome::Superseded => self.skipped += 1,
        }
    }

    pub fn absorb(&mut self, other: SyncReport) {
        self.uploaded += other.uploaded;
        self.deleted += other.deleted;
        self.merged += other.merged;
        self.retried += other.retried;
        self.failed += other.failed;
        self.deferred += other.deferred;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Uploaded,
    Deleted,
    /// Remote was newer and has been adopted
    Merged,
    /// Remote adopted, but the merge kept local regions it lacks
    NeedsPush,
    Retrying,
    Deferred,
    Failed,
    /// Nothing to do (row gone or already clean)
    Skipped,
    /// A newer local revision arrived while the exchange was in flight
    Superseded,
}

/// Result of one remote exchange for an entity
enum Exchange {
    Uploaded { receipt: UploadReceipt, sent: Entity },
    Adopt { merged: Entity, push_back: bool },
    /// Remote already holds this exact revision (earlier ack was lost)
    AlreadyCommitted(DateTime<Utc>),
}

struct Inner {
    config: SyncConfig,
    policy: RetryPolicy,
    store: Arc<dyn LocalStore>,
    session: Arc<dyn SessionProvider>,
    network: Arc<NetworkMonitor>,
    clock: Arc<Clock>,
    client: RemoteSyncClient,
    resolver: ConflictResolver,
    queue: Mutex<OfflineQueue>,
    flights: EntityLocks,
    rows: Arc<EntityLocks>,
    pool: Arc<Semaphore>,
    listeners: ListenerManager,
    status: watch::Sender<SyncSnapshot>,
    auth_suspended: AtomicBool,
    active_ops: AtomicUsize,
    shutdown: CancellationToken,
    background: StdMutex<Option<JoinHandle<()>>>,
    sanitizer: LogSanitizer,
}

/// Keeps `is_syncing` raised while any sync work is running
struct SyncingGuard {
    inner: Arc<Inner>,
}

impl SyncingGuard {
    fn enter(inner: &Arc<Inner>) -> Self {
        inner.active_ops.fetch_add(1, Ordering::SeqCst);
        inner
            .status
            .send_modify(|s| s.is_syncing = inner.active_ops.load(Ordering::SeqCst) > 0);
        Self {
            inner: inner.clone(),
        }
    }
}

impl Drop for SyncingGuard {
    fn drop(&mut self) {
        let inner = &self.inner;
        inner.active_ops.fetch_sub(1, Ordering::SeqCst);
        inner
            .status
            .send_modify(|s| s.is_syncing = inner.active_ops.load(Ordering::SeqCst) > 0);
    }
}

/// Main sync engine
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    /// Create the engine and restore pending work from the previous run
    pub async fn new(config: SyncConfig, context: SyncContext) -> Result<Self> {
        config.validate()?;

        let queue = OfflineQueue::open(config.queue_path.clone())?;
        let client = RemoteSyncClient::new(context.remote, config.request_timeout);
        let rows = Arc::new(EntityLocks::new());
        let listeners = ListenerManager::new(client.clone(), context.store.clone(), rows.clone());
        let (status, _) = watch::channel(SyncSnapshot::default());

        let engine = Self {
            inner: Arc::new(Inner {
                policy: RetryPolicy::from_config(&config),
                pool: Arc::new(Semaphore::new(config.max_concurrent_uploads)),
                config,
                store: context.store,
                session: context.session,
                network: context.network,
                clock: context.clock,
                client,
                resolver: ConflictResolver::new(),
                queue: Mutex::new(queue),
                flights: EntityLocks::new(),
                rows,
                listeners,
                status,
                auth_suspended: AtomicBool::new(false),
                active_ops: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
                background: StdMutex::new(None),
                sanitizer: LogSanitizer::new(),
            }),
        };

        engine.recover().await?;
        engine.refresh_pending().await;
        Ok(engine)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn listeners(&self) -> &ListenerManager {
        &self.inner.listeners
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.inner.status.borrow().clone()
    }

    /// Receive a new snapshot whenever global status changes
    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.inner.status.subscribe()
    }

    /// Sync status of one entity, `None` if it is not stored locally
    pub fn status_of(&self, kind: EntityKind, id: &str) -> Result<Option<SyncStatus>> {
        Ok(self
            .inner
            .store
            .get(kind, id)?
            .map(|e| e.meta().sync_status))
    }

    pub fn is_auth_suspended(&self) -> bool {
        self.inner.auth_suspended.load(Ordering::SeqCst)
    }

    /// Record a local mutation.
    ///
    /// The local write always happens and is never rolled back by a remote
    /// failure. When sync can run the change is uploaded right away;
    /// otherwise it is queued for the next drain.
    pub async fn handle_change(&self, entity: Entity, change: ChangeType) -> Result<()> {
        if change == ChangeType::Delete {
            return self.delete(entity).await;
        }

        let key = entity.key();
        let snapshot = self.write_local(entity).await?;

        if !self.inner.session.sync_enabled() {
            tracing::debug!(entity = %key, "Sync disabled for this session, change kept local");
            return Ok(());
        }

        if self.can_sync() {
            let _busy = SyncingGuard::enter(&self.inner);
            let outcome = match self.upload_entity(&key).await {
                Ok(outcome) => outcome,
                Err(e) => self.schedule_retry(snapshot, change, e).await?,
            };
            if outcome == Outcome::Uploaded {
                self.mark_synced_now();
            }
        } else {
            self.inner.queue.lock().await.enqueue(snapshot, change)?;
            tracing::debug!(entity = %key, "Queued change for later sync");
        }

        self.refresh_pending().await;
        Ok(())
    }

    /// Upload everything pending, then pull remote revisions
    pub async fn sync_all(&self) -> Result<SyncReport> {
        if !self.inner.session.sync_enabled() {
            return Ok(SyncReport::default());
        }
        let _busy = SyncingGuard::enter(&self.inner);

        self.enqueue_dirty().await?;
        let mut report = self.process_offline_queue().await?;
        report.absorb(self.download_all().await?);
        Ok(report)
    }

    /// Drain the offline queue through the remote client.
    ///
    /// Families go first so their members can address the parent document.
    /// Failed entries are re-queued with backoff or marked `error` once the
    /// retry budget is spent.
    pub async fn process_offline_queue(&self) -> Result<SyncReport> {
        if !self.inner.session.sync_enabled() {
            return Ok(SyncReport::default());
        }
        if !self.can_sync() {
            let deferred = self.inner.queue.lock().await.len();
            tracing::debug!(deferred, "Cannot sync now, queue left as is");
            return Ok(SyncReport {
                deferred,
                ..SyncReport::default()
            });
        }

        let entries = self.inner.queue.lock().await.drain_all();
        self.process_entries(entries).await
    }

    /// Pull the user's remote records and merge them into the local store
    pub async fn download_all(&self) -> Result<SyncReport> {
        let session = &self.inner.session;
        let Some(user_id) = session.current_user_id().filter(|_| session.is_durable_account())
        else {
            return Ok(SyncReport::default());
        };
        if !self.can_sync() {
            tracing::debug!("Cannot pull now");
            return Ok(SyncReport::default());
        }

        let _busy = SyncingGuard::enter(&self.inner);
        let mut report = SyncReport::default();
        let mut to_push = Vec::new();

        let pulled = async {
            for kind in EntityKind::ALL.into_iter().filter(EntityKind::is_user_owned) {
                let fetched = self.inner.client.download_owned(kind, &user_id).await?;
                for item in fetched {
                    self.apply_fetched(kind, item, None, &mut report, &mut to_push)
                        .await?;
                }
            }

            for family in self.inner.store.all(EntityKind::Family)? {
                let Some(remote_id) = family.meta().remote_id.clone() else {
                    continue;
                };
                match self
                    .inner
                    .client
                    .download(EntityKind::Family, &remote_id, None)
                    .await?
                {
                    Some(remote) => self.apply_pulled(remote, &mut report, &mut to_push).await?,
                    None => {
                        tracing::warn!(family_id = %family.id(), %remote_id, "Family no longer exists remotely");
                        continue;
                    }
                }

                for item in self.inner.client.download_members(&remote_id).await? {
                    self.apply_fetched(
                        EntityKind::Member,
                        item,
                        Some(family.id()),
                        &mut report,
                        &mut to_push,
                    )
                    .await?;
                }
            }
            Ok::<(), SyncError>(())
        }
        .await;

        if let Err(e) = pulled {
            self.record_error(&e);
            return Err(e);
        }

        for key in to_push {
            self.push_or_queue(&key).await?;
        }

        self.mark_synced_now();
        tracing::info!(merged = report.merged, "Pull complete");
        Ok(report)
    }

    /// Watch the membership feed of a family
    pub async fn start_listening(&self, family_id: &str) -> Result<()> {
        if !self.inner.session.sync_enabled() {
            tracing::debug!(family_id, "Sync disabled for this session, not listening");
            return Ok(());
        }
        self.inner
            .listeners
            .start_listening(family_id)
            .await
            .inspect_err(|e| self.record_error(e))
    }

    pub async fn stop_listening(&self, family_id: &str) -> bool {
        self.inner.listeners.stop_listening(family_id).await
    }

    /// Make `family_id` the session's active family, moving the listener
    pub async fn set_active_family(&self, family_id: Option<&str>) -> Result<()> {
        if !self.inner.session.sync_enabled() {
            return Ok(());
        }
        self.inner.listeners.set_active_family(family_id).await
    }

    /// Clear an auth suspension and drain what piled up meanwhile
    pub async fn reauthenticated(&self) -> Result<SyncReport> {
        if self.inner.auth_suspended.swap(false, Ordering::SeqCst) {
            tracing::info!("Re-authenticated, resuming sync");
        }
        self.inner.status.send_modify(|s| {
            s.auth_suspended = false;
            s.last_error = None;
        });
        self.process_offline_queue().await
    }

    /// Spawn the background loop: drain and pull on reconnect, and retry
    /// due queue entries every `retry_interval`. Idempotent.
    pub fn start(&self) {
        let mut slot = self
            .inner
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().map_or(false, |h| !h.is_finished()) {
            tracing::debug!("Background sync already running");
            return;
        }

        // subscribed before spawning so a transition right after start is seen
        let online = self.inner.network.subscribe();
        let engine = self.clone();
        *slot = Some(tokio::spawn(engine.run_background(online)));
        tracing::info!("Background sync started");
    }

    /// Stop the background loop and every listener. The engine cannot be
    /// started again afterwards.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self
            .inner
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Background sync task ended abnormally: {}", e);
            }
        }

        let stopped = self.inner.listeners.stop_all().await;
        tracing::info!(listeners = stopped, "Sync engine stopped");
    }

    async fn run_background(self, mut online: watch::Receiver<bool>) {
        let mut sweep = tokio::time::interval(self.inner.config.retry_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        sweep.tick().await;

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let is_online = *online.borrow_and_update();
                    if is_online {
                        tracing::info!("Back online, draining pending changes");
                        self.on_reconnect().await;
                    } else {
                        tracing::info!("Offline, deferring sync");
                    }
                }
                _ = sweep.tick() => self.retry_due().await,
            }
        }
        tracing::debug!("Background sync loop stopped");
    }

    async fn on_reconnect(&self) {
        if let Err(e) = self.process_offline_queue().await {
            tracing::warn!("Queue drain after reconnect failed: {}", e);
        }
        if let Err(e) = self.download_all().await {
            tracing::warn!("Pull after reconnect failed: {}", e);
        }
    }

    async fn retry_due(&self) {
        self.inner.flights.prune();
        self.inner.rows.prune();
        if !self.inner.session.sync_enabled() || !self.can_sync() {
            return;
        }
        let due = self.inner.queue.lock().await.drain_due(Utc::now());
        if due.is_empty() {
            return;
        }
        tracing::debug!(count = due.len(), "Retrying due changes");
        if let Err(e) = self.process_entries(due).await {
            tracing::warn!("Retry sweep failed: {}", e);
        }
    }

    fn can_sync(&self) -> bool {
        self.inner.network.is_online() && !self.is_auth_suspended()
    }

    // ---- local side ----

    async fn recover(&self) -> Result<()> {
        let mut reset = 0;
        for mut entity in self.inner.store.pending()? {
            if entity.meta().sync_status == SyncStatus::Syncing {
                // upload interrupted by shutdown or crash
                entity.meta_mut().apply(SyncTransition::RetryableFailure)?;
                self.inner.store.put(&entity)?;
                reset += 1;
            }
        }
        if reset > 0 {
            tracing::info!(reset, "Reset interrupted uploads to pending");
        }

        if self.inner.session.sync_enabled() {
            self.enqueue_dirty().await?;
        }
        Ok(())
    }

    /// Queue dirty entities that have no queue entry. Entities in `error`
    /// stay out until edited again.
    async fn enqueue_dirty(&self) -> Result<usize> {
        let dirty = self.inner.store.pending()?;
        let mut queue = self.inner.queue.lock().await;
        let mut added = 0;
        for entity in dirty {
            let status = entity.meta().sync_status;
            if matches!(status, SyncStatus::Error | SyncStatus::Syncing) || queue.contains(&entity.key())
            {
                continue;
            }
            let change = if entity.meta().remote_id.is_some() {
                ChangeType::Update
            } else {
                ChangeType::Create
            };
            queue.enqueue(entity, change)?;
            added += 1;
        }
        drop(queue);

        if added > 0 {
            tracing::info!(added, "Queued dirty entities");
        }
        Ok(added)
    }

    async fn write_local(&self, mut entity: Entity) -> Result<Entity> {
        let key = entity.key();
        {
            let _row = self.inner.rows.lock(&key).await;
            if let Some(stored) = self.inner.store.get(key.kind, &key.id)? {
                if let Some(bound) = stored.meta().remote_id.as_deref() {
                    entity.meta_mut().bind_remote_id(bound)?;
                }
                if let (Entity::Family(next), Entity::Family(stored)) = (&mut entity, &stored) {
                    next.member_ids = stored.member_ids.clone();
                }
            }
            let stamp = self.inner.clock.tick();
            entity.meta_mut().touch(stamp);
            self.inner.store.put(&entity)?;
        }

        if let Entity::Member(m) = &entity {
            update_family_members(
                self.inner.store.as_ref(),
                &self.inner.rows,
                &m.family_id,
                &m.meta.id,
                m.is_active,
            )
            .await?;
        }
        tracing::debug!(entity = %key, "Recorded local change");
        Ok(entity)
    }

    async fn mark(&self, key: &EntityKey, event: SyncTransition) -> Result<()> {
        let _row = self.inner.rows.lock(key).await;
        if let Some(mut entity) = self.inner.store.get(key.kind, &key.id)? {
            match entity.meta_mut().apply(event) {
                Ok(_) => self.inner.store.put(&entity)?,
                Err(e) => tracing::debug!(entity = %key, "Status left as is: {}", e),
            }
        }
        Ok(())
    }

    fn family_remote_id(&self, family_id: &str) -> Result<String> {
        self.inner
            .store
            .get(EntityKind::Family, family_id)?
            .and_then(|f| f.meta().remote_id.clone())
            .ok_or_else(|| SyncError::ParentNotSynced {
                family_id: family_id.to_string(),
            })
    }

    fn parent_remote_id(&self, entity: &Entity) -> Result<Option<String>> {
        match entity {
            Entity::Member(m) => self.family_remote_id(&m.family_id).map(Some),
            _ => Ok(None),
        }
    }

    // ---- upload side ----

    /// Upload the stored state of `key`, following up once if a merge kept
    /// local data the remote lacks.
    async fn upload_entity(&self, key: &EntityKey) -> Result<Outcome> {
        let outcome = self.upload_once(key).await?;
        if outcome != Outcome::NeedsPush {
            return Ok(outcome);
        }

        let outcome = self.upload_once(key).await?;
        if outcome == Outcome::NeedsPush {
            if let Some(current) = self.inner.store.get(key.kind, &key.id)? {
                self.inner
                    .queue
                    .lock()
                    .await
                    .enqueue(current, ChangeType::Update)?;
            }
            return Ok(Outcome::Merged);
        }
        Ok(outcome)
    }

    async fn upload_once(&self, key: &EntityKey) -> Result<Outcome> {
        let inner = &self.inner;
        // flight gate before pool permit, the same order deletes use
        let _flight = inner.flights.lock(key).await;
        let _permit = inner
            .pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Network("upload pool closed".to_string()))?;

        let (entity, family_remote, may_exist_remotely) = {
            let _row = inner.rows.lock(key).await;
            let Some(mut entity) = inner.store.get(key.kind, &key.id)? else {
                return Ok(Outcome::Skipped);
            };
            if !entity.meta().needs_sync {
                return Ok(Outcome::Skipped);
            }

            let family_remote = self.parent_remote_id(&entity)?;
            let may_exist_remotely =
                entity.meta().remote_id.is_some() || entity.kind() == EntityKind::Member;
            if entity.meta().remote_id.is_none() {
                // reserved before the request so a retry after a lost ack
                // lands on the same document
                let reserved = inner.client.allocate_remote_id(&entity);
                entity.meta_mut().bind_remote_id(&reserved)?;
            }
            if entity.meta().sync_status != SyncStatus::Pending {
                entity.meta_mut().apply(SyncTransition::LocalEdit)?;
            }
            entity.meta_mut().apply(SyncTransition::UploadStarted)?;
            inner.store.put(&entity)?;
            (entity, family_remote, may_exist_remotely)
        };

        let epoch = inner.network.epoch();
        if !inner.network.is_online() {
            return Err(SyncError::Offline);
        }
        let exchange = self
            .exchange(&entity, family_remote.as_deref(), may_exist_remotely)
            .await?;
        if !inner.network.still_connected(epoch) {
            tracing::warn!(entity = %key, "Connectivity dropped mid-request, discarding result");
            return Err(SyncError::Offline);
        }

        let _row = inner.rows.lock(key).await;
        let Some(current) = inner.store.get(key.kind, &key.id)? else {
            return Ok(Outcome::Skipped);
        };
        if current.meta().last_updated != entity.meta().last_updated {
            tracing::debug!(entity = %key, "Edited during upload, newer revision stays pending");
            return Ok(Outcome::Superseded);
        }

        match exchange {
            Exchange::Uploaded { receipt, sent } => {
                let mut next = sent;
                carry_local_only(&current, &mut next);
                next.meta_mut().bind_remote_id(&receipt.remote_id)?;
                next.meta_mut().acknowledge(receipt.committed_at)?;
                inner.store.put(&next)?;
                tracing::info!(entity = %key, remote_id = %receipt.remote_id, "Uploaded");
                Ok(Outcome::Uploaded)
            }
            Exchange::Adopt {
                mut merged,
                push_back,
            } => {
                carry_local_only(&current, &mut merged);
                inner.clock.observe(merged.meta().last_updated);
                if push_back {
                    merged.meta_mut().touch(inner.clock.tick());
                }
                inner.store.put(&merged)?;
                tracing::info!(entity = %key, push_back, "Remote revision was newer, adopted it");
                Ok(if push_back {
                    Outcome::NeedsPush
                } else {
                    Outcome::Merged
                })
            }
            Exchange::AlreadyCommitted(committed_at) => {
                let mut current = current;
                current.meta_mut().acknowledge(committed_at)?;
                inner.store.put(&current)?;
                tracing::debug!(entity = %key, "Remote already had this revision");
                Ok(Outcome::Uploaded)
            }
        }
    }

    /// The network part of an upload: check the remote revision when one may
    /// exist, then push.
    async fn exchange(
        &self,
        entity: &Entity,
        family_remote: Option<&str>,
        may_exist_remotely: bool,
    ) -> Result<Exchange> {
        let client = &self.inner.client;
        let mut outgoing = entity.clone();

        if may_exist_remotely {
            let remote_id = entity.meta().remote_id.as_deref().ok_or_else(|| {
                SyncError::Data(format!("{} has no remote id to check", entity.key()))
            })?;
            if let Some(remote) = client.download(entity.kind(), remote_id, family_remote).await? {
                let committed_at = remote.meta().last_synced_at;
                match self.inner.resolver.resolve(Some(entity), remote)? {
                    Resolution::AdoptRemote { merged, push_back } => {
                        return Ok(Exchange::Adopt { merged, push_back })
                    }
                    Resolution::PushLocal { merged: Some(merged) } => outgoing = merged,
                    Resolution::PushLocal { merged: None } => {}
                    Resolution::Unchanged => {
                        return Ok(Exchange::AlreadyCommitted(
                            committed_at.unwrap_or_else(Utc::now),
                        ))
                    }
                }
            }
        }

        let receipt = client.upload(&outgoing, family_remote).await?;
        Ok(Exchange::Uploaded {
            receipt,
            sent: outgoing,
        })
    }

    /// Settle a failed direct upload or delete: queue it with backoff, hold
    /// it while suspended, or give up.
    async fn schedule_retry(
        &self,
        snapshot: Entity,
        change: ChangeType,
        error: SyncError,
    ) -> Result<Outcome> {
        let key = snapshot.key();
        let failed_attempts = 1;
        self.record_error(&error);

        match self.inner.policy.decide(&error, failed_attempts) {
            RetryDecision::RetryAfter(delay) => {
                tracing::warn!(entity = %key, attempt = failed_attempts, ?delay, "Sync failed, will retry: {}", error);
                self.mark(&key, SyncTransition::RetryableFailure).await?;
                self.inner.queue.lock().await.enqueue_with(
                    snapshot,
                    change,
                    failed_attempts,
                    Some(retry_at(delay)),
                )?;
                Ok(Outcome::Retrying)
            }
            RetryDecision::Hold => {
                self.mark(&key, SyncTransition::RetryableFailure).await?;
                self.inner.queue.lock().await.enqueue(snapshot, change)?;
                Ok(Outcome::Deferred)
            }
            RetryDecision::GiveUp => {
                tracing::error!(entity = %key, "Sync failed permanently: {}", error);
                self.mark(&key, SyncTransition::FatalFailure).await?;
                Ok(Outcome::Failed)
            }
        }
    }

    async fn process_entries(&self, entries: Vec<QueueEntry>) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        if entries.is_empty() {
            return Ok(report);
        }

        let _busy = SyncingGuard::enter(&self.inner);
        tracing::info!(count = entries.len(), "Processing queued changes");

        let (families, rest): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|e| e.key.kind == EntityKind::Family);
        for batch in [families, rest] {
            let settled = join_all(batch.into_iter().map(|entry| self.settle(entry))).await;
            for outcome in settled {
                report.record(outcome?);
            }
        }

        self.refresh_pending().await;
        if report.failed == 0 && report.retried == 0 {
            self.mark_synced_now();
        }
        tracing::info!(
            uploaded = report.uploaded,
            deleted = report.deleted,
            retried = report.retried,
            failed = report.failed,
            "Queue drain complete"
        );
        Ok(report)
    }

    async fn settle(&self, entry: QueueEntry) -> Result<Outcome> {
        let seq = entry.seq;
        let key = entry.key.clone();
        let attempt = entry.attempts + 1;
        let is_delete = entry.change == ChangeType::Delete;

        let result = if is_delete {
            let _flight = self.inner.flights.lock(&key).await;
            self.delete_remote(&entry.snapshot).await
        } else {
            self.upload_entity(&key).await
        };

        let error = match result {
            Ok(outcome) => {
                self.inner.queue.lock().await.complete(seq)?;
                return Ok(outcome);
            }
            Err(error) => error,
        };

        self.record_error(&error);
        match self.inner.policy.decide(&error, attempt) {
            RetryDecision::RetryAfter(delay) => {
                tracing::warn!(entity = %key, attempt, ?delay, "Sync failed, will retry: {}", error);
                if !is_delete {
                    self.mark(&key, SyncTransition::RetryableFailure).await?;
                }
                self.inner
                    .queue
                    .lock()
                    .await
                    .retry(seq, Some(retry_at(delay)))?;
                Ok(Outcome::Retrying)
            }
            RetryDecision::Hold => {
                if !is_delete {
                    self.mark(&key, SyncTransition::RetryableFailure).await?;
                }
                self.inner.queue.lock().await.release(seq)?;
                Ok(Outcome::Deferred)
            }
            RetryDecision::GiveUp => {
                tracing::error!(entity = %key, attempt, "Giving up: {}", error);
                if !is_delete {
                    self.mark(&key, SyncTransition::FatalFailure).await?;
                }
                self.inner.queue.lock().await.complete(seq)?;
                Ok(Outcome::Failed)
            }
        }
    }

    async fn push_or_queue(&self, key: &EntityKey) -> Result<()> {
        if self.can_sync() {
            if let Err(e) = self.upload_entity(key).await {
                if let Some(current) = self.inner.store.get(key.kind, &key.id)? {
                    self.schedule_retry(current, ChangeType::Update, e).await?;
                }
            }
        } else if let Some(current) = self.inner.store.get(key.kind, &key.id)? {
            self.inner
                .queue
                .lock()
                .await
                .enqueue(current, ChangeType::Update)?;
        }
        self.refresh_pending().await;
        Ok(())
    }

    // ---- deletes ----

    async fn delete(&self, entity: Entity) -> Result<()> {
        let key = entity.key();
        let _flight = self.inner.flights.lock(&key).await;

        let removed = {
            let _row = self.inner.rows.lock(&key).await;
            self.inner.store.remove(key.kind, &key.id)?
        };
        let mut target = match removed {
            Some(stored) => stored,
            None => entity.clone(),
        };
        if target.meta().remote_id.is_none() {
            if let Some(known) = entity.meta().remote_id.as_deref() {
                target.meta_mut().bind_remote_id(known)?;
            }
        }

        if let Entity::Member(m) = &target {
            update_family_members(
                self.inner.store.as_ref(),
                &self.inner.rows,
                &m.family_id,
                &m.meta.id,
                false,
            )
            .await?;
        }
        tracing::info!(entity = %key, "Deleted locally");

        if target.meta().remote_id.is_none() {
            // never reached the remote store
            self.inner.queue.lock().await.discard(&key)?;
            self.refresh_pending().await;
            return Ok(());
        }
        if !self.inner.session.sync_enabled() {
            return Ok(());
        }

        if self.can_sync() {
            let _busy = SyncingGuard::enter(&self.inner);
            match self.delete_remote(&target).await {
                Ok(_) => {
                    self.inner.queue.lock().await.discard(&key)?;
                }
                Err(e) => {
                    self.schedule_retry(target, ChangeType::Delete, e).await?;
                }
            }
        } else {
            self.inner
                .queue
                .lock()
                .await
                .enqueue(target, ChangeType::Delete)?;
        }

        self.refresh_pending().await;
        Ok(())
    }

    /// Remote half of a delete. The caller holds the entity's flight gate;
    /// the pool permit is always taken after it.
    async fn delete_remote(&self, target: &Entity) -> Result<Outcome> {
        let _permit = self
            .inner
            .pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Network("upload pool closed".to_string()))?;

        let family_remote = self.parent_remote_id(target)?;
        let epoch = self.inner.network.epoch();
        if !self.inner.network.is_online() {
            return Err(SyncError::Offline);
        }
        let deleted = self
            .inner
            .client
            .delete(target, family_remote.as_deref())
            .await?;
        if !self.inner.network.still_connected(epoch) {
            return Err(SyncError::Offline);
        }

        tracing::info!(entity = %target.key(), "Deleted remotely");
        Ok(if deleted {
            Outcome::Deleted
        } else {
            Outcome::Skipped
        })
    }

    // ---- pull side ----

    async fn apply_fetched(
        &self,
        kind: EntityKind,
        (remote_id, decoded): Fetched,
        family_id: Option<&str>,
        report: &mut SyncReport,
        to_push: &mut Vec<EntityKey>,
    ) -> Result<()> {
        match decoded {
            Ok(mut remote) => {
                if let (Some(family_id), Entity::Member(m)) = (family_id, &mut remote) {
                    m.family_id = family_id.to_string();
                }
                self.apply_pulled(remote, report, to_push).await
            }
            Err(e) => {
                tracing::error!(%kind, %remote_id, "Skipping malformed remote document: {}", e);
                self.record_error(&e);
                let local = match (kind, family_id) {
                    (EntityKind::Member, Some(family_id)) => self
                        .inner
                        .store
                        .find_member(&remote_id, family_id)?
                        .map(Entity::Member),
                    _ => self.inner.store.find_by_remote_id(kind, &remote_id)?,
                };
                if let Some(local) = local {
                    self.mark(&local.key(), SyncTransition::FatalFailure).await?;
                }
                report.failed += 1;
                Ok(())
            }
        }
    }

    async fn apply_pulled(
        &self,
        remote: Entity,
        report: &mut SyncReport,
        to_push: &mut Vec<EntityKey>,
    ) -> Result<()> {
        let store = &self.inner.store;
        let kind = remote.kind();

        let local = match &remote {
            Entity::Member(m) => store.find_member(&m.user_id, &m.family_id)?.map(Entity::Member),
            other => {
                let by_remote = match other.meta().remote_id.as_deref() {
                    Some(remote_id) => store.find_by_remote_id(kind, remote_id)?,
                    None => None,
                };
                match by_remote {
                    Some(found) => Some(found),
                    None => store.get(kind, other.id())?,
                }
            }
        };
        let key = local.as_ref().map_or_else(|| remote.key(), Entity::key);

        let row = self.inner.rows.lock(&key).await;
        let local = store.get(key.kind, &key.id)?;
        if let Some(l) = &local {
            if l.meta().sync_status == SyncStatus::Syncing {
                tracing::debug!(entity = %key, "Upload in flight, pull skipped");
                report.skipped += 1;
                return Ok(());
            }
        }

        let remote_at = remote.meta().last_updated;
        match self.inner.resolver.resolve(local.as_ref(), remote)? {
            Resolution::AdoptRemote {
                mut merged,
                push_back,
            } => {
                if let Some(l) = &local {
                    carry_local_only(l, &mut merged);
                }
                self.inner.clock.observe(remote_at);
                if push_back {
                    merged.meta_mut().touch(self.inner.clock.tick());
                    to_push.push(key.clone());
                }
                store.put(&merged)?;
                drop(row);

                if let Entity::Member(m) = &merged {
                    update_family_members(
                        store.as_ref(),
                        &self.inner.rows,
                        &m.family_id,
                        &m.meta.id,
                        m.is_active,
                    )
                    .await?;
                }
                tracing::debug!(entity = %key, "Adopted remote revision");
                report.merged += 1;
            }
            Resolution::PushLocal { merged } => {
                match merged {
                    Some(mut merged) => {
                        merged.meta_mut().touch(self.inner.clock.tick());
                        store.put(&merged)?;
                    }
                    None => {
                        if let Some(mut l) = local {
                            if !l.meta().needs_sync {
                                l.meta_mut().apply(SyncTransition::LocalEdit)?;
                                l.meta_mut().needs_sync = true;
                                store.put(&l)?;
                            }
                        }
                    }
                }
                tracing::debug!(entity = %key, "Local revision is newer, pushing");
                to_push.push(key);
            }
            Resolution::Unchanged => {}
        }
        Ok(())
    }

    // ---- status ----

    fn record_error(&self, error: &SyncError) {
        if error.is_auth() && !self.inner.auth_suspended.swap(true, Ordering::SeqCst) {
            tracing::error!("Authorization failed, sync suspended until re-authentication");
        }
        let message = self.inner.sanitizer.sanitize(&error.to_string());
        let suspended = self.is_auth_suspended();
        self.inner.status.send_modify(|s| {
            s.last_error = Some(message);
            s.auth_suspended = suspended;
        });
    }

    fn mark_synced_now(&self) {
        let now = Utc::now();
        self.inner
            .status
            .send_modify(|s| s.last_sync_time = Some(now));
    }

    async fn refresh_pending(&self) {
        let pending = self.inner.queue.lock().await.pending_count();
        self.inner
            .status
            .send_modify(|s| s.pending_count = pending);
    }
}

/// Keep local-only state when replacing a row with a remote-derived one
fn carry_local_only(current: &Entity, next: &mut Entity) {
    match (current, next) {
        (Entity::Family(c), Entity::Family(n)) => n.member_ids = c.member_ids.clone(),
        (Entity::Member(c), Entity::Member(n)) => n.family_id = c.family_id.clone(),
        _ => {}
    }
}

fn retry_at(delay: Duration) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    Utc::now() + delay
}
