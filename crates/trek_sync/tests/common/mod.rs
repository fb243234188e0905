//! One simulated device: local store, connectivity and engine over a shared
//! remote store.

#![allow(dead_code)]

use assert_fs::TempDir;
use std::sync::Arc;
use std::time::Duration;
use trek_common::{Clock, Entity, EntityKind, FamilyMember, Trip};
use trek_sync::{
    LocalStore, MemoryRemoteStore, MemoryStore, NetworkMonitor, StaticSession, SyncConfig,
    SyncContext, SyncEngine,
};

pub struct Device {
    pub temp: TempDir,
    pub store: Arc<MemoryStore>,
    pub network: Arc<NetworkMonitor>,
    pub session: Arc<StaticSession>,
    pub engine: SyncEngine,
}

pub fn fast_config(temp: &TempDir) -> SyncConfig {
    SyncConfig {
        queue_path: temp.path().join(".trek/sync/queue.json"),
        database_path: temp.path().join(".trek/store.db"),
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(20),
        request_timeout: Duration::from_secs(2),
        retry_interval: Duration::from_millis(50),
        ..SyncConfig::default()
    }
}

impl Device {
    pub async fn new(remote: &Arc<MemoryRemoteStore>, user_id: &str, online: bool) -> Self {
        let temp = TempDir::new().unwrap();
        let config = fast_config(&temp);
        Self::with_config(remote, user_id, online, temp, config).await
    }

    pub async fn with_config(
        remote: &Arc<MemoryRemoteStore>,
        user_id: &str,
        online: bool,
        temp: TempDir,
        config: SyncConfig,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let network = Arc::new(NetworkMonitor::new(online));
        let session = Arc::new(StaticSession::durable(user_id));
        let engine = SyncEngine::new(
            config,
            SyncContext {
                store: store.clone(),
                remote: remote.clone(),
                session: session.clone(),
                network: network.clone(),
                clock: Arc::new(Clock::new()),
            },
        )
        .await
        .unwrap();

        Self {
            temp,
            store,
            network,
            session,
            engine,
        }
    }

    pub fn trip(&self, id: &str) -> Trip {
        match self.store.get(EntityKind::Trip, id).unwrap() {
            Some(Entity::Trip(trip)) => trip,
            other => panic!("expected trip {}, found {:?}", id, other),
        }
    }

    pub fn member(&self, user_id: &str, family_id: &str) -> FamilyMember {
        self.store
            .find_member(user_id, family_id)
            .unwrap()
            .unwrap_or_else(|| panic!("member {} of {} missing", user_id, family_id))
    }

    pub fn remote_id(&self, kind: EntityKind, id: &str) -> String {
        self.store
            .get(kind, id)
            .unwrap()
            .and_then(|e| e.meta().remote_id.clone())
            .unwrap_or_else(|| panic!("{} {} has no remote id", kind, id))
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
