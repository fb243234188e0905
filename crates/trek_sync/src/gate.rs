//! Per-entity mutual exclusion

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use trek_common::EntityKey;

/// Async locks keyed by entity.
///
/// Holding the guard for a key serializes every operation on that entity
/// while other entities proceed concurrently.
#[derive(Debug, Default)]
pub struct EntityLocks {
    locks: DashMap<EntityKey, Arc<Mutex<()>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &EntityKey) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Forget locks nobody holds or waits on
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use trek_common::EntityKind;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = EntityLocks::new();
        let key = EntityKey::new(EntityKind::Trip, "t1");

        let guard = locks.lock(&key).await;
        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.lock(&key)).await;
        assert!(blocked.is_err());
        drop(guard);
        let free = tokio::time::timeout(Duration::from_millis(50), locks.lock(&key)).await;
        assert!(free.is_ok());
    }

    #[tokio::test]
    async fn test_distinct_keys_run_concurrently() {
        let locks = Arc::new(EntityLocks::new());
        let a = EntityKey::new(EntityKind::Trip, "a");
        let b = EntityKey::new(EntityKind::Trip, "b");

        let _held = locks.lock(&a).await;
        let other = tokio::time::timeout(Duration::from_millis(100), locks.lock(&b)).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = EntityLocks::new();
        let a = EntityKey::new(EntityKind::Game, "a");
        let b = EntityKey::new(EntityKind::Game, "b");

        let held = locks.lock(&a).await;
        drop(locks.lock(&b).await);
        locks.prune();
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.prune();
        assert!(locks.is_empty());
    }
}
