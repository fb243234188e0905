//! Volatile store for tests and ephemeral sessions

use super::LocalStore;
use crate::Result;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use trek_common::{Entity, EntityKey, EntityKind};

#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<EntityKey, Entity>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, BTreeMap<EntityKey, Entity>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>> {
        Ok(self.rows().get(&EntityKey::new(kind, id)).cloned())
    }

    fn put(&self, entity: &Entity) -> Result<()> {
        self.rows().insert(entity.key(), entity.clone());
        Ok(())
    }

    fn remove(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>> {
        Ok(self.rows().remove(&EntityKey::new(kind, id)))
    }

    fn all(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        Ok(self
            .rows()
            .values()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect())
    }

    fn pending(&self) -> Result<Vec<Entity>> {
        Ok(self
            .rows()
            .values()
            .filter(|e| e.meta().needs_sync)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use trek_common::{FamilyMember, MemberRole, Trip};

    #[test]
    fn test_crud_and_lookups() {
        let store = MemoryStore::new();
        let mut trip = Trip::new("u1", "Coast", Utc::now());
        trip.meta.remote_id = Some("r1".to_string());
        store.put(&trip.clone().into()).unwrap();

        let member = FamilyMember::new("u2", "f1", MemberRole::Captain, Utc::now());
        store.put(&member.clone().into()).unwrap();

        assert!(store.get(EntityKind::Trip, &trip.meta.id).unwrap().is_some());
        assert_eq!(
            store
                .find_by_remote_id(EntityKind::Trip, "r1")
                .unwrap()
                .map(|e| e.id().to_string()),
            Some(trip.meta.id.clone())
        );
        assert_eq!(
            store.find_member("u2", "f1").unwrap().map(|m| m.meta.id),
            Some(member.meta.id.clone())
        );
        assert!(store.find_member("u2", "f2").unwrap().is_none());
        assert_eq!(store.pending().unwrap().len(), 2);

        assert!(store.remove(EntityKind::Trip, &trip.meta.id).unwrap().is_some());
        assert_eq!(store.len(), 1);
    }
}
