//! Local persistent store seam
//!
//! The on-device store is the single shared mutable resource. The engine
//! mutates it only while holding the entity's row lock
//! ([`crate::gate::EntityLocks`]); implementations just need to make each
//! call atomic.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::Result;
use trek_common::{Entity, EntityKind, FamilyMember};

pub trait LocalStore: Send + Sync {
    fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>>;

    /// Insert or replace by `(kind, id)`
    fn put(&self, entity: &Entity) -> Result<()>;

    /// Physically delete a row, returning what was stored
    fn remove(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>>;

    fn all(&self, kind: EntityKind) -> Result<Vec<Entity>>;

    /// Every entity with `needs_sync` set, any kind
    fn pending(&self) -> Result<Vec<Entity>>;

    fn find_by_remote_id(&self, kind: EntityKind, remote_id: &str) -> Result<Option<Entity>> {
        Ok(self
            .all(kind)?
            .into_iter()
            .find(|e| e.meta().remote_id.as_deref() == Some(remote_id)))
    }

    /// Membership by natural key
    fn find_member(&self, user_id: &str, family_id: &str) -> Result<Option<FamilyMember>> {
        Ok(self.members_of(family_id)?.into_iter().find(|m| m.user_id == user_id))
    }

    /// Every membership row of a family, active or not
    fn members_of(&self, family_id: &str) -> Result<Vec<FamilyMember>> {
        Ok(self
            .all(EntityKind::Member)?
            .into_iter()
            .filter_map(|e| match e {
                Entity::Member(m) if m.family_id == family_id => Some(m),
                _ => None,
            })
            .collect())
    }
}
