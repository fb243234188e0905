//! SQLite-backed local store
//!
//! One `entities` table; the full entity is kept as a JSON payload and the
//! columns we filter on are mirrored next to it.

use super::LocalStore;
use crate::{Result, SyncError};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use trek_common::{Entity, EntityKind, FamilyMember};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| SyncError::Store(format!("failed to open {:?}: {}", path, e)))?;
        let store = Self::init(conn)?;
        tracing::info!("Local store opened at {:?}", path);
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(include_str!("schema.sql"))
            .map_err(|e| SyncError::Store(format!("failed to initialize schema: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn query_entities(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Entity>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let payloads = stmt.query_map(args, payload)?;

        let mut entities = Vec::new();
        for text in payloads {
            entities.push(serde_json::from_str(&text?)?);
        }
        Ok(entities)
    }
}

fn payload(row: &Row<'_>) -> rusqlite::Result<String> {
    row.get(0)
}

impl LocalStore for SqliteStore {
    fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>> {
        let text: Option<String> = self
            .conn()
            .query_row(
                "SELECT payload FROM entities WHERE kind = ?1 AND id = ?2",
                params![kind.as_str(), id],
                payload,
            )
            .optional()?;
        Ok(text.map(|t| serde_json::from_str(&t)).transpose()?)
    }

    fn put(&self, entity: &Entity) -> Result<()> {
        let meta = entity.meta();
        let family_id = match entity {
            Entity::Member(m) => Some(m.family_id.as_str()),
            _ => None,
        };
        let text = serde_json::to_string(entity)?;

        self.conn().execute(
            "INSERT INTO entities
                (kind, id, remote_id, needs_sync, sync_status, last_updated, user_id, family_id, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(kind, id) DO UPDATE SET
                remote_id = excluded.remote_id,
                needs_sync = excluded.needs_sync,
                sync_status = excluded.sync_status,
                last_updated = excluded.last_updated,
                user_id = excluded.user_id,
                family_id = excluded.family_id,
                payload = excluded.payload",
            params![
                entity.kind().as_str(),
                meta.id,
                meta.remote_id,
                meta.needs_sync,
                meta.sync_status.as_str(),
                meta.last_updated.to_rfc3339(),
                entity.user_id(),
                family_id,
                text,
            ],
        )?;
        Ok(())
    }

    fn remove(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>> {
        let existing = self.get(kind, id)?;
        if existing.is_some() {
            self.conn().execute(
                "DELETE FROM entities WHERE kind = ?1 AND id = ?2",
                params![kind.as_str(), id],
            )?;
        }
        Ok(existing)
    }

    fn all(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        self.query_entities(
            "SELECT payload FROM entities WHERE kind = ?1 ORDER BY id",
            &[&kind.as_str()],
        )
    }

    fn pending(&self) -> Result<Vec<Entity>> {
        self.query_entities(
            "SELECT payload FROM entities WHERE needs_sync = 1 ORDER BY kind, last_updated",
            &[],
        )
    }

    fn find_by_remote_id(&self, kind: EntityKind, remote_id: &str) -> Result<Option<Entity>> {
        Ok(self
            .query_entities(
                "SELECT payload FROM entities WHERE kind = ?1 AND remote_id = ?2 LIMIT 1",
                &[&kind.as_str(), &remote_id],
            )?
            .into_iter()
            .next())
    }

    fn members_of(&self, family_id: &str) -> Result<Vec<FamilyMember>> {
        Ok(self
            .query_entities(
                "SELECT payload FROM entities WHERE kind = 'member' AND family_id = ?1 ORDER BY user_id",
                &[&family_id],
            )?
            .into_iter()
            .filter_map(|e| match e {
                Entity::Member(m) => Some(m),
                _ => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use trek_common::{FoundRegion, MemberRole, SyncStatus, Trip};

    #[test]
    fn test_put_get_round_trip_keeps_payload() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut trip = Trip::new("u1", "Coast", Utc::now());
        trip.mark_found(FoundRegion::new("OR", Utc::now()));
        store.put(&trip.clone().into()).unwrap();

        let loaded = store.get(EntityKind::Trip, &trip.meta.id).unwrap();
        assert_eq!(loaded, Some(Entity::Trip(trip)));
    }

    #[test]
    fn test_put_replaces_and_tracks_pending() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut trip = Trip::new("u1", "Coast", Utc::now());
        store.put(&trip.clone().into()).unwrap();
        assert_eq!(store.pending().unwrap().len(), 1);

        trip.meta.needs_sync = false;
        trip.meta.sync_status = SyncStatus::Synced;
        trip.meta.remote_id = Some("r1".to_string());
        store.put(&trip.clone().into()).unwrap();

        assert!(store.pending().unwrap().is_empty());
        assert!(store.find_by_remote_id(EntityKind::Trip, "r1").unwrap().is_some());
    }

    #[test]
    fn test_member_natural_key_lookup() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = FamilyMember::new("u1", "f1", MemberRole::Captain, Utc::now());
        let b = FamilyMember::new("u2", "f1", MemberRole::Scout, Utc::now());
        let c = FamilyMember::new("u1", "f2", MemberRole::Scout, Utc::now());
        for m in [&a, &b, &c] {
            store.put(&m.clone().into()).unwrap();
        }

        assert_eq!(store.members_of("f1").unwrap().len(), 2);
        let found = store.find_member("u1", "f2").unwrap().unwrap();
        assert_eq!(found.meta.id, c.meta.id);
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let temp = assert_fs::TempDir::new().unwrap();
        let path = temp.path().join("nested/store.db");
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.remove(EntityKind::Game, "missing").unwrap().is_none());
        assert!(path.exists());
    }
}
