//! Durable offline queue
//!
//! The queue records the *intent to sync the current state* of an entity, not
//! an edit log: enqueuing a change for an entity that already has a queued
//! entry replaces that entry. Every mutation is written to disk (temp file,
//! fsync, rename) before returning, so queued work survives a crash.
//!
//! Draining checks entries out rather than deleting them. A checked-out
//! entry stays in the file until it is settled with [`OfflineQueue::complete`],
//! [`OfflineQueue::retry`] or [`OfflineQueue::release`], which gives
//! at-least-once delivery even if the process dies mid-drain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use trek_common::{ChangeType, Entity, EntityKey};

const QUEUE_FORMAT_VERSION: u32 = 1;

/// A pending change for one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// Monotonic per-queue sequence number
    pub seq: u64,
    pub key: EntityKey,
    pub change: ChangeType,
    /// Entity state at the time of the change
    pub snapshot: Entity,
    /// Failed attempts so far
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the background sweep may retry this entry
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    version: u32,
    next_seq: u64,
    entries: Vec<QueueEntry>,
}

/// Durable, per-entity coalescing queue of pending changes
#[derive(Debug)]
pub struct OfflineQueue {
    path: PathBuf,
    queued: BTreeMap<EntityKey, QueueEntry>,
    in_flight: BTreeMap<u64, QueueEntry>,
    next_seq: u64,
}

impl OfflineQueue {
    /// Open the queue at `path`, restoring anything persisted by a previous run.
    /// Entries that were checked out when the process stopped are queued again.
    pub fn open(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let path = path.into();
        let mut queue = Self {
            path,
            queued: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            next_seq: 1,
        };
        queue.load()?;
        Ok(queue)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&mut self) -> crate::Result<()> {
        if !self.path.exists() {
            return Ok(());
        }

        let data = fs::read(&self.path)?;
        let file: QueueFile = match serde_json::from_slice(&data) {
            Ok(file) => file,
            Err(e) => {
                let aside = self.path.with_extension("corrupt");
                tracing::warn!(
                    "Queue file {:?} is unreadable ({}), moving it to {:?}",
                    self.path,
                    e,
                    aside
                );
                fs::rename(&self.path, &aside)?;
                return Ok(());
            }
        };

        if file.version != QUEUE_FORMAT_VERSION {
            tracing::warn!(
                "Queue file version {} differs from {}, loading anyway",
                file.version,
                QUEUE_FORMAT_VERSION
            );
        }

        self.next_seq = file.next_seq.max(1);
        for entry in file.entries {
            self.next_seq = self.next_seq.max(entry.seq + 1);
            let newer = self
                .queued
                .get(&entry.key)
                .map_or(true, |existing| entry.seq > existing.seq);
            if newer {
                self.queued.insert(entry.key.clone(), entry);
            }
        }

        tracing::info!("Loaded {} pending changes from {:?}", self.queued.len(), self.path);
        Ok(())
    }

    fn persist(&self) -> crate::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = QueueFile {
            version: QUEUE_FORMAT_VERSION,
            next_seq: self.next_seq,
            entries: self
                .in_flight
                .values()
                .chain(self.queued.values())
                .cloned()
                .collect(),
        };

        let tmp = self.path.with_extension("tmp");
        {
            let mut out = File::create(&tmp)?;
            out.write_all(&serde_json::to_vec_pretty(&file)?)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Insert or replace the pending change for the snapshot's entity.
    /// Persisted before returning.
    pub fn enqueue(&mut self, snapshot: Entity, change: ChangeType) -> crate::Result<u64> {
        self.enqueue_with(snapshot, change, 0, None)
    }

    /// [`OfflineQueue::enqueue`] for a change that already failed
    /// `attempts` times outside the queue
    pub fn enqueue_with(
        &mut self,
        snapshot: Entity,
        change: ChangeType,
        attempts: u32,
        not_before: Option<DateTime<Utc>>,
    ) -> crate::Result<u64> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let key = snapshot.key();
        let entry = QueueEntry {
            seq,
            key: key.clone(),
            change,
            snapshot,
            attempts,
            enqueued_at: Utc::now(),
            not_before,
        };

        if self.queued.insert(key.clone(), entry).is_some() {
            tracing::debug!(entity = %key, "Coalesced queued change");
        }
        self.persist()?;
        Ok(seq)
    }

    /// Check out every queued entry for processing.
    ///
    /// Families come first so members can resolve their parent document.
    pub fn drain_all(&mut self) -> Vec<QueueEntry> {
        self.drain_where(|_| true)
    }

    /// Check out the entries whose backoff has elapsed
    pub fn drain_due(&mut self, now: DateTime<Utc>) -> Vec<QueueEntry> {
        self.drain_where(|e| e.is_due(now))
    }

    fn drain_where(&mut self, keep: impl Fn(&QueueEntry) -> bool) -> Vec<QueueEntry> {
        let keys: Vec<EntityKey> = self
            .queued
            .iter()
            .filter(|(_, e)| keep(e))
            .map(|(k, _)| k.clone())
            .collect();

        let mut drained: Vec<QueueEntry> = keys
            .into_iter()
            .filter_map(|k| self.queued.remove(&k))
            .collect();
        drained.sort_by(|a, b| a.key.kind.cmp(&b.key.kind).then(a.seq.cmp(&b.seq)));

        for entry in &drained {
            self.in_flight.insert(entry.seq, entry.clone());
        }
        drained
    }

    /// The checked-out entry was delivered (or dropped for good)
    pub fn complete(&mut self, seq: u64) -> crate::Result<()> {
        if self.in_flight.remove(&seq).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    /// The checked-out entry failed with a retryable error. It is queued again
    /// with its attempt counter incremented, unless a newer change for the
    /// same entity arrived meanwhile (the newer change wins).
    ///
    /// Returns false if the entry was superseded.
    pub fn retry(&mut self, seq: u64, not_before: Option<DateTime<Utc>>) -> crate::Result<bool> {
        let Some(mut entry) = self.in_flight.remove(&seq) else {
            return Ok(false);
        };

        let requeued = if self.queued.contains_key(&entry.key) {
            false
        } else {
            entry.attempts += 1;
            entry.not_before = not_before;
            self.queued.insert(entry.key.clone(), entry);
            true
        };
        self.persist()?;
        Ok(requeued)
    }

    /// Put a checked-out entry back untouched
    pub fn release(&mut self, seq: u64) -> crate::Result<()> {
        if let Some(entry) = self.in_flight.remove(&seq) {
            if !self.queued.contains_key(&entry.key) {
                self.queued.insert(entry.key.clone(), entry);
            }
            self.persist()?;
        }
        Ok(())
    }

    /// Drop the queued (not checked-out) entry for `key`, if any
    pub fn discard(&mut self, key: &EntityKey) -> crate::Result<bool> {
        if self.queued.remove(key).is_none() {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    /// Queued entries, not counting checked-out ones
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.queued.values().cloned().collect()
    }

    pub fn get(&self, key: &EntityKey) -> Option<&QueueEntry> {
        self.queued.get(key)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.queued.contains_key(key) || self.in_flight.values().any(|e| &e.key == key)
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Queued plus checked-out entries
    pub fn pending_count(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }

    /// Drop everything, including checked-out entries
    pub fn clear(&mut self) -> crate::Result<usize> {
        let dropped = self.pending_count();
        self.queued.clear();
        self.in_flight.clear();
        self.persist()?;
        tracing::info!("Cleared {} pending changes", dropped);
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trek_common::{EntityKind, Family, FamilyMember, MemberRole, Trip};

    fn trip(name: &str) -> Trip {
        Trip::new("u1", name, Utc::now())
    }

    #[test]
    fn test_enqueue_coalesces_per_entity() {
        let temp = assert_fs::TempDir::new().unwrap();
        let mut queue = OfflineQueue::open(temp.path().join("queue.json")).unwrap();

        let mut t = trip("Draft");
        queue.enqueue(t.clone().into(), ChangeType::Create).unwrap();
        t.name = "Final".to_string();
        queue.enqueue(t.clone().into(), ChangeType::Update).unwrap();

        assert_eq!(queue.len(), 1);
        let entry = queue.get(&EntityKey::new(EntityKind::Trip, &t.meta.id)).unwrap();
        match &entry.snapshot {
            Entity::Trip(snap) => assert_eq!(snap.name, "Final"),
            other => panic!("unexpected snapshot {:?}", other),
        }
    }

    #[test]
    fn test_queue_survives_reopen() {
        let temp = assert_fs::TempDir::new().unwrap();
        let path = temp.path().join("sync/queue.json");

        {
            let mut queue = OfflineQueue::open(&path).unwrap();
            queue.enqueue(trip("A").into(), ChangeType::Create).unwrap();
            queue.enqueue(trip("B").into(), ChangeType::Create).unwrap();
        }

        let queue = OfflineQueue::open(&path).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_checked_out_entries_are_recovered_after_crash() {
        let temp = assert_fs::TempDir::new().unwrap();
        let path = temp.path().join("queue.json");

        {
            let mut queue = OfflineQueue::open(&path).unwrap();
            queue.enqueue(trip("A").into(), ChangeType::Create).unwrap();
            let drained = queue.drain_all();
            assert_eq!(drained.len(), 1);
            assert!(queue.is_empty());
            // dropped without settling
        }

        let queue = OfflineQueue::open(&path).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_retry_increments_attempts() {
        let temp = assert_fs::TempDir::new().unwrap();
        let mut queue = OfflineQueue::open(temp.path().join("queue.json")).unwrap();
        queue.enqueue(trip("A").into(), ChangeType::Create).unwrap();

        let entry = queue.drain_all().remove(0);
        assert!(queue.retry(entry.seq, None).unwrap());

        let entry = queue.drain_all().remove(0);
        assert_eq!(entry.attempts, 1);
        queue.complete(entry.seq).unwrap();
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_retry_yields_to_newer_change() {
        let temp = assert_fs::TempDir::new().unwrap();
        let mut queue = OfflineQueue::open(temp.path().join("queue.json")).unwrap();

        let mut t = trip("Old");
        queue.enqueue(t.clone().into(), ChangeType::Create).unwrap();
        let entry = queue.drain_all().remove(0);

        t.name = "New".to_string();
        queue.enqueue(t.clone().into(), ChangeType::Update).unwrap();

        assert!(!queue.retry(entry.seq, None).unwrap());
        assert_eq!(queue.len(), 1);
        let remaining = queue.entries().remove(0);
        assert_eq!(remaining.attempts, 0);
        assert_eq!(remaining.change, ChangeType::Update);
    }

    #[test]
    fn test_drain_due_honours_backoff() {
        let temp = assert_fs::TempDir::new().unwrap();
        let mut queue = OfflineQueue::open(temp.path().join("queue.json")).unwrap();
        queue.enqueue(trip("A").into(), ChangeType::Create).unwrap();

        let entry = queue.drain_all().remove(0);
        let later = Utc::now() + chrono::Duration::minutes(5);
        queue.retry(entry.seq, Some(later)).unwrap();

        assert!(queue.drain_due(Utc::now()).is_empty());
        assert_eq!(queue.drain_due(later).len(), 1);
    }

    #[test]
    fn test_families_drain_before_members() {
        let temp = assert_fs::TempDir::new().unwrap();
        let mut queue = OfflineQueue::open(temp.path().join("queue.json")).unwrap();

        let family = Family::new(None, Utc::now());
        let member = FamilyMember::new("u1", &family.meta.id, MemberRole::Captain, Utc::now());
        queue.enqueue(member.into(), ChangeType::Create).unwrap();
        queue.enqueue(trip("A").into(), ChangeType::Create).unwrap();
        queue.enqueue(family.into(), ChangeType::Create).unwrap();

        let kinds: Vec<_> = queue.drain_all().iter().map(|e| e.key.kind).collect();
        assert_eq!(
            kinds,
            vec![EntityKind::Family, EntityKind::Member, EntityKind::Trip]
        );
    }

    #[test]
    fn test_discard_and_prior_attempts() {
        let temp = assert_fs::TempDir::new().unwrap();
        let mut queue = OfflineQueue::open(temp.path().join("queue.json")).unwrap();
        let t = trip("A");
        let key = EntityKey::new(EntityKind::Trip, &t.meta.id);

        queue
            .enqueue_with(t.into(), ChangeType::Create, 1, None)
            .unwrap();
        assert_eq!(queue.get(&key).unwrap().attempts, 1);

        assert!(queue.discard(&key).unwrap());
        assert!(!queue.discard(&key).unwrap());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_moved_aside() {
        let temp = assert_fs::TempDir::new().unwrap();
        let path = temp.path().join("queue.json");
        fs::write(&path, b"{not json").unwrap();

        let queue = OfflineQueue::open(&path).unwrap();
        assert!(queue.is_empty());
        assert!(temp.path().join("queue.corrupt").exists());
    }
}
