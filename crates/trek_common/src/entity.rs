//! Sync bookkeeping shared by every syncable record

use crate::{CommonError, Competition, Family, FamilyMember, Game, Result, Trip};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Per-entity sync state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    NotSynced,
    Pending,
    Syncing,
    Synced,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::NotSynced => "notSynced",
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
        }
    }

    /// Target state for `event`, or `None` when the transition is not allowed
    pub fn next(self, event: SyncTransition) -> Option<SyncStatus> {
        use SyncStatus::*;
        use SyncTransition::*;

        match (self, event) {
            (_, LocalEdit) => Some(Pending),
            (Pending, UploadStarted) => Some(Syncing),
            (Syncing, Acknowledged) => Some(Synced),
            (Syncing | Pending, RetryableFailure) => Some(Pending),
            // includes a synced entity whose remote revision turned out malformed
            (_, FatalFailure) => Some(Error),
            // an upload that finds a newer remote revision also lands here
            (Synced | Syncing, RemoteNewer) => Some(Pending),
            (NotSynced | Pending | Error, MergeApplied) => Some(Synced),
            _ => None,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "notSynced" => Ok(SyncStatus::NotSynced),
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" => Ok(SyncStatus::Synced),
            "error" => Ok(SyncStatus::Error),
            other => Err(CommonError::ValidationError(format!(
                "unknown sync status '{}'",
                other
            ))),
        }
    }
}

/// Events that drive the sync state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncTransition {
    LocalEdit,
    UploadStarted,
    Acknowledged,
    RetryableFailure,
    FatalFailure,
    RemoteNewer,
    MergeApplied,
}

/// Kind of local mutation reported to the sync engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

/// Sync fields common to every entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    /// Stable local identity
    pub id: String,

    /// Remote document key; bound once on first successful upload
    #[serde(default)]
    pub remote_id: Option<String>,

    pub last_updated: DateTime<Utc>,

    /// Set from the remote acknowledgment
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,

    pub needs_sync: bool,

    pub sync_status: SyncStatus,
}

impl SyncMeta {
    /// Metadata for an entity created locally and not yet handed to sync
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            remote_id: None,
            last_updated: now,
            last_synced_at: None,
            needs_sync: true,
            sync_status: SyncStatus::NotSynced,
        }
    }

    /// Metadata for an entity instantiated from a remote document.
    ///
    /// `last_synced_at` is clamped to `last_updated`, since the writer's
    /// clock may run ahead of the server's.
    pub fn from_remote(
        id: impl Into<String>,
        remote_id: impl Into<String>,
        last_updated: DateTime<Utc>,
        last_synced_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: id.into(),
            remote_id: Some(remote_id.into()),
            last_updated,
            last_synced_at: Some(synced_no_earlier_than(last_synced_at, last_updated)),
            needs_sync: false,
            sync_status: SyncStatus::Synced,
        }
    }

    /// Take over a newer remote revision described by `remote`, keeping
    /// this entity's local id and any remote id already bound.
    ///
    /// Walks `synced -> pending -> synced` (or `pending -> synced` for a
    /// local edit the remote revision supersedes).
    pub fn adopt_remote(&mut self, remote: &SyncMeta) -> Result<()> {
        if matches!(self.sync_status, SyncStatus::Synced | SyncStatus::Syncing) {
            self.apply(SyncTransition::RemoteNewer)?;
        }
        self.apply(SyncTransition::MergeApplied)?;
        if self.remote_id.is_none() {
            self.remote_id = remote.remote_id.clone();
        }
        self.last_updated = remote.last_updated;
        self.last_synced_at = Some(synced_no_earlier_than(
            remote.last_synced_at,
            remote.last_updated,
        ));
        self.needs_sync = false;
        Ok(())
    }

    pub fn apply(&mut self, event: SyncTransition) -> Result<SyncStatus> {
        let next = self
            .sync_status
            .next(event)
            .ok_or(CommonError::InvalidTransition {
                from: self.sync_status,
                event,
            })?;
        self.sync_status = next;
        Ok(next)
    }

    /// Record a local edit made at `at`
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_updated = at;
        self.needs_sync = true;
        self.sync_status = SyncStatus::Pending;
    }

    /// Record a remote acknowledgment of the current revision
    pub fn acknowledge(&mut self, committed_at: DateTime<Utc>) -> Result<()> {
        self.apply(SyncTransition::Acknowledged)?;
        self.needs_sync = false;
        self.last_synced_at = Some(synced_no_earlier_than(Some(committed_at), self.last_updated));
        Ok(())
    }

    /// Bind the remote document key. Rebinding to the same value is a no-op;
    /// rebinding to a different value is refused.
    pub fn bind_remote_id(&mut self, remote_id: &str) -> Result<()> {
        match &self.remote_id {
            Some(existing) if existing == remote_id => Ok(()),
            Some(existing) => Err(CommonError::RemoteIdRebind {
                existing: existing.clone(),
                attempted: remote_id.to_string(),
            }),
            None => {
                self.remote_id = Some(remote_id.to_string());
                Ok(())
            }
        }
    }
}

fn synced_no_earlier_than(
    synced_at: Option<DateTime<Utc>>,
    last_updated: DateTime<Utc>,
) -> DateTime<Utc> {
    synced_at.map_or(last_updated, |s| s.max(last_updated))
}

/// Syncable entity kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Family,
    Member,
    Trip,
    Game,
    Competition,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Family,
        EntityKind::Member,
        EntityKind::Trip,
        EntityKind::Game,
        EntityKind::Competition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Family => "family",
            EntityKind::Member => "member",
            EntityKind::Trip => "trip",
            EntityKind::Game => "game",
            EntityKind::Competition => "competition",
        }
    }

    /// Top-level remote collection. Members live in a per-family subcollection.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Family => "families",
            EntityKind::Member => "members",
            EntityKind::Trip => "trips",
            EntityKind::Game => "games",
            EntityKind::Competition => "competitions",
        }
    }

    /// Kinds owned by a single user and queryable by `userId`
    pub fn is_user_owned(&self) -> bool {
        matches!(
            self,
            EntityKind::Trip | EntityKind::Game | EntityKind::Competition
        )
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        EntityKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CommonError::UnknownKind(s.to_string()))
    }
}

/// Kind-qualified local identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Any syncable record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Entity {
    Family(Family),
    Member(FamilyMember),
    Trip(Trip),
    Game(Game),
    Competition(Competition),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Family(_) => EntityKind::Family,
            Entity::Member(_) => EntityKind::Member,
            Entity::Trip(_) => EntityKind::Trip,
            Entity::Game(_) => EntityKind::Game,
            Entity::Competition(_) => EntityKind::Competition,
        }
    }

    pub fn meta(&self) -> &SyncMeta {
        match self {
            Entity::Family(e) => &e.meta,
            Entity::Member(e) => &e.meta,
            Entity::Trip(e) => &e.meta,
            Entity::Game(e) => &e.meta,
            Entity::Competition(e) => &e.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut SyncMeta {
        match self {
            Entity::Family(e) => &mut e.meta,
            Entity::Member(e) => &mut e.meta,
            Entity::Trip(e) => &mut e.meta,
            Entity::Game(e) => &mut e.meta,
            Entity::Competition(e) => &mut e.meta,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta().id
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind(), self.id())
    }

    /// Owning user for user-scoped kinds
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Entity::Trip(t) => Some(&t.user_id),
            Entity::Game(g) => Some(&g.user_id),
            Entity::Competition(c) => Some(&c.user_id),
            Entity::Member(m) => Some(&m.user_id),
            Entity::Family(_) => None,
        }
    }
}

impl From<Trip> for Entity {
    fn from(t: Trip) -> Self {
        Entity::Trip(t)
    }
}

impl From<Family> for Entity {
    fn from(f: Family) -> Self {
        Entity::Family(f)
    }
}

impl From<FamilyMember> for Entity {
    fn from(m: FamilyMember) -> Self {
        Entity::Member(m)
    }
}

impl From<Game> for Entity {
    fn from(g: Game) -> Self {
        Entity::Game(g)
    }
}

impl From<Competition> for Entity {
    fn from(c: Competition) -> Self {
        Entity::Competition(c)
    }
}
