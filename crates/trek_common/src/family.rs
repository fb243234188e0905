//! Families and their memberships

use crate::{new_local_id, SyncMeta};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_CAPTAINS: u32 = 2;
pub const DEFAULT_MAX_SCOUTS: u32 = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Family {
    pub meta: SyncMeta,
    pub created_at: DateTime<Utc>,
    pub name: Option<String>,
    pub max_captains: u32,
    pub max_scouts: u32,
    pub share_code: Option<String>,
    pub linked_family_ids: Vec<String>,
    /// Local ids of active members. Not part of the family document; members
    /// sync through their own subcollection.
    pub member_ids: Vec<String>,
}

impl Family {
    pub fn new(name: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            meta: SyncMeta::new(new_local_id(), now),
            created_at: now,
            name,
            max_captains: DEFAULT_MAX_CAPTAINS,
            max_scouts: DEFAULT_MAX_SCOUTS,
            share_code: None,
            linked_family_ids: Vec::new(),
            member_ids: Vec::new(),
        }
    }

    /// Add a member to the active collection; returns false if already present
    pub fn attach_member(&mut self, member_id: &str) -> bool {
        if self.member_ids.iter().any(|m| m == member_id) {
            return false;
        }
        self.member_ids.push(member_id.to_string());
        true
    }

    /// Remove a member from the active collection; returns false if absent
    pub fn detach_member(&mut self, member_id: &str) -> bool {
        let before = self.member_ids.len();
        self.member_ids.retain(|m| m != member_id);
        self.member_ids.len() != before
    }

    pub fn capacity_for(&self, role: MemberRole) -> u32 {
        match role {
            MemberRole::Captain => self.max_captains,
            MemberRole::Scout => self.max_scouts,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemberRole {
    Captain,
    #[default]
    Scout,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InvitationStatus {
    #[default]
    Pending,
    Accepted,
    Declined,
}

/// Membership of a user in a family.
///
/// Identity for merging is the natural key `(user_id, family_id)`; the
/// surrogate `meta.id` may differ between devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyMember {
    pub meta: SyncMeta,
    pub user_id: String,
    pub family_id: String,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
    pub is_active: bool,
    pub invitation_status: InvitationStatus,
    pub invited_by: Option<String>,
    pub invited_at: Option<DateTime<Utc>>,
}

impl FamilyMember {
    pub fn new(
        user_id: impl Into<String>,
        family_id: impl Into<String>,
        role: MemberRole,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            meta: SyncMeta::new(new_local_id(), now),
            user_id: user_id.into(),
            family_id: family_id.into(),
            role,
            joined_at: now,
            is_active: true,
            invitation_status: InvitationStatus::Accepted,
            invited_by: None,
            invited_at: None,
        }
    }

    pub fn natural_key(&self) -> (&str, &str) {
        (&self.user_id, &self.family_id)
    }

    pub fn same_member(&self, other: &FamilyMember) -> bool {
        self.natural_key() == other.natural_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_and_detach_members() {
        let mut family = Family::new(Some("Smiths".to_string()), Utc::now());
        assert!(family.attach_member("m1"));
        assert!(!family.attach_member("m1"));
        assert!(family.attach_member("m2"));
        assert!(family.detach_member("m1"));
        assert!(!family.detach_member("m1"));
        assert_eq!(family.member_ids, vec!["m2".to_string()]);
    }

    #[test]
    fn test_natural_key_ignores_surrogate_id() {
        let now = Utc::now();
        let a = FamilyMember::new("u1", "f1", MemberRole::Scout, now);
        let b = FamilyMember::new("u1", "f1", MemberRole::Captain, now);
        assert_ne!(a.meta.id, b.meta.id);
        assert!(a.same_member(&b));
    }

    #[test]
    fn test_default_capacity() {
        let family = Family::new(None, Utc::now());
        assert_eq!(family.capacity_for(MemberRole::Captain), DEFAULT_MAX_CAPTAINS);
        assert_eq!(family.capacity_for(MemberRole::Scout), DEFAULT_MAX_SCOUTS);
    }
}
