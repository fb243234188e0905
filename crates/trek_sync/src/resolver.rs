//! Conflict resolution strategies
//!
//! Entities resolve last-write-wins on `last_updated`. Found regions are
//! append-only and multi-writer, so they are union-merged whichever side
//! wins.

use crate::{Result, SyncError};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use trek_common::{Entity, FoundRegion};

/// Outcome of comparing a local revision with a remote one
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Remote is newer (or unknown locally): store `merged` as the new local
    /// state. `push_back` is set when the merge kept local regions the
    /// remote lacks, so the merged state must be uploaded.
    AdoptRemote { merged: Entity, push_back: bool },

    /// Local is newer: upload it. `merged` carries the local revision with
    /// remote-only regions folded in when there were any.
    PushLocal { merged: Option<Entity> },

    /// Same revision on both sides
    Unchanged,
}

/// Entity-level last-write-wins with a union merge of found regions
#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve local revision `local` (if any) against `remote`.
    ///
    /// Members must be matched by natural key before calling this; adoption
    /// keeps the local surrogate id either way.
    pub fn resolve(&self, local: Option<&Entity>, remote: Entity) -> Result<Resolution> {
        let Some(local) = local else {
            return Ok(Resolution::AdoptRemote {
                merged: remote,
                push_back: false,
            });
        };

        if local.kind() != remote.kind() {
            return Err(SyncError::Data(format!(
                "cannot merge {} with {}",
                local.kind(),
                remote.kind()
            )));
        }

        let local_at = local.meta().last_updated;
        let remote_at = remote.meta().last_updated;

        match remote_at.cmp(&local_at) {
            Ordering::Greater => adopt(local, remote),
            Ordering::Less => Ok(Resolution::PushLocal {
                merged: fold_remote_regions(local, &remote),
            }),
            Ordering::Equal => Ok(Resolution::Unchanged),
        }
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn adopt(local: &Entity, remote: Entity) -> Result<Resolution> {
    let mut merged = remote;
    let mut push_back = false;

    let mut meta = local.meta().clone();
    meta.adopt_remote(merged.meta())?;
    *merged.meta_mut() = meta;

    match (local, &mut merged) {
        (Entity::Trip(l), Entity::Trip(m)) => {
            let union = merge_found_regions(&l.found_regions, &m.found_regions);
            push_back = union != m.found_regions;
            m.found_regions = union;
        }
        (Entity::Family(l), Entity::Family(m)) => {
            // not part of the family document
            m.member_ids = l.member_ids.clone();
        }
        _ => {}
    }

    if push_back {
        // remote revision plus local-only regions; not yet durable remotely
        merged.meta_mut().needs_sync = true;
    }

    Ok(Resolution::AdoptRemote { merged, push_back })
}

fn fold_remote_regions(local: &Entity, remote: &Entity) -> Option<Entity> {
    let (Entity::Trip(l), Entity::Trip(r)) = (local, remote) else {
        return None;
    };
    let union = merge_found_regions(&l.found_regions, &r.found_regions);
    if union == l.found_regions {
        return None;
    }
    let mut merged = l.clone();
    merged.found_regions = union;
    Some(Entity::Trip(merged))
}

/// Union of two found-region lists keyed by `region_id`.
///
/// When both sides hold a region the later `found_at` wins, ties broken by a
/// fixed total order on the remaining fields. The result is ordered by
/// `found_at`, then `region_id`, so the merge is commutative and idempotent
/// and never drops a key present in either input.
pub fn merge_found_regions(a: &[FoundRegion], b: &[FoundRegion]) -> Vec<FoundRegion> {
    let mut by_id: BTreeMap<&str, &FoundRegion> = BTreeMap::new();
    for region in a.iter().chain(b.iter()) {
        by_id
            .entry(region.region_id.as_str())
            .and_modify(|kept| {
                if cmp_sighting(region, kept) == Ordering::Greater {
                    *kept = region;
                }
            })
            .or_insert(region);
    }

    let mut merged: Vec<FoundRegion> = by_id.into_values().cloned().collect();
    merged.sort_by(|x, y| {
        x.found_at
            .cmp(&y.found_at)
            .then_with(|| x.region_id.cmp(&y.region_id))
    });
    merged
}

fn cmp_sighting(a: &FoundRegion, b: &FoundRegion) -> Ordering {
    a.found_at
        .cmp(&b.found_at)
        .then_with(|| a.input_method.cmp(&b.input_method))
        .then_with(|| a.found_by.cmp(&b.found_by))
        .then_with(|| match (&a.location, &b.location) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x
                .timestamp
                .cmp(&y.timestamp)
                .then_with(|| x.latitude.total_cmp(&y.latitude))
                .then_with(|| x.longitude.total_cmp(&y.longitude))
                .then_with(|| x.altitude.total_cmp(&y.altitude))
                .then_with(|| x.horizontal_accuracy.total_cmp(&y.horizontal_accuracy))
                .then_with(|| x.vertical_accuracy.total_cmp(&y.vertical_accuracy)),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use trek_common::{
        Family, FamilyMember, GeoLocation, InputMethod, MemberRole, SyncMeta, SyncStatus, Trip,
    };

    fn region(id: &str, offset_secs: i64) -> FoundRegion {
        let base = chrono::DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        FoundRegion::new(id, base + Duration::seconds(offset_secs))
    }

    fn ids(regions: &[FoundRegion]) -> Vec<&str> {
        regions.iter().map(|r| r.region_id.as_str()).collect()
    }

    #[test]
    fn test_union_keeps_every_key_and_later_sighting() {
        let a = vec![region("CA", 10), region("OR", 20)];
        let b = vec![region("OR", 30), region("WA", 5)];

        let merged = merge_found_regions(&a, &b);
        assert_eq!(ids(&merged), vec!["WA", "CA", "OR"]);
        let or = merged.iter().find(|r| r.region_id == "OR").unwrap();
        assert_eq!(or.found_at, b[0].found_at);
        assert!(merged.len() >= a.len().max(b.len()));
    }

    #[test]
    fn test_merge_is_commutative_and_idempotent() {
        let a = vec![
            region("CA", 10),
            region("NV", 40).with_input(InputMethod::Voice),
        ];
        let b = vec![
            region("NV", 40).with_finder("u2"),
            region("AZ", 15),
        ];

        let ab = merge_found_regions(&a, &b);
        let ba = merge_found_regions(&b, &a);
        assert_eq!(ab, ba);
        assert_eq!(merge_found_regions(&ab, &b), ab);
        assert_eq!(merge_found_regions(&ab, &ab), ab);
    }

    #[test]
    fn test_tie_break_on_location() {
        let at = region("UT", 0).found_at;
        let loc = |lat: f64| GeoLocation {
            latitude: lat,
            longitude: 0.0,
            altitude: 0.0,
            horizontal_accuracy: 0.0,
            vertical_accuracy: 0.0,
            timestamp: at,
        };
        let a = vec![region("UT", 0).with_location(loc(1.0))];
        let b = vec![region("UT", 0).with_location(loc(2.0))];
        assert_eq!(merge_found_regions(&a, &b), merge_found_regions(&b, &a));
    }

    fn synced_trip(name: &str, at: chrono::DateTime<Utc>) -> Trip {
        let mut trip = Trip::new("u1", name, at);
        trip.meta = SyncMeta::from_remote(trip.meta.id.clone(), "r1", at, Some(at));
        trip
    }

    #[test]
    fn test_remote_newer_is_adopted_with_region_union() {
        let now = Utc::now();
        let mut local = synced_trip("old", now);
        local.mark_found(region("CA", 1));
        let mut remote = synced_trip("new", now + Duration::seconds(5));
        remote.meta.id = "other-device-id".to_string();
        remote.mark_found(region("OR", 2));

        let resolution = ConflictResolver::new()
            .resolve(Some(&local.clone().into()), remote.into())
            .unwrap();
        let Resolution::AdoptRemote { merged, push_back } = resolution else {
            panic!("expected adoption");
        };
        let Entity::Trip(merged) = merged else {
            panic!("expected trip");
        };
        assert_eq!(merged.name, "new");
        assert_eq!(merged.meta.id, local.meta.id);
        assert_eq!(ids(&merged.found_regions), vec!["CA", "OR"]);
        assert!(push_back);
        assert!(merged.meta.needs_sync);
    }

    #[test]
    fn test_local_newer_pushes_with_remote_regions_folded_in() {
        let now = Utc::now();
        let mut local = synced_trip("mine", now + Duration::seconds(5));
        local.mark_found(region("CA", 1));
        let mut remote = synced_trip("theirs", now);
        remote.mark_found(region("NV", 2));

        let resolution = ConflictResolver::new()
            .resolve(Some(&local.clone().into()), remote.into())
            .unwrap();
        let Resolution::PushLocal {
            merged: Some(Entity::Trip(merged)),
        } = resolution
        else {
            panic!("expected push with merge");
        };
        assert_eq!(merged.name, "mine");
        assert_eq!(ids(&merged.found_regions), vec!["CA", "NV"]);
    }

    #[test]
    fn test_equal_revisions_are_unchanged() {
        let now = Utc::now();
        let trip = synced_trip("same", now);
        let resolution = ConflictResolver::new()
            .resolve(Some(&trip.clone().into()), trip.into())
            .unwrap();
        assert_eq!(resolution, Resolution::Unchanged);
    }

    #[test]
    fn test_member_adoption_keeps_local_surrogate_id() {
        let now = Utc::now();
        let mut local = FamilyMember::new("u2", "f1", MemberRole::Scout, now);
        local.meta.sync_status = SyncStatus::Synced;
        let mut remote = FamilyMember::new("u2", "f1", MemberRole::Captain, now + Duration::seconds(1));
        remote.meta = SyncMeta::from_remote("device-b-id", "u2", now + Duration::seconds(1), None);

        let Resolution::AdoptRemote { merged, push_back } = ConflictResolver::new()
            .resolve(Some(&local.clone().into()), remote.into())
            .unwrap()
        else {
            panic!("expected adoption");
        };
        let Entity::Member(merged) = merged else {
            panic!("expected member");
        };
        assert!(!push_back);
        assert_eq!(merged.meta.id, local.meta.id);
        assert_eq!(merged.role, MemberRole::Captain);
        assert_eq!(merged.meta.remote_id.as_deref(), Some("u2"));
    }

    #[test]
    fn test_family_adoption_keeps_member_ids() {
        let now = Utc::now();
        let mut local = Family::new(None, now);
        local.attach_member("m1");
        let mut remote = local.clone();
        remote.member_ids.clear();
        remote.name = Some("Renamed".to_string());
        remote.meta.last_updated = now + Duration::seconds(1);

        let Resolution::AdoptRemote { merged, .. } = ConflictResolver::new()
            .resolve(Some(&local.into()), remote.into())
            .unwrap()
        else {
            panic!("expected adoption");
        };
        let Entity::Family(merged) = merged else {
            panic!("expected family");
        };
        assert_eq!(merged.member_ids, vec!["m1".to_string()]);
        assert_eq!(merged.name.as_deref(), Some("Renamed"));
    }

    #[test]
    fn test_kind_mismatch_is_data_error() {
        let now = Utc::now();
        let err = ConflictResolver::new()
            .resolve(
                Some(&Trip::new("u1", "t", now).into()),
                Family::new(None, now).into(),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::Data(_)));
    }
}
