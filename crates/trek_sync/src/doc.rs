//! Versioned remote document schemas
//!
//! Each collection has an explicit document struct. Decoding is tolerant:
//! unknown fields are ignored and every missing field falls back to a
//! documented default, so documents written by older or newer app versions
//! still load. Absent optional fields of a top-level document are written as
//! null, which a merge write applies as a field delete, so a value cleared
//! on one device is cleared remotely too. Nested region entries omit them.

use crate::remote::Document;
use crate::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use trek_common::clock::epoch;
use trek_common::family::{DEFAULT_MAX_CAPTAINS, DEFAULT_MAX_SCOUTS};
use trek_common::{
    Competition, Entity, EntityKind, Family, FamilyMember, FoundRegion, Game, GeoLocation,
    InputMethod, InvitationStatus, MemberRole, SyncMeta, Trip, TripSettings,
};

/// Schema version stamped on every document we write
pub const SCHEMA_VERSION: u32 = 1;

fn schema_version() -> u32 {
    SCHEMA_VERSION
}

fn default_true() -> bool {
    true
}

fn default_max_captains() -> u32 {
    DEFAULT_MAX_CAPTAINS
}

fn default_max_scouts() -> u32 {
    DEFAULT_MAX_SCOUTS
}

/// `foundAtLocation` payload. Missing accuracies default to 0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationDoc {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    #[serde(rename = "hAcc")]
    pub h_acc: f64,
    #[serde(rename = "vAcc")]
    pub v_acc: f64,
    pub ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoundRegionDoc {
    #[serde(rename = "regionID")]
    pub region_id: String,
    /// Missing: epoch, so any real sighting wins a merge
    #[serde(default = "epoch")]
    pub found_at: DateTime<Utc>,
    /// Missing: `manual`
    #[serde(default)]
    pub input_method: InputMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub found_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub found_at_location: Option<LocationDoc>,
}

/// `trips/{id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripDoc {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    /// Missing: the document key
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "epoch")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "epoch")]
    pub last_updated: DateTime<Utc>,
    /// Server-assigned; never written by clients
    #[serde(default, skip_serializing)]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub found_regions: Vec<FoundRegionDoc>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_true")]
    pub speech_recognition_enabled: bool,
    #[serde(default)]
    pub location_tracking_enabled: bool,
    #[serde(default = "default_true")]
    pub show_found_on_map: bool,
    #[serde(default)]
    pub enabled_countries: Vec<String>,
}

/// `families/{id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyDoc {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub local_id: Option<String>,
    #[serde(default = "epoch")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "epoch")]
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing)]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default = "default_max_captains")]
    pub max_captains: u32,
    #[serde(default = "default_max_scouts")]
    pub max_scouts: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub share_code: Option<String>,
    #[serde(default)]
    pub linked_family_ids: Option<Vec<String>>,
}

/// `families/{id}/members/{userId}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberDoc {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub id: Option<String>,
    /// Missing: the document key
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub family_id: String,
    /// Missing: `scout`
    #[serde(default)]
    pub role: MemberRole,
    #[serde(default = "epoch")]
    pub joined_at: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Missing: `pending`
    #[serde(default)]
    pub invitation_status: InvitationStatus,
    #[serde(default)]
    pub invited_by: Option<String>,
    #[serde(default)]
    pub invited_at: Option<DateTime<Utc>>,
    #[serde(default = "epoch")]
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// `games/{id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameDoc {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub trip_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub game_type: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default = "epoch")]
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "epoch")]
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// `competitions/{id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetitionDoc {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub participant_ids: Vec<String>,
    #[serde(default)]
    pub scores: BTreeMap<String, i64>,
    #[serde(default = "epoch")]
    pub starts_at: DateTime<Utc>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "epoch")]
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

fn to_document<T: Serialize>(value: &T) -> Result<Document> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(SyncError::Data(format!(
            "document encoded to non-object {}",
            other
        ))),
    }
}

fn from_document<T: DeserializeOwned>(kind: EntityKind, remote_id: &str, doc: Document) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(doc)).map_err(|e| {
        SyncError::Data(format!("malformed {} document {}: {}", kind, remote_id, e))
    })
}

/// Encode an entity into its remote document
pub fn encode(entity: &Entity) -> Result<Document> {
    match entity {
        Entity::Trip(t) => to_document(&TripDoc {
            schema_version: SCHEMA_VERSION,
            id: Some(t.meta.id.clone()),
            user_id: t.user_id.clone(),
            created_at: t.created_at,
            last_updated: t.meta.last_updated,
            last_synced_at: None,
            name: t.name.clone(),
            found_regions: t.found_regions.iter().map(region_to_doc).collect(),
            is_active: t.settings.is_active,
            speech_recognition_enabled: t.settings.speech_recognition_enabled,
            location_tracking_enabled: t.settings.location_tracking_enabled,
            show_found_on_map: t.settings.show_found_on_map,
            enabled_countries: t.enabled_countries.iter().cloned().collect(),
        }),
        Entity::Family(f) => to_document(&FamilyDoc {
            schema_version: SCHEMA_VERSION,
            local_id: Some(f.meta.id.clone()),
            created_at: f.created_at,
            last_updated: f.meta.last_updated,
            last_synced_at: None,
            max_captains: f.max_captains,
            max_scouts: f.max_scouts,
            name: f.name.clone(),
            share_code: f.share_code.clone(),
            linked_family_ids: if f.linked_family_ids.is_empty() {
                None
            } else {
                Some(f.linked_family_ids.clone())
            },
        }),
        Entity::Member(m) => to_document(&MemberDoc {
            schema_version: SCHEMA_VERSION,
            id: Some(m.meta.id.clone()),
            user_id: Some(m.user_id.clone()),
            family_id: m.family_id.clone(),
            role: m.role,
            joined_at: m.joined_at,
            is_active: m.is_active,
            invitation_status: m.invitation_status,
            invited_by: m.invited_by.clone(),
            invited_at: m.invited_at,
            last_updated: m.meta.last_updated,
            last_synced_at: None,
        }),
        Entity::Game(g) => to_document(&GameDoc {
            schema_version: SCHEMA_VERSION,
            id: Some(g.meta.id.clone()),
            user_id: g.user_id.clone(),
            trip_id: g.trip_id.clone(),
            name: g.name.clone(),
            game_type: g.game_type.clone(),
            score: g.score,
            started_at: g.started_at,
            ended_at: g.ended_at,
            is_active: g.is_active,
            last_updated: g.meta.last_updated,
            last_synced_at: None,
        }),
        Entity::Competition(c) => to_document(&CompetitionDoc {
            schema_version: SCHEMA_VERSION,
            id: Some(c.meta.id.clone()),
            user_id: c.user_id.clone(),
            name: c.name.clone(),
            participant_ids: c.participant_ids.clone(),
            scores: c.scores.clone(),
            starts_at: c.starts_at,
            ends_at: c.ends_at,
            is_active: c.is_active,
            last_updated: c.meta.last_updated,
            last_synced_at: None,
        }),
    }
}

/// Decode a remote document stored under `remote_id` into a synced entity.
///
/// Documents from newer schema versions are accepted; fields this version
/// doesn't know are dropped.
pub fn decode(kind: EntityKind, remote_id: &str, doc: Document) -> Result<Entity> {
    if let Some(version) = doc.get("schemaVersion").and_then(|v| v.as_u64()) {
        if version > SCHEMA_VERSION as u64 {
            tracing::debug!(kind = %kind, remote_id, version, "Decoding newer schema version");
        }
    }

    let entity = match kind {
        EntityKind::Trip => {
            let d: TripDoc = from_document(kind, remote_id, doc)?;
            Entity::Trip(Trip {
                meta: meta_from(d.id, remote_id, d.last_updated, d.last_synced_at),
                user_id: d.user_id,
                created_at: d.created_at,
                name: d.name,
                found_regions: {
                    let mut regions: Vec<FoundRegion> =
                        d.found_regions.into_iter().map(region_from_doc).collect();
                    regions.sort_by(|a, b| {
                        a.found_at
                            .cmp(&b.found_at)
                            .then_with(|| a.region_id.cmp(&b.region_id))
                    });
                    regions
                },
                settings: TripSettings {
                    is_active: d.is_active,
                    speech_recognition_enabled: d.speech_recognition_enabled,
                    location_tracking_enabled: d.location_tracking_enabled,
                    show_found_on_map: d.show_found_on_map,
                },
                enabled_countries: d.enabled_countries.into_iter().collect::<BTreeSet<_>>(),
            })
        }
        EntityKind::Family => {
            let d: FamilyDoc = from_document(kind, remote_id, doc)?;
            Entity::Family(Family {
                meta: meta_from(d.local_id, remote_id, d.last_updated, d.last_synced_at),
                created_at: d.created_at,
                name: d.name,
                max_captains: d.max_captains,
                max_scouts: d.max_scouts,
                share_code: d.share_code,
                linked_family_ids: d.linked_family_ids.unwrap_or_default(),
                member_ids: Vec::new(),
            })
        }
        EntityKind::Member => {
            let d: MemberDoc = from_document(kind, remote_id, doc)?;
            if d.family_id.is_empty() {
                return Err(SyncError::Data(format!(
                    "member document {} has no familyId",
                    remote_id
                )));
            }
            Entity::Member(FamilyMember {
                meta: meta_from(d.id, remote_id, d.last_updated, d.last_synced_at),
                user_id: d.user_id.unwrap_or_else(|| remote_id.to_string()),
                family_id: d.family_id,
                role: d.role,
                joined_at: d.joined_at,
                is_active: d.is_active,
                invitation_status: d.invitation_status,
                invited_by: d.invited_by,
                invited_at: d.invited_at,
            })
        }
        EntityKind::Game => {
            let d: GameDoc = from_document(kind, remote_id, doc)?;
            Entity::Game(Game {
                meta: meta_from(d.id, remote_id, d.last_updated, d.last_synced_at),
                user_id: d.user_id,
                trip_id: d.trip_id,
                name: d.name,
                game_type: d.game_type,
                score: d.score,
                started_at: d.started_at,
                ended_at: d.ended_at,
                is_active: d.is_active,
            })
        }
        EntityKind::Competition => {
            let d: CompetitionDoc = from_document(kind, remote_id, doc)?;
            Entity::Competition(Competition {
                meta: meta_from(d.id, remote_id, d.last_updated, d.last_synced_at),
                user_id: d.user_id,
                name: d.name,
                participant_ids: d.participant_ids,
                scores: d.scores,
                starts_at: d.starts_at,
                ends_at: d.ends_at,
                is_active: d.is_active,
            })
        }
    };
    Ok(entity)
}

fn meta_from(
    local_id: Option<String>,
    remote_id: &str,
    last_updated: DateTime<Utc>,
    last_synced_at: Option<DateTime<Utc>>,
) -> SyncMeta {
    let id = local_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| remote_id.to_string());
    SyncMeta::from_remote(id, remote_id, last_updated, last_synced_at)
}

fn region_to_doc(r: &FoundRegion) -> FoundRegionDoc {
    FoundRegionDoc {
        region_id: r.region_id.clone(),
        found_at: r.found_at,
        input_method: r.input_method,
        found_by: r.found_by.clone(),
        found_at_location: r.location.as_ref().map(|l| LocationDoc {
            lat: l.latitude,
            lon: l.longitude,
            alt: l.altitude,
            h_acc: l.horizontal_accuracy,
            v_acc: l.vertical_accuracy,
            ts: Some(l.timestamp),
        }),
    }
}

fn region_from_doc(d: FoundRegionDoc) -> FoundRegion {
    let found_at = d.found_at;
    FoundRegion {
        region_id: d.region_id,
        found_at,
        input_method: d.input_method,
        found_by: d.found_by,
        location: d.found_at_location.map(|l| GeoLocation {
            latitude: l.lat,
            longitude: l.lon,
            altitude: l.alt,
            horizontal_accuracy: l.h_acc,
            vertical_accuracy: l.v_acc,
            timestamp: l.ts.unwrap_or(found_at),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::SERVER_TIMESTAMP_FIELD;
    use serde_json::json;
    use trek_common::SyncStatus;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_trip_encode_decode_preserves_fields() {
        let now = Utc::now();
        let mut trip = Trip::new("u1", "Coast", now);
        trip.enabled_countries.insert("US".to_string());
        trip.mark_found(
            FoundRegion::new("CA", now)
                .with_input(InputMethod::Voice)
                .with_finder("u2")
                .with_location(GeoLocation {
                    latitude: 37.7,
                    longitude: -122.4,
                    altitude: 10.0,
                    horizontal_accuracy: 5.0,
                    vertical_accuracy: 3.0,
                    timestamp: now,
                }),
        );

        let encoded = encode(&Entity::Trip(trip.clone())).unwrap();
        assert_eq!(encoded["id"], json!(trip.meta.id));
        assert_eq!(encoded["foundRegions"][0]["regionID"], json!("CA"));
        assert_eq!(encoded["foundRegions"][0]["foundAtLocation"]["hAcc"], json!(5.0));
        assert!(!encoded.contains_key("lastSyncedAt"));

        let decoded = decode(EntityKind::Trip, "r1", encoded).unwrap();
        let Entity::Trip(back) = decoded else {
            panic!("expected trip");
        };
        assert_eq!(back.meta.id, trip.meta.id);
        assert_eq!(back.meta.remote_id.as_deref(), Some("r1"));
        assert_eq!(back.meta.sync_status, SyncStatus::Synced);
        assert_eq!(back.found_regions, trip.found_regions);
        assert_eq!(back.enabled_countries, trip.enabled_countries);
    }

    #[test]
    fn test_cleared_optional_fields_are_written_as_null() {
        let family = Family::new(None, Utc::now());
        let encoded = encode(&Entity::Family(family)).unwrap();
        assert!(encoded["name"].is_null());
        assert!(encoded["shareCode"].is_null());
        assert!(encoded["linkedFamilyIds"].is_null());
        // server-managed, never written by the client
        assert!(!encoded.contains_key("memberIds"));
        assert_eq!(encoded["schemaVersion"], json!(SCHEMA_VERSION));

        let decoded = decode(EntityKind::Family, "f1", encoded).unwrap();
        let Entity::Family(decoded) = decoded else {
            panic!("expected family");
        };
        assert_eq!(decoded.share_code, None);
        assert_eq!(decoded.name, None);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let decoded = decode(
            EntityKind::Member,
            "user-7",
            doc(json!({"familyId": "f1"})),
        )
        .unwrap();
        let Entity::Member(member) = decoded else {
            panic!("expected member");
        };
        assert_eq!(member.user_id, "user-7");
        assert_eq!(member.meta.id, "user-7");
        assert_eq!(member.role, MemberRole::Scout);
        assert_eq!(member.invitation_status, InvitationStatus::Pending);
        assert!(member.is_active);
        assert_eq!(member.meta.last_updated, epoch());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let decoded = decode(
            EntityKind::Game,
            "g1",
            doc(json!({
                "schemaVersion": 7,
                "name": "Plates",
                "userId": "u1",
                "hologramMode": {"enabled": true}
            })),
        )
        .unwrap();
        let Entity::Game(game) = decoded else {
            panic!("expected game");
        };
        assert_eq!(game.name, "Plates");
        assert!(game.is_active);
    }

    #[test]
    fn test_malformed_payload_is_data_error() {
        let err = decode(EntityKind::Trip, "t1", doc(json!({"name": 42}))).unwrap_err();
        assert!(matches!(err, SyncError::Data(_)));

        let err = decode(EntityKind::Member, "u1", doc(json!({}))).unwrap_err();
        assert!(matches!(err, SyncError::Data(_)));
    }

    #[test]
    fn test_server_commit_time_is_read_not_written() {
        let stamp = Utc::now();
        let mut stored = encode(&Entity::Competition(Competition::new("u1", "Cup", stamp))).unwrap();
        stored.insert(
            SERVER_TIMESTAMP_FIELD.to_string(),
            serde_json::to_value(stamp).unwrap(),
        );

        let Entity::Competition(comp) = decode(EntityKind::Competition, "c1", stored).unwrap()
        else {
            panic!("expected competition");
        };
        assert_eq!(comp.meta.last_synced_at, Some(stamp));
    }
}
