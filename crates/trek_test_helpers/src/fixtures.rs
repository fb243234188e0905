//! Entity builders for tests
//!
//! Timestamps come from [`at`] so ordering between fixtures is explicit.

use chrono::{DateTime, Duration, TimeZone, Utc};
use trek_common::{
    Competition, Family, FamilyMember, FoundRegion, Game, InputMethod, MemberRole, Trip,
};

/// Fixed instant `secs` seconds after 2024-01-01T00:00:00Z
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .expect("valid base instant")
        + Duration::seconds(secs)
}

pub fn trip(user_id: &str, name: &str) -> Trip {
    Trip::new(user_id, name, at(0))
}

/// Trip with one region per `(region_id, found_at_secs)` pair
pub fn trip_with_regions(user_id: &str, regions: &[(&str, i64)]) -> Trip {
    let mut trip = trip(user_id, "Road trip");
    for (id, secs) in regions {
        trip.mark_found(region(id, *secs));
    }
    trip
}

pub fn region(region_id: &str, found_at_secs: i64) -> FoundRegion {
    FoundRegion::new(region_id, at(found_at_secs)).with_input(InputMethod::Manual)
}

pub fn family(name: &str) -> Family {
    Family::new(Some(name.to_string()), at(0))
}

pub fn member(user_id: &str, family_id: &str, role: MemberRole) -> FamilyMember {
    FamilyMember::new(user_id, family_id, role, at(0))
}

pub fn game(user_id: &str, name: &str) -> Game {
    Game::new(user_id, name, "license-plates", at(0))
}

pub fn competition(user_id: &str, name: &str) -> Competition {
    Competition::new(user_id, name, at(0))
}
