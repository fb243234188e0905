//! Domain-specific assertions for Trek tests

use predicates::prelude::*;
use trek_common::{FoundRegion, Trip};

/// Stderr contains none of `values`
///
/// ```rust
/// use trek_test_helpers::assertions::stderr_not_contains;
/// use predicates::prelude::*;
///
/// assert!(stderr_not_contains(&["ERROR", "WARN"]).eval("all good"));
/// ```
pub fn stderr_not_contains(values: &[&str]) -> impl Predicate<str> {
    let owned_values: Vec<String> = values.iter().map(|&s| s.to_string()).collect();
    predicate::function(move |s: &str| !owned_values.iter().any(|v| s.contains(v.as_str())))
}

/// Output parses as a single JSON value
pub fn valid_json() -> impl Predicate<str> {
    predicate::function(|s: &str| serde_json::from_str::<serde_json::Value>(s.trim()).is_ok())
}

/// Output is a JSON array with exactly `len` elements
pub fn json_array_len(len: usize) -> impl Predicate<str> {
    predicate::function(move |s: &str| {
        serde_json::from_str::<serde_json::Value>(s.trim())
            .ok()
            .and_then(|v| v.as_array().map(Vec::len))
            == Some(len)
    })
}

/// Region ids of a trip, in stored order
pub fn region_ids(trip: &Trip) -> Vec<&str> {
    trip.found_regions
        .iter()
        .map(|r| r.region_id.as_str())
        .collect()
}

/// Panics unless `regions` holds exactly one entry per region id
pub fn assert_unique_regions(regions: &[FoundRegion]) {
    let mut ids: Vec<&str> = regions.iter().map(|r| r.region_id.as_str()).collect();
    ids.sort_unstable();
    let before = ids.len();
    ids.dedup();
    assert_eq!(before, ids.len(), "duplicate region ids in {:?}", regions);
}
