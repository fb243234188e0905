//! Trips and the regions found on them

use crate::{new_local_id, SyncMeta};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How a region was recorded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InputMethod {
    #[default]
    Manual,
    Voice,
    Map,
}

/// Device position at the moment a region was found
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub horizontal_accuracy: f64,
    pub vertical_accuracy: f64,
    pub timestamp: DateTime<Utc>,
}

/// One region (state, province, ...) spotted during a trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoundRegion {
    #[serde(rename = "regionID")]
    pub region_id: String,
    pub found_at: DateTime<Utc>,
    #[serde(default)]
    pub input_method: InputMethod,
    #[serde(default)]
    pub found_by: Option<String>,
    #[serde(default)]
    pub location: Option<GeoLocation>,
}

impl FoundRegion {
    pub fn new(region_id: impl Into<String>, found_at: DateTime<Utc>) -> Self {
        Self {
            region_id: region_id.into(),
            found_at,
            input_method: InputMethod::Manual,
            found_by: None,
            location: None,
        }
    }

    pub fn with_input(mut self, method: InputMethod) -> Self {
        self.input_method = method;
        self
    }

    pub fn with_finder(mut self, user_id: impl Into<String>) -> Self {
        self.found_by = Some(user_id.into());
        self
    }

    pub fn with_location(mut self, location: GeoLocation) -> Self {
        self.location = Some(location);
        self
    }
}

/// Boolean trip preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TripSettings {
    pub is_active: bool,
    pub speech_recognition_enabled: bool,
    pub location_tracking_enabled: bool,
    pub show_found_on_map: bool,
}

impl Default for TripSettings {
    fn default() -> Self {
        Self {
            is_active: true,
            speech_recognition_enabled: true,
            location_tracking_enabled: false,
            show_found_on_map: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub meta: SyncMeta,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub name: String,
    /// Ordered by `found_at`
    pub found_regions: Vec<FoundRegion>,
    pub settings: TripSettings,
    pub enabled_countries: BTreeSet<String>,
}

impl Trip {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            meta: SyncMeta::new(new_local_id(), now),
            user_id: user_id.into(),
            created_at: now,
            name: name.into(),
            found_regions: Vec::new(),
            settings: TripSettings::default(),
            enabled_countries: BTreeSet::new(),
        }
    }

    /// Record a found region. An existing entry for the same region is kept
    /// unless the new sighting is later.
    pub fn mark_found(&mut self, region: FoundRegion) {
        match self
            .found_regions
            .iter_mut()
            .find(|r| r.region_id == region.region_id)
        {
            Some(existing) if region.found_at > existing.found_at => *existing = region,
            Some(_) => {}
            None => self.found_regions.push(region),
        }
        self.found_regions.sort_by(|a, b| {
            a.found_at
                .cmp(&b.found_at)
                .then_with(|| a.region_id.cmp(&b.region_id))
        });
    }

    pub fn has_found(&self, region_id: &str) -> bool {
        self.found_regions.iter().any(|r| r.region_id == region_id)
    }
}
