//! Completeness scoring and plausibility flagging.
//!
//! The validator never rejects a record; it attaches a 0-100 score and a
//! complete list of issues so downstream consumers can filter. Every check
//! always runs.

use serde::{Deserialize, Serialize};

use crate::models::ListingRecord;

/// Geographic bounding box for coordinate plausibility. Defaults to the
/// Santiago metropolitan area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoBounds {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl GeoBounds {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        (self.lat_min..=self.lat_max).contains(&lat) && (self.lon_min..=self.lon_max).contains(&lon)
    }
}

impl Default for GeoBounds {
    fn default() -> Self {
        Self {
            lat_min: -33.7,
            lat_max: -33.2,
            lon_min: -71.0,
            lon_max: -70.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub bounds: GeoBounds,
    /// Plausible total area for an apartment, m²
    pub area_min_m2: f64,
    pub area_max_m2: f64,
    /// Advisory acceptability threshold, half of the attainable points
    pub min_acceptable_score: u8,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            bounds: GeoBounds::default(),
            area_min_m2: 20.0,
            area_max_m2: 1000.0,
            min_acceptable_score: 50,
        }
    }
}

/// Outcome of scoring one record.
#[derive(Debug, Clone)]
pub struct Quality {
    pub score: u8,
    pub issues: Vec<String>,
    /// Advisory only; low-quality records are still persisted
    pub acceptable: bool,
}

// Fixed point weights, summing to 100
const POINTS_PRICE: u8 = 25;
const POINTS_BEDROOMS: u8 = 20;
const POINTS_AREA: u8 = 20;
const POINTS_LOCATION: u8 = 15;
const POINTS_COORDINATES: u8 = 10;
const POINTS_AMENITIES: u8 = 10;

pub struct RecordValidator {
    config: ValidatorConfig,
}

impl RecordValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Score a record for completeness and plausibility. All checks run;
    /// each failure withholds its points and appends one issue.
    pub fn score(&self, record: &ListingRecord) -> Quality {
        let mut score: u8 = 0;
        let mut issues = Vec::new();

        if record.has_price() {
            score += POINTS_PRICE;
        } else {
            issues.push("missing price information".to_string());
        }

        match record.bedrooms {
            Some(n) if n > 0 => score += POINTS_BEDROOMS,
            _ => issues.push("missing bedroom count".to_string()),
        }

        match record.total_area_m2 {
            Some(area) if (self.config.area_min_m2..=self.config.area_max_m2).contains(&area) => {
                score += POINTS_AREA;
            }
            Some(area) => issues.push(format!(
                "area {area} m2 outside plausible range {}-{} m2",
                self.config.area_min_m2, self.config.area_max_m2
            )),
            None => issues.push("missing area information".to_string()),
        }

        if record.address.is_some() || record.neighborhood.is_some() || record.comuna.is_some() {
            score += POINTS_LOCATION;
        } else {
            issues.push("missing location information".to_string());
        }

        match (record.latitude, record.longitude) {
            (Some(lat), Some(lon)) => {
                if self.config.bounds.contains(lat, lon) {
                    score += POINTS_COORDINATES;
                } else {
                    issues.push(format!("coordinates out of range: {lat}, {lon}"));
                }
            }
            _ => issues.push("missing coordinates".to_string()),
        }

        let mut seen = record.amenities.clone();
        seen.sort();
        seen.dedup();
        if seen.len() == record.amenities.len() {
            score += POINTS_AMENITIES;
        } else {
            issues.push("duplicate amenity entries".to_string());
        }

        Quality {
            score,
            issues,
            acceptable: score >= self.config.min_acceptable_score,
        }
    }

    /// Score and write the result back onto the record.
    pub fn annotate(&self, record: &mut ListingRecord) -> bool {
        let quality = self.score(record);
        record.completeness_score = quality.score;
        record.issues = quality.issues;
        quality.acceptable
    }
}

impl Default for RecordValidator {
    fn default() -> Self {
        Self::new(ValidatorConfig::default())
    }
}
