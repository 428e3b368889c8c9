//! Core domain model for the road-condition collector.

use std::fmt;

use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "roadwatch-core";

/// Storage and log representation of every site timestamp.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

const IMAGE_STAMP_FORMAT: &str = "%Y%m%d_%H%M";
const IMAGE_VARIANT_SUFFIX: &str = "-l";
const IMAGE_EXTENSION: &str = "jpg";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("timestamp {raw:?} is not in YYYY-MM-DD HH:MM form")]
pub struct TimestampError {
    pub raw: String,
}

/// Minute-resolution wall-clock instant as reported by the monitored site.
///
/// The site publishes local time without an offset, so no zone is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SiteTimestamp(NaiveDateTime);

impl SiteTimestamp {
    pub fn new(value: NaiveDateTime) -> Self {
        Self(value)
    }

    /// Parse the canonical `YYYY-MM-DD HH:MM` form.
    pub fn parse_canonical(raw: &str) -> Result<Self, TimestampError> {
        NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
            .map(Self)
            .map_err(|_| TimestampError {
                raw: raw.to_string(),
            })
    }

    pub fn naive(&self) -> NaiveDateTime {
        self.0
    }

    pub fn canonical(&self) -> String {
        self.0.format(TIMESTAMP_FORMAT).to_string()
    }

    /// Compact stamp used in image filenames, e.g. `20260216_1050`.
    pub fn compact(&self) -> String {
        self.0.format(IMAGE_STAMP_FORMAT).to_string()
    }

    pub fn signed_offset_from(&self, other: &SiteTimestamp) -> TimeDelta {
        self.0 - other.0
    }
}

impl fmt::Display for SiteTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

impl Serialize for SiteTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical())
    }
}

impl<'de> Deserialize<'de> for SiteTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse_canonical(&raw).map_err(serde::de::Error::custom)
    }
}

/// Monitored site definition as written in the seed file, before it has a row id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationSeed {
    pub location_name: String,
    #[serde(default)]
    pub location_address: Option<String>,
    pub source_url: String,
}

/// Persisted monitored site. Created at initialization, never mutated by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: i64,
    pub location_name: String,
    pub location_address: Option<String>,
    pub source_url: String,
}

impl Location {
    pub fn station_code(&self) -> StationCode {
        StationCode::for_location(self)
    }
}

/// Filesystem-safe identity of a location, derived from its source page name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StationCode(String);

impl StationCode {
    /// `http://host/sendai/html/DR-74125.html` yields `DR-74125`; falls back to `loc-{id}`.
    pub fn for_location(location: &Location) -> Self {
        let url = location.source_url.as_str();
        let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
        let path = after_scheme.split_once('/').map(|(_, p)| p).unwrap_or_default();
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let segment = path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        let stem = match segment.rsplit_once('.') {
            Some((stem, _ext)) => stem,
            None => segment,
        };
        let code: String = stem
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        let code = code.trim_matches(['-', '_']).to_string();
        if code.is_empty() {
            Self(format!("loc-{}", location.id))
        } else {
            Self(code)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic image filename for one observation of one location.
///
/// Depends only on its inputs, so every instance computes the same name and
/// concurrent or repeated downloads converge on the same path.
pub fn image_filename(observed_at: &SiteTimestamp, station: &StationCode) -> String {
    format!(
        "{}_{}{}.{}",
        observed_at.compact(),
        station,
        IMAGE_VARIANT_SUFFIX,
        IMAGE_EXTENSION
    )
}

/// Normalized, range-checked observation ready for insert-if-absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationDraft {
    pub location_id: i64,
    pub observed_at: SiteTimestamp,
    pub captured_at: SiteTimestamp,
    pub cumulative_rainfall: Option<f64>,
    pub temperature: Option<f64>,
    pub wind_speed: Option<f64>,
    pub road_temperature: Option<f64>,
    pub road_condition: Option<String>,
    pub image_filename: String,
    pub image_url: String,
}

impl ObservationDraft {
    /// How far the camera snapshot drifted from the observation instant.
    pub fn capture_drift(&self) -> TimeDelta {
        self.captured_at.signed_offset_from(&self.observed_at).abs()
    }
}

/// Observation row as read back from storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredObservation {
    pub id: i64,
    pub location_id: i64,
    pub observed_at: String,
    pub captured_at: String,
    pub cumulative_rainfall: Option<f64>,
    pub temperature: Option<f64>,
    pub wind_speed: Option<f64>,
    pub road_temperature: Option<f64>,
    pub road_condition: Option<String>,
    pub image_filename: String,
    pub image_url: String,
    pub created_at: String,
}
