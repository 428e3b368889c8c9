//! Typed, range-checked observation from raw page text.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use roadwatch_core::{image_filename, Location, ObservationDraft, SiteTimestamp};
use roadwatch_storage::Url;
use thiserror::Error;

use crate::extract::{RawField, RawFields};

const FULL_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M", "%Y/%m/%d %H:%M"];
const ROAD_CONDITION_MAX_CHARS: usize = 100;
const IMAGE_EXTENSIONS: [&str; 3] = [".jpg", ".jpeg", ".png"];

/// Characters that make up the site's "no data" marker. U+2212 is a minus sign, not a dash.
const NO_DATA_DASHES: [char; 7] = ['-', '－', '‐', '―', '—', '–', 'ー'];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

pub const RAINFALL_MM: Bounds = Bounds { min: 0.0, max: 1000.0 };
pub const AIR_TEMPERATURE_C: Bounds = Bounds { min: -50.0, max: 50.0 };
pub const WIND_SPEED_MS: Bounds = Bounds { min: 0.0, max: 100.0 };
pub const ROAD_TEMPERATURE_C: Bounds = Bounds { min: -50.0, max: 80.0 };

const RAINFALL_UNITS: &[&str] = &["mm"];
const TEMPERATURE_UNITS: &[&str] = &["℃", "°C", "度"];
const WIND_UNITS: &[&str] = &["m/s"];

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("{field}: {raw:?} is not a recognised timestamp")]
    Timestamp { field: RawField, raw: String },
    #[error("{field}: {raw:?} is not a number")]
    Malformed { field: RawField, raw: String },
    #[error("{field}: {value} is outside [{min}, {max}]")]
    OutOfRange {
        field: RawField,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{field}: {len} characters exceeds the {max} character limit")]
    TooLong {
        field: RawField,
        len: usize,
        max: usize,
    },
    #[error("image reference {raw:?}: {reason}")]
    ImageUrl { raw: String, reason: String },
}

/// Convert raw page text into an `ObservationDraft` for `location`.
///
/// `page_url` is the URL the page was served from; relative image
/// references resolve against it. Any malformed field aborts the whole
/// observation; explicit "no data" markers become `None`.
pub fn normalize(
    raw: &RawFields,
    location: &Location,
    page_url: &str,
) -> Result<ObservationDraft, ValidationError> {
    let observed_at = parse_observed_at(&raw.observed_at)?;
    let captured_at = parse_captured_at(&raw.captured_at, &observed_at)?;

    let cumulative_rainfall = parse_measurement(
        RawField::CumulativeRainfall,
        &raw.cumulative_rainfall,
        RAINFALL_UNITS,
        RAINFALL_MM,
    )?;
    let temperature = parse_measurement(
        RawField::Temperature,
        &raw.temperature,
        TEMPERATURE_UNITS,
        AIR_TEMPERATURE_C,
    )?;
    let wind_speed = parse_measurement(RawField::WindSpeed, &raw.wind_speed, WIND_UNITS, WIND_SPEED_MS)?;
    let road_temperature = parse_measurement(
        RawField::RoadTemperature,
        &raw.road_temperature,
        TEMPERATURE_UNITS,
        ROAD_TEMPERATURE_C,
    )?;
    let road_condition = parse_road_condition(&raw.road_condition)?;

    let image_url = resolve_image_url(&raw.image_src, page_url)?;
    let image_filename = image_filename(&observed_at, &location.station_code());

    Ok(ObservationDraft {
        location_id: location.id,
        observed_at,
        captured_at,
        cumulative_rainfall,
        temperature,
        wind_speed,
        road_temperature,
        road_condition,
        image_filename,
        image_url,
    })
}

/// Fold full-width ASCII forms and the ideographic space to ASCII, and U+2212 to `-`.
pub fn fold_width(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
            '\u{3000}' => ' ',
            '\u{2212}' => '-',
            other => other,
        })
        .collect()
}

pub fn is_no_data(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| NO_DATA_DASHES.contains(&c))
}

fn canonical_spacing(raw: &str) -> String {
    fold_width(raw).split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_full_timestamp(text: &str) -> Option<NaiveDateTime> {
    FULL_TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
}

fn parse_observed_at(raw: &str) -> Result<SiteTimestamp, ValidationError> {
    parse_full_timestamp(&canonical_spacing(raw))
        .map(SiteTimestamp::new)
        .ok_or_else(|| ValidationError::Timestamp {
            field: RawField::ObservedAt,
            raw: raw.to_string(),
        })
}

/// Capture stamps carry month/day only; the year is the one that puts the
/// capture closest to the observation, so a Dec 31 capture next to a Jan 1
/// observation lands in the previous year.
fn parse_captured_at(raw: &str, observed_at: &SiteTimestamp) -> Result<SiteTimestamp, ValidationError> {
    let text = canonical_spacing(raw);
    let invalid = || ValidationError::Timestamp {
        field: RawField::CapturedAt,
        raw: raw.to_string(),
    };

    if let Some(full) = parse_full_timestamp(&text) {
        return Ok(SiteTimestamp::new(full));
    }

    let (date_part, time_part) = text.split_once(' ').ok_or_else(invalid)?;
    let (month, day) = date_part.split_once(['/', '-']).ok_or_else(invalid)?;
    let month: u32 = month.parse().map_err(|_| invalid())?;
    let day: u32 = day.parse().map_err(|_| invalid())?;
    let time = NaiveTime::parse_from_str(time_part, "%H:%M").map_err(|_| invalid())?;

    let anchor = observed_at.naive();
    let year = anchor.year();
    [year - 1, year, year + 1]
        .into_iter()
        .filter_map(|y| NaiveDate::from_ymd_opt(y, month, day))
        .map(|date| date.and_time(time))
        .min_by_key(|candidate| (*candidate - anchor).abs())
        .map(SiteTimestamp::new)
        .ok_or_else(invalid)
}

fn parse_measurement(
    field: RawField,
    raw: &str,
    units: &[&str],
    bounds: Bounds,
) -> Result<Option<f64>, ValidationError> {
    let folded = fold_width(raw);
    let text = folded.trim();
    if text.is_empty() || is_no_data(raw.trim()) {
        return Ok(None);
    }

    let number = units
        .iter()
        .find_map(|unit| text.strip_suffix(unit))
        .unwrap_or(text)
        .trim_end();
    // A marker that kept its unit (`---℃`). Minus signs fold to `-` but are never a marker.
    if number.is_empty() || (!raw.contains('\u{2212}') && is_no_data(number)) {
        return Ok(None);
    }
    let malformed = || ValidationError::Malformed {
        field,
        raw: raw.to_string(),
    };
    let value: f64 = number.parse().map_err(|_| malformed())?;
    if !value.is_finite() {
        return Err(malformed());
    }
    if value < bounds.min || value > bounds.max {
        return Err(ValidationError::OutOfRange {
            field,
            value,
            min: bounds.min,
            max: bounds.max,
        });
    }
    Ok(Some(value))
}

fn parse_road_condition(raw: &str) -> Result<Option<String>, ValidationError> {
    let text = raw.trim();
    if text.is_empty() || is_no_data(text) {
        return Ok(None);
    }
    let len = text.chars().count();
    if len > ROAD_CONDITION_MAX_CHARS {
        return Err(ValidationError::TooLong {
            field: RawField::RoadCondition,
            len,
            max: ROAD_CONDITION_MAX_CHARS,
        });
    }
    Ok(Some(text.to_string()))
}

fn resolve_image_url(raw: &str, page_url: &str) -> Result<String, ValidationError> {
    let fail = |reason: String| ValidationError::ImageUrl {
        raw: raw.to_string(),
        reason,
    };
    let base = Url::parse(page_url).map_err(|e| fail(format!("page url {page_url:?} is invalid: {e}")))?;
    let resolved = base
        .join(raw.trim())
        .map_err(|e| fail(format!("cannot resolve against {page_url}: {e}")))?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return Err(fail(format!("unsupported scheme {}", resolved.scheme())));
    }
    let path = resolved.path().to_ascii_lowercase();
    if !IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return Err(fail("not a jpg/jpeg/png resource".to_string()));
    }
    Ok(resolved.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_URL: &str = "http://www2.thr.mlit.go.jp/sendai/html/DR-74125.html";

    fn location() -> Location {
        Location {
            id: 1,
            location_name: "作並宿（チェーン着脱所）".to_string(),
            location_address: Some("宮城県仙台市青葉区作並".to_string()),
            source_url: PAGE_URL.to_string(),
        }
    }

    fn raw() -> RawFields {
        RawFields {
            observed_at: "2026-02-16 10:50".to_string(),
            captured_at: "02/16 10:52".to_string(),
            cumulative_rainfall: "0mm".to_string(),
            temperature: "4.7℃".to_string(),
            wind_speed: "1.9m/s".to_string(),
            road_temperature: "8.0℃".to_string(),
            road_condition: "----".to_string(),
            image_src: "image/DR-74125-l.jpg".to_string(),
            location_name: None,
            location_address: None,
        }
    }

    #[test]
    fn normalizes_typical_page_values() {
        let draft = normalize(&raw(), &location(), PAGE_URL).unwrap();
        assert_eq!(draft.location_id, 1);
        assert_eq!(draft.observed_at.to_string(), "2026-02-16 10:50");
        assert_eq!(draft.captured_at.to_string(), "2026-02-16 10:52");
        assert_eq!(draft.cumulative_rainfall, Some(0.0));
        assert_eq!(draft.temperature, Some(4.7));
        assert_eq!(draft.wind_speed, Some(1.9));
        assert_eq!(draft.road_temperature, Some(8.0));
        assert_eq!(draft.road_condition, None);
        assert_eq!(
            draft.image_url,
            "http://www2.thr.mlit.go.jp/sendai/html/image/DR-74125-l.jpg"
        );
        assert_eq!(draft.image_filename, "20260216_1050_DR-74125-l.jpg");
    }

    #[test]
    fn dash_runs_are_null_not_zero_and_not_errors() {
        let mut raw = raw();
        raw.cumulative_rainfall = "---".to_string();
        raw.temperature = "----".to_string();
        raw.wind_speed = " －－－－ ".to_string();
        raw.road_temperature = "―".to_string();
        let draft = normalize(&raw, &location(), PAGE_URL).unwrap();
        assert_eq!(draft.cumulative_rainfall, None);
        assert_eq!(draft.temperature, None);
        assert_eq!(draft.wind_speed, None);
        assert_eq!(draft.road_temperature, None);
    }

    #[test]
    fn dash_runs_followed_by_a_unit_are_still_null() {
        let mut raw = raw();
        raw.cumulative_rainfall = "----mm".to_string();
        raw.temperature = "---℃".to_string();
        raw.wind_speed = "--- m/s".to_string();
        raw.road_temperature = "－－－℃".to_string();
        let draft = normalize(&raw, &location(), PAGE_URL).unwrap();
        assert_eq!(draft.cumulative_rainfall, None);
        assert_eq!(draft.temperature, None);
        assert_eq!(draft.wind_speed, None);
        assert_eq!(draft.road_temperature, None);
    }

    #[test]
    fn minus_sign_run_is_malformed_not_a_marker() {
        for text in ["−−−", "−−−℃"] {
            let mut raw = raw();
            raw.temperature = text.to_string();
            assert_eq!(
                normalize(&raw, &location(), PAGE_URL),
                Err(ValidationError::Malformed {
                    field: RawField::Temperature,
                    raw: text.to_string(),
                })
            );
        }
    }

    #[test]
    fn non_numeric_text_is_malformed_not_null() {
        let mut raw = raw();
        raw.temperature = "欠測℃".to_string();
        assert_eq!(
            normalize(&raw, &location(), PAGE_URL),
            Err(ValidationError::Malformed {
                field: RawField::Temperature,
                raw: "欠測℃".to_string(),
            })
        );

        let mut raw = self::raw();
        raw.wind_speed = "1.9km/h".to_string();
        assert!(matches!(
            normalize(&raw, &location(), PAGE_URL),
            Err(ValidationError::Malformed { field: RawField::WindSpeed, .. })
        ));

        let mut raw = self::raw();
        raw.cumulative_rainfall = "NaNmm".to_string();
        assert!(matches!(
            normalize(&raw, &location(), PAGE_URL),
            Err(ValidationError::Malformed { field: RawField::CumulativeRainfall, .. })
        ));
    }

    #[test]
    fn implausible_temperature_is_rejected_not_clamped() {
        let mut raw = raw();
        raw.temperature = "999.0℃".to_string();
        assert_eq!(
            normalize(&raw, &location(), PAGE_URL),
            Err(ValidationError::OutOfRange {
                field: RawField::Temperature,
                value: 999.0,
                min: -50.0,
                max: 50.0,
            })
        );
    }

    #[test]
    fn negative_wind_and_rainfall_are_rejected() {
        let mut raw = raw();
        raw.wind_speed = "-0.5m/s".to_string();
        assert!(matches!(
            normalize(&raw, &location(), PAGE_URL),
            Err(ValidationError::OutOfRange { field: RawField::WindSpeed, .. })
        ));

        let mut raw = self::raw();
        raw.cumulative_rainfall = "-1mm".to_string();
        assert!(matches!(
            normalize(&raw, &location(), PAGE_URL),
            Err(ValidationError::OutOfRange { field: RawField::CumulativeRainfall, .. })
        ));
    }

    #[test]
    fn sub_zero_and_full_width_values_parse() {
        let mut raw = raw();
        raw.temperature = "−3.2℃".to_string();
        raw.road_temperature = "－１．５ ℃".to_string();
        raw.wind_speed = "２．０ｍ／ｓ".to_string();
        let draft = normalize(&raw, &location(), PAGE_URL).unwrap();
        assert_eq!(draft.temperature, Some(-3.2));
        assert_eq!(draft.road_temperature, Some(-1.5));
        assert_eq!(draft.wind_speed, Some(2.0));
    }

    #[test]
    fn capture_date_rolls_back_across_new_year() {
        let mut raw = raw();
        raw.observed_at = "2026-01-01 00:00".to_string();
        raw.captured_at = "12/31 23:58".to_string();
        let draft = normalize(&raw, &location(), PAGE_URL).unwrap();
        assert_eq!(draft.captured_at.to_string(), "2025-12-31 23:58");
    }

    #[test]
    fn capture_date_rolls_forward_across_new_year() {
        let mut raw = raw();
        raw.observed_at = "2025-12-31 23:50".to_string();
        raw.captured_at = "01/01 00:02".to_string();
        let draft = normalize(&raw, &location(), PAGE_URL).unwrap();
        assert_eq!(draft.captured_at.to_string(), "2026-01-01 00:02");
    }

    #[test]
    fn malformed_timestamps_fail_validation() {
        let mut raw = raw();
        raw.observed_at = "2026-02-16 25:99".to_string();
        assert!(matches!(
            normalize(&raw, &location(), PAGE_URL),
            Err(ValidationError::Timestamp { field: RawField::ObservedAt, .. })
        ));

        let mut raw = self::raw();
        raw.captured_at = "13/45 10:52".to_string();
        assert!(matches!(
            normalize(&raw, &location(), PAGE_URL),
            Err(ValidationError::Timestamp { field: RawField::CapturedAt, .. })
        ));
    }

    #[test]
    fn road_condition_text_passes_through() {
        let mut raw = raw();
        raw.road_condition = " 積雪あり ".to_string();
        let draft = normalize(&raw, &location(), PAGE_URL).unwrap();
        assert_eq!(draft.road_condition.as_deref(), Some("積雪あり"));

        let mut raw = self::raw();
        raw.road_condition = "x".repeat(101);
        assert!(matches!(
            normalize(&raw, &location(), PAGE_URL),
            Err(ValidationError::TooLong { len: 101, .. })
        ));
    }

    #[test]
    fn image_reference_must_be_an_http_image() {
        let mut raw = raw();
        raw.image_src = "https://cdn.example.test/DR-74125-l.jpg?t=1".to_string();
        let draft = normalize(&raw, &location(), PAGE_URL).unwrap();
        assert_eq!(draft.image_url, "https://cdn.example.test/DR-74125-l.jpg?t=1");
        assert_eq!(draft.image_filename, "20260216_1050_DR-74125-l.jpg");

        let mut raw = self::raw();
        raw.image_src = "ftp://example.test/DR-74125-l.jpg".to_string();
        assert!(matches!(
            normalize(&raw, &location(), PAGE_URL),
            Err(ValidationError::ImageUrl { .. })
        ));
    }

    #[test]
    fn filename_does_not_depend_on_site_image_name() {
        let mut first = raw();
        first.image_src = "image/DR-74125-l.jpg".to_string();
        let mut second = raw();
        second.image_src = "image/DR-99999-l.png".to_string();
        let a = normalize(&first, &location(), PAGE_URL).unwrap();
        let b = normalize(&second, &location(), PAGE_URL).unwrap();
        assert_eq!(a.image_filename, b.image_filename);
    }
}
