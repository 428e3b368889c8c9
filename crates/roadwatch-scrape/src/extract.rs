//! Locates the fields of interest in the road-condition page and returns them verbatim.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use thiserror::Error;

const LABEL_OBSERVED_AT: &str = "観測日時";
const LABEL_CAPTURED_AT: &str = "撮影日時";
const ROW_LOCATION_NAME: &str = "観測地点";

/// Telemetry table labels, in page order.
const TELEMETRY_ROWS: [(&str, RawField); 5] = [
    ("累加雨量", RawField::CumulativeRainfall),
    ("気温", RawField::Temperature),
    ("風速", RawField::WindSpeed),
    ("路面温度", RawField::RoadTemperature),
    ("路面状況", RawField::RoadCondition),
];

static ROW_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("table tr").expect("valid selector"));
static IMG_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("img[src]").expect("valid selector"));
static ADDRESS_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div.style3").expect("valid selector"));
static CAMERA_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)DR-\d+-l\.(?:jpe?g|png)(?:$|[?#])").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RawField {
    ObservedAt,
    CapturedAt,
    CumulativeRainfall,
    Temperature,
    WindSpeed,
    RoadTemperature,
    RoadCondition,
    ImageSource,
}

impl RawField {
    pub fn name(&self) -> &'static str {
        match self {
            RawField::ObservedAt => "observed_at",
            RawField::CapturedAt => "captured_at",
            RawField::CumulativeRainfall => "cumulative_rainfall",
            RawField::Temperature => "temperature",
            RawField::WindSpeed => "wind_speed",
            RawField::RoadTemperature => "road_temperature",
            RawField::RoadCondition => "road_condition",
            RawField::ImageSource => "image_source",
        }
    }
}

impl fmt::Display for RawField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("required anchor for {0} not found in page")]
    MissingAnchor(RawField),
    #[error("page text contains undecodable characters; {0} not found")]
    Encoding(RawField),
    #[error("{field} appears more than once with different values ({first:?} vs {second:?})")]
    ConflictingRows {
        field: RawField,
        first: String,
        second: String,
    },
}

/// Verbatim text located in one fetched page. Required anchors are plain
/// strings: a page missing any of them never produces a `RawFields`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawFields {
    pub observed_at: String,
    pub captured_at: String,
    pub cumulative_rainfall: String,
    pub temperature: String,
    pub wind_speed: String,
    pub road_temperature: String,
    pub road_condition: String,
    pub image_src: String,
    pub location_name: Option<String>,
    pub location_address: Option<String>,
}

pub fn extract_fields(html: &str) -> Result<RawFields, ExtractionError> {
    let document = Html::parse_document(html);
    let missing = |field: RawField| {
        if html.contains('\u{FFFD}') {
            ExtractionError::Encoding(field)
        } else {
            ExtractionError::MissingAnchor(field)
        }
    };

    let text_nodes: Vec<&str> = document.root_element().text().collect();
    let observed_at = labelled_text(&text_nodes, LABEL_OBSERVED_AT)
        .ok_or_else(|| missing(RawField::ObservedAt))?;
    let captured_at = labelled_text(&text_nodes, LABEL_CAPTURED_AT)
        .ok_or_else(|| missing(RawField::CapturedAt))?;

    let rows = two_cell_rows(&document);
    let mut telemetry: HashMap<RawField, String> = HashMap::new();
    let mut location_name = None;
    for (label, value) in rows {
        if label == ROW_LOCATION_NAME {
            location_name.get_or_insert(value);
            continue;
        }
        let Some((_, field)) = TELEMETRY_ROWS.iter().find(|(l, _)| *l == label) else {
            continue;
        };
        match telemetry.get(field) {
            Some(first) if *first != value => {
                return Err(ExtractionError::ConflictingRows {
                    field: *field,
                    first: first.clone(),
                    second: value,
                });
            }
            Some(_) => {}
            None => {
                telemetry.insert(*field, value);
            }
        }
    }
    let mut take_row = |field: RawField| telemetry.remove(&field).ok_or_else(|| missing(field));
    let cumulative_rainfall = take_row(RawField::CumulativeRainfall)?;
    let temperature = take_row(RawField::Temperature)?;
    let wind_speed = take_row(RawField::WindSpeed)?;
    let road_temperature = take_row(RawField::RoadTemperature)?;
    let road_condition = take_row(RawField::RoadCondition)?;

    let image_src = document
        .select(&IMG_SELECTOR)
        .filter_map(|img| img.value().attr("src"))
        .map(str::trim)
        .find(|src| CAMERA_SRC.is_match(src))
        .map(ToString::to_string)
        .ok_or_else(|| missing(RawField::ImageSource))?;

    let location_address = document
        .select(&ADDRESS_SELECTOR)
        .next()
        .and_then(|div| non_empty(collapse_whitespace(&div.text().collect::<String>())));

    Ok(RawFields {
        observed_at,
        captured_at,
        cumulative_rainfall,
        temperature,
        wind_speed,
        road_temperature,
        road_condition,
        image_src,
        location_name,
        location_address,
    })
}

/// Text following `label` and a colon, either in the same text node or the next non-empty one.
fn labelled_text(nodes: &[&str], label: &str) -> Option<String> {
    for (idx, node) in nodes.iter().enumerate() {
        let Some(pos) = node.find(label) else {
            continue;
        };
        let rest = node[pos + label.len()..]
            .trim_start_matches(|c: char| c.is_whitespace() || c == ':' || c == '：');
        let inline = non_empty(collapse_whitespace(cut_at_next_label(rest)));
        if inline.is_some() {
            return inline;
        }
        return nodes[idx + 1..]
            .iter()
            .map(|n| collapse_whitespace(cut_at_next_label(n)))
            .find(|n| !n.is_empty());
    }
    None
}

fn cut_at_next_label(text: &str) -> &str {
    [LABEL_OBSERVED_AT, LABEL_CAPTURED_AT]
        .iter()
        .filter_map(|label| text.find(label))
        .min()
        .map_or(text, |end| &text[..end])
}

/// `(label, value)` for every table row made of exactly two direct `th`/`td` cells.
fn two_cell_rows(document: &Html) -> Vec<(String, String)> {
    document
        .select(&ROW_SELECTOR)
        .filter_map(|row| {
            let cells: Vec<ElementRef> = row
                .children()
                .filter_map(ElementRef::wrap)
                .filter(|cell| matches!(cell.value().name(), "td" | "th"))
                .collect();
            if cells.len() != 2 {
                return None;
            }
            let label: String = cells[0].text().collect::<String>().split_whitespace().collect();
            let value = collapse_whitespace(&cells[1].text().collect::<String>());
            Some((label, value))
        })
        .collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
