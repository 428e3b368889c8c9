//! Page field extraction and normalization for the road-condition source.

pub mod extract;
pub mod normalize;

pub use extract::{extract_fields, ExtractionError, RawField, RawFields};
pub use normalize::{normalize, ValidationError};

pub const CRATE_NAME: &str = "roadwatch-scrape";
