//! HTTP fetch + atomic image storage for the collector.

mod http;
mod images;

pub use http::{FetchError, FetchedPage, HttpClientConfig, HttpFetcher, HttpSource};
pub use images::{ImageAcquisitionError, ImageOutcome, ImageStore, StoredImage};
pub use reqwest::Url;

pub const CRATE_NAME: &str = "roadwatch-storage";
