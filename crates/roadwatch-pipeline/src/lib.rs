//! One invocation of the collector: fetch, extract, normalize, persist, acquire image, report.

pub mod config;
pub mod report;
pub mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{TimeDelta, Utc};
use roadwatch_core::{Location, LocationSeed, ObservationDraft, StoredObservation};
use roadwatch_db::{InsertOutcome, ObservationStore, PersistenceError};
use roadwatch_scrape::{extract_fields, normalize, ExtractionError, RawFields, ValidationError};
use roadwatch_storage::{FetchError, HttpSource, ImageOutcome, ImageStore};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::PipelineConfig;
pub use report::{ObservationSummary, Outcome, RunReport, Severity};
pub use telemetry::init_logging;

pub const CRATE_NAME: &str = "roadwatch-pipeline";

/// Beyond this gap between camera and telemetry timestamps a warning is logged.
pub const CAPTURE_DRIFT_WARNING_MINUTES: i64 = 30;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl PipelineError {
    pub fn outcome(&self) -> Outcome {
        let reason = self.to_string();
        match self {
            PipelineError::Fetch(_) => Outcome::FetchFailed { reason },
            PipelineError::Extraction(_) => Outcome::ExtractionFailed { reason },
            PipelineError::Validation(_) => Outcome::ValidationFailed { reason },
            PipelineError::Persistence(_) => Outcome::PersistenceFailed { reason },
        }
    }
}

pub struct Pipeline {
    instance: String,
    location: Location,
    source: Arc<dyn HttpSource>,
    store: ObservationStore,
    images: ImageStore,
}

impl Pipeline {
    pub fn new(
        instance: impl Into<String>,
        location: Location,
        source: Arc<dyn HttpSource>,
        store: ObservationStore,
        images: ImageStore,
    ) -> Self {
        Self {
            instance: instance.into(),
            location,
            source,
            store,
            images,
        }
    }

    /// Open the existing database and resolve the configured location. Never creates either.
    pub async fn connect(
        config: &PipelineConfig,
        seed: &LocationSeed,
        source: Arc<dyn HttpSource>,
    ) -> Result<Self, PersistenceError> {
        let store = ObservationStore::connect(&config.database_url, config.store_options(false)).await?;
        let location = match store.find_location(&seed.location_name).await {
            Ok(Some(location)) => location,
            Ok(None) => {
                store.close().await;
                return Err(PersistenceError::LocationNotSeeded {
                    name: seed.location_name.clone(),
                });
            }
            Err(err) => {
                store.close().await;
                return Err(err);
            }
        };
        if location.source_url != seed.source_url {
            warn!(
                stored = %location.source_url,
                configured = %seed.source_url,
                "configured source_url differs from the seeded location; using the stored one"
            );
        }
        Ok(Self::new(
            config.instance.clone(),
            location,
            source,
            store,
            ImageStore::new(&config.image_dir),
        ))
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub async fn run_once(&self) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = invocation_span(run_id, &self.instance, &self.location.location_name);
        async {
            let started_at = Utc::now();
            let (outcome, image) = match self.advance().await {
                Ok(done) => done,
                Err(err) => (err.outcome(), None),
            };
            let report = RunReport {
                run_id,
                instance: self.instance.clone(),
                location_name: self.location.location_name.clone(),
                started_at,
                finished_at: Utc::now(),
                outcome,
                image,
            };
            report.emit();
            report
        }
        .instrument(span)
        .await
    }

    async fn advance(&self) -> Result<(Outcome, Option<ImageOutcome>), PipelineError> {
        let page = self.source.fetch_page(&self.location.source_url).await?;
        let raw = extract_fields(&page.body)?;
        self.check_page_identity(&raw);

        let draft = normalize(&raw, &self.location, &page.final_url)?;
        warn_on_capture_drift(&draft);

        let inserted = self.store.insert_observation(&draft).await?;
        let observed_at = draft.observed_at.canonical();
        let outcome = match inserted {
            InsertOutcome::Inserted { id } => Outcome::NewObservationInserted {
                observed_at,
                observation_id: id,
                summary: ObservationSummary::from(&draft),
            },
            InsertOutcome::AlreadyPresent => Outcome::DuplicateSkipped { observed_at },
        };

        // Also on a duplicate: fills in an image an earlier run failed to download.
        let image = self
            .images
            .acquire(self.source.as_ref(), &draft.image_url, &draft.image_filename)
            .await;
        Ok((outcome, Some(image)))
    }

    fn check_page_identity(&self, raw: &RawFields) {
        let expected = &self.location.location_name;
        if let Some(on_page) = &raw.location_name {
            if on_page.split_whitespace().collect::<String>()
                != expected.split_whitespace().collect::<String>()
            {
                warn!(on_page = %on_page, expected = %expected, "page names a different location");
            }
        }
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

fn warn_on_capture_drift(draft: &ObservationDraft) {
    let drift = draft.capture_drift();
    if drift > TimeDelta::minutes(CAPTURE_DRIFT_WARNING_MINUTES) {
        warn!(
            observed_at = %draft.observed_at,
            captured_at = %draft.captured_at,
            drift_minutes = drift.num_minutes(),
            "camera snapshot is far from the observation time"
        );
    }
}

fn invocation_span(run_id: Uuid, instance: &str, location: &str) -> tracing::Span {
    info_span!("invocation", %run_id, instance, location)
}

/// Load the seed, resolve the location and run once.
///
/// Errors are returned only for failures before the pipeline starts; a
/// missing database or location is reported as `PersistenceFailed`.
pub async fn run_invocation(config: &PipelineConfig, source: Arc<dyn HttpSource>) -> Result<RunReport> {
    let seed = config.load_location_seed()?;
    match Pipeline::connect(config, &seed, source).await {
        Ok(pipeline) => {
            let report = pipeline.run_once().await;
            pipeline.close().await;
            Ok(report)
        }
        Err(err) => {
            let run_id = Uuid::new_v4();
            let span = invocation_span(run_id, &config.instance, &seed.location_name);
            let _entered = span.enter();
            let now = Utc::now();
            let report = RunReport {
                run_id,
                instance: config.instance.clone(),
                location_name: seed.location_name.clone(),
                started_at: now,
                finished_at: now,
                outcome: PipelineError::from(err).outcome(),
                image: None,
            };
            report.emit();
            Ok(report)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InitSummary {
    pub database_url: String,
    pub image_dir: String,
    pub location: Location,
}

/// Create storage, apply migrations and seed the location. Safe to repeat and to run from both instances.
pub async fn initialize(config: &PipelineConfig) -> Result<InitSummary> {
    if let Some(parent) = config
        .database_path()
        .as_deref()
        .and_then(|p| p.parent())
        .filter(|p| !p.as_os_str().is_empty())
    {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    fs::create_dir_all(&config.image_dir)
        .await
        .with_context(|| format!("creating image directory {}", config.image_dir.display()))?;

    let seed = config.load_location_seed()?;
    let store = ObservationStore::connect(&config.database_url, config.store_options(true))
        .await
        .context("opening database for initialization")?;
    store.migrate().await.context("applying migrations")?;
    let location = store
        .ensure_location(&seed)
        .await
        .context("seeding location")?;
    store.close().await;

    info!(location_id = location.id, station = %location.station_code(), "storage initialized");
    Ok(InitSummary {
        database_url: config.database_url.clone(),
        image_dir: config.image_dir.display().to_string(),
        location,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ObservationStatus {
    #[serde(flatten)]
    pub observation: StoredObservation,
    pub image_present: bool,
}

/// Most recent observations, newest first, with whether each image is on disk.
pub async fn recent_status(config: &PipelineConfig, limit: u32) -> Result<Vec<ObservationStatus>> {
    let store = ObservationStore::connect(&config.database_url, config.store_options(false))
        .await
        .context("opening database")?;
    let images = ImageStore::new(&config.image_dir);
    let rows = store.latest_observations(limit).await;
    store.close().await;

    let mut status = Vec::new();
    for observation in rows.context("listing observations")? {
        let image_present = images.contains(&observation.image_filename).await.unwrap_or(false);
        status.push(ObservationStatus {
            observation,
            image_present,
        });
    }
    Ok(status)
}
