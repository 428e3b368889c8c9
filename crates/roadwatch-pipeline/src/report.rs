use chrono::{DateTime, Utc};
use roadwatch_core::ObservationDraft;
use roadwatch_storage::ImageOutcome;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// Telemetry headline of a freshly inserted observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationSummary {
    pub captured_at: String,
    pub temperature: Option<f64>,
    pub road_temperature: Option<f64>,
    pub wind_speed: Option<f64>,
    pub cumulative_rainfall: Option<f64>,
    pub road_condition: Option<String>,
    pub image_filename: String,
}

impl From<&ObservationDraft> for ObservationSummary {
    fn from(draft: &ObservationDraft) -> Self {
        Self {
            captured_at: draft.captured_at.canonical(),
            temperature: draft.temperature,
            road_temperature: draft.road_temperature,
            wind_speed: draft.wind_speed,
            cumulative_rainfall: draft.cumulative_rainfall,
            road_condition: draft.road_condition.clone(),
            image_filename: draft.image_filename.clone(),
        }
    }
}

/// Terminal state of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    NewObservationInserted {
        observed_at: String,
        observation_id: i64,
        summary: ObservationSummary,
    },
    DuplicateSkipped {
        observed_at: String,
    },
    FetchFailed {
        reason: String,
    },
    ExtractionFailed {
        reason: String,
    },
    ValidationFailed {
        reason: String,
    },
    PersistenceFailed {
        reason: String,
    },
}

impl Outcome {
    pub fn name(&self) -> &'static str {
        match self {
            Outcome::NewObservationInserted { .. } => "new_observation_inserted",
            Outcome::DuplicateSkipped { .. } => "duplicate_skipped",
            Outcome::FetchFailed { .. } => "fetch_failed",
            Outcome::ExtractionFailed { .. } => "extraction_failed",
            Outcome::ValidationFailed { .. } => "validation_failed",
            Outcome::PersistenceFailed { .. } => "persistence_failed",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Outcome::NewObservationInserted { .. } | Outcome::DuplicateSkipped { .. } => {
                Severity::Info
            }
            _ => Severity::Error,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::NewObservationInserted { .. } | Outcome::DuplicateSkipped { .. } => 0,
            Outcome::FetchFailed { .. } => 2,
            Outcome::ExtractionFailed { .. } => 3,
            Outcome::ValidationFailed { .. } => 4,
            Outcome::PersistenceFailed { .. } => 5,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }

    fn observed_at(&self) -> Option<&str> {
        match self {
            Outcome::NewObservationInserted { observed_at, .. }
            | Outcome::DuplicateSkipped { observed_at } => Some(observed_at),
            _ => None,
        }
    }

    fn reason(&self) -> Option<&str> {
        match self {
            Outcome::FetchFailed { reason }
            | Outcome::ExtractionFailed { reason }
            | Outcome::ValidationFailed { reason }
            | Outcome::PersistenceFailed { reason } => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub instance: String,
    pub location_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: Outcome,
    /// Absent when the invocation ended before an observation was persisted.
    pub image: Option<ImageOutcome>,
}

impl RunReport {
    /// Outcome severity, raised to `Warn` when a successful run lost its image.
    pub fn severity(&self) -> Severity {
        let image = match &self.image {
            Some(image) if image.is_failure() => Severity::Warn,
            _ => Severity::Info,
        };
        self.outcome.severity().max(image)
    }

    pub fn exit_code(&self) -> u8 {
        self.outcome.exit_code()
    }

    /// The one report line per invocation.
    pub fn emit(&self) {
        let outcome = self.outcome.name();
        let observed_at = self.outcome.observed_at().unwrap_or("-");
        let reason = self.outcome.reason().unwrap_or("-");
        let image = match &self.image {
            Some(ImageOutcome::Stored { .. }) => "stored",
            Some(ImageOutcome::AlreadyPresent { .. }) => "already_present",
            Some(ImageOutcome::DownloadFailed { .. }) => "download_failed",
            None => "not_attempted",
        };
        let elapsed_ms = (self.finished_at - self.started_at).num_milliseconds();
        match self.severity() {
            Severity::Info => info!(outcome, observed_at, image, elapsed_ms, "run report"),
            Severity::Warn => warn!(outcome, observed_at, image, elapsed_ms, "run report"),
            Severity::Error => error!(outcome, reason, image, elapsed_ms, "run report"),
        }
    }
}
