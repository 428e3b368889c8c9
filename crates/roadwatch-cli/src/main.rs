use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use roadwatch_pipeline::{init_logging, initialize, recent_status, run_invocation, Outcome, PipelineConfig};
use roadwatch_storage::HttpFetcher;
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "roadwatch")]
#[command(about = "Road condition camera collector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the page once and record any new observation (default).
    Run {
        /// Print the run report as JSON on stdout.
        #[arg(long)]
        json: bool,
    },
    /// Create the database and image directory and seed the location.
    Init,
    /// List the latest observations and whether their images are on disk.
    Status {
        #[arg(long, default_value_t = 10)]
        limit: u32,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    if let Err(err) = init_logging(&config.log_file) {
        eprintln!("roadwatch: {err:#}");
        return ExitCode::from(1);
    }

    match execute(cli.command.unwrap_or(Commands::Run { json: false }), &config).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "aborted before the pipeline started");
            ExitCode::from(1)
        }
    }
}

async fn execute(command: Commands, config: &PipelineConfig) -> Result<ExitCode> {
    match command {
        Commands::Run { json } => {
            let fetcher = HttpFetcher::new(config.http_client_config())?;
            let report = run_invocation(config, Arc::new(fetcher)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let detail = match &report.outcome {
                    Outcome::NewObservationInserted { observed_at, .. }
                    | Outcome::DuplicateSkipped { observed_at } => observed_at.clone(),
                    Outcome::FetchFailed { reason }
                    | Outcome::ExtractionFailed { reason }
                    | Outcome::ValidationFailed { reason }
                    | Outcome::PersistenceFailed { reason } => reason.clone(),
                };
                println!(
                    "run complete: instance={} outcome={} {}",
                    report.instance,
                    report.outcome.name(),
                    detail
                );
            }
            Ok(ExitCode::from(report.exit_code()))
        }
        Commands::Init => {
            let summary = initialize(config).await?;
            println!(
                "initialized: location_id={} name={} station={} database={} images={}",
                summary.location.id,
                summary.location.location_name,
                summary.location.station_code(),
                summary.database_url,
                summary.image_dir
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { limit, json } => {
            let rows = recent_status(config, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
                return Ok(ExitCode::SUCCESS);
            }
            if rows.is_empty() {
                println!("no observations recorded yet");
            }
            for row in rows {
                let o = &row.observation;
                println!(
                    "{}  temp={}  road={}  wind={}  rain={}  condition={}  {} [{}]",
                    o.observed_at,
                    reading(o.temperature),
                    reading(o.road_temperature),
                    reading(o.wind_speed),
                    reading(o.cumulative_rainfall),
                    o.road_condition.as_deref().unwrap_or("-"),
                    o.image_filename,
                    if row.image_present { "present" } else { "missing" }
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn reading(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.1}"))
}
