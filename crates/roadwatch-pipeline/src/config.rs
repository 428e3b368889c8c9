use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use roadwatch_core::LocationSeed;
use roadwatch_db::StoreOptions;
use roadwatch_storage::HttpClientConfig;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://outputs/database/delta_station.db";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub image_dir: PathBuf,
    pub location_file: PathBuf,
    /// Deployment label (`A`/`B`) attached to every log line of an invocation.
    pub instance: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub db_timeout_secs: u64,
    pub page_charset: String,
    pub log_file: PathBuf,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            image_dir: std::env::var("ROADWATCH_IMAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("outputs/images")),
            location_file: std::env::var("ROADWATCH_LOCATION_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("location.yaml")),
            instance: std::env::var("ROADWATCH_INSTANCE").unwrap_or_else(|_| "A".to_string()),
            user_agent: std::env::var("ROADWATCH_USER_AGENT")
                .unwrap_or_else(|_| format!("roadwatch/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: secs_from_env("ROADWATCH_HTTP_TIMEOUT_SECS", 30),
            db_timeout_secs: secs_from_env("ROADWATCH_DB_TIMEOUT_SECS", 30),
            page_charset: std::env::var("ROADWATCH_PAGE_CHARSET")
                .unwrap_or_else(|_| "utf-8".to_string()),
            log_file: std::env::var("ROADWATCH_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("outputs/scraper.log")),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            default_charset: self.page_charset.clone(),
        }
    }

    pub fn store_options(&self, create_if_missing: bool) -> StoreOptions {
        StoreOptions {
            create_if_missing,
            busy_timeout: Duration::from_secs(self.db_timeout_secs),
        }
    }

    pub fn load_location_seed(&self) -> Result<LocationSeed> {
        load_location_seed(&self.location_file)
    }

    /// Filesystem path behind `database_url`, if it names a file.
    pub fn database_path(&self) -> Option<PathBuf> {
        database_path(&self.database_url)
    }
}

fn secs_from_env(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(default)
}

pub fn load_location_seed(path: &Path) -> Result<LocationSeed> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading location seed {}", path.display()))?;
    let seed: LocationSeed = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing location seed {}", path.display()))?;
    if seed.location_name.trim().is_empty() {
        bail!("location seed {} has an empty location_name", path.display());
    }
    if !seed.source_url.starts_with("http://") && !seed.source_url.starts_with("https://") {
        bail!(
            "location seed {} source_url {:?} is not an http(s) URL",
            path.display(),
            seed.source_url
        );
    }
    Ok(seed)
}

fn database_path(database_url: &str) -> Option<PathBuf> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let file = rest.split('?').next().unwrap_or_default();
    if file.is_empty() || file == ":memory:" {
        return None;
    }
    Some(PathBuf::from(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn database_path_handles_relative_absolute_and_memory_urls() {
        assert_eq!(
            database_path(DEFAULT_DATABASE_URL),
            Some(PathBuf::from("outputs/database/delta_station.db"))
        );
        assert_eq!(
            database_path("sqlite:///var/lib/roadwatch/db.sqlite?mode=rwc"),
            Some(PathBuf::from("/var/lib/roadwatch/db.sqlite"))
        );
        assert_eq!(database_path("sqlite::memory:"), None);
        assert_eq!(database_path("postgres://localhost/db"), None);
    }

    #[test]
    fn bundled_location_seed_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../location.yaml");
        let seed = load_location_seed(&path).expect("seed");
        assert_eq!(seed.location_name, "作並宿（チェーン着脱所）");
        assert!(seed.source_url.ends_with("/DR-74125.html"));
    }

    #[test]
    fn seed_without_address_is_accepted_but_bad_url_is_not() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("location.yaml");

        std::fs::write(
            &path,
            "location_name: 試験地点\nsource_url: https://example.test/html/DR-1.html\n",
        )
        .unwrap();
        let seed = load_location_seed(&path).unwrap();
        assert_eq!(seed.location_address, None);

        std::fs::write(&path, "location_name: 試験地点\nsource_url: file:///etc/passwd\n").unwrap();
        let err = load_location_seed(&path).unwrap_err();
        assert!(err.to_string().contains("not an http(s) URL"), "{err}");
    }
}
