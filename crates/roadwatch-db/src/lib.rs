//! SQLite persistence gateway: schema, location seeding and insert-if-absent observations.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use roadwatch_core::{Location, LocationSeed, ObservationDraft, StoredObservation};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "roadwatch-db";

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

const INSERT_OBSERVATION: &str = r#"
    INSERT INTO observations (
        location_id, observed_at, captured_at,
        cumulative_rainfall, temperature, wind_speed,
        road_temperature, road_condition,
        image_filename, image_url
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
    ON CONFLICT (observed_at) DO NOTHING
"#;

const SELECT_OBSERVATION_COLUMNS: &str = r#"
    SELECT id, location_id, observed_at, captured_at,
           cumulative_rainfall, temperature, wind_speed,
           road_temperature, road_condition,
           image_filename, image_url, created_at
      FROM observations
"#;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("opening database {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("applying schema migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("location id {location_id} does not exist; run `roadwatch init` first")]
    UnknownLocation { location_id: i64 },
    #[error("location {name:?} is not seeded; run `roadwatch init` first")]
    LocationNotSeeded { name: String },
    #[error("database query failed: {0}")]
    Query(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Only `init` may create the database file.
    pub create_if_missing: bool,
    /// How long a writer waits for another process's write lock.
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            busy_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted { id: i64 },
    AlreadyPresent,
}

#[derive(Debug, Clone)]
pub struct ObservationStore {
    pool: SqlitePool,
}

impl ObservationStore {
    pub async fn connect(database_url: &str, options: StoreOptions) -> Result<Self, PersistenceError> {
        let base = SqliteConnectOptions::from_str(database_url).map_err(|source| {
            PersistenceError::Connect {
                target: database_url.to_string(),
                source,
            }
        })?;
        Self::connect_with(base, options, database_url).await
    }

    pub async fn open_path(path: &Path, options: StoreOptions) -> Result<Self, PersistenceError> {
        let base = SqliteConnectOptions::new().filename(path);
        Self::connect_with(base, options, &path.display().to_string()).await
    }

    async fn connect_with(
        base: SqliteConnectOptions,
        options: StoreOptions,
        target: &str,
    ) -> Result<Self, PersistenceError> {
        let connect = base
            .create_if_missing(options.create_if_missing)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(options.busy_timeout);

        // One connection: each invocation is a sequential batch job.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(options.busy_timeout)
            .connect_with(connect)
            .await
            .map_err(|source| PersistenceError::Connect {
                target: target.to_string(),
                source,
            })?;
        debug!(target, "database opened");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply embedded DDL. Run once at initialization, never per invocation.
    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        MIGRATOR.run(&self.pool).await?;
        info!("schema migrations applied");
        Ok(())
    }

    /// Insert the seed unless a location with the same name exists, then return the stored row.
    pub async fn ensure_location(&self, seed: &LocationSeed) -> Result<Location, PersistenceError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO locations (location_name, location_address, source_url)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (location_name) DO NOTHING
            "#,
        )
        .bind(&seed.location_name)
        .bind(&seed.location_address)
        .bind(&seed.source_url)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let location = self
            .find_location(&seed.location_name)
            .await?
            .ok_or_else(|| PersistenceError::LocationNotSeeded {
                name: seed.location_name.clone(),
            })?;
        if inserted > 0 {
            info!(location_id = location.id, name = %location.location_name, "location seeded");
        }
        Ok(location)
    }

    pub async fn find_location(&self, name: &str) -> Result<Option<Location>, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT id, location_name, location_address, source_url
              FROM locations
             WHERE location_name = ?1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok::<_, sqlx::Error>(Location {
                id: row.try_get("id")?,
                location_name: row.try_get("location_name")?,
                location_address: row.try_get("location_address")?,
                source_url: row.try_get("source_url")?,
            })
        })
        .transpose()
        .map_err(PersistenceError::Query)
    }

    /// Atomic insert-if-absent keyed on `observed_at`.
    ///
    /// A single `INSERT .. ON CONFLICT DO NOTHING` statement, so two writers
    /// racing on the same timestamp yield one `Inserted` and one
    /// `AlreadyPresent`, never a constraint error.
    pub async fn insert_observation(
        &self,
        draft: &ObservationDraft,
    ) -> Result<InsertOutcome, PersistenceError> {
        let result = sqlx::query(INSERT_OBSERVATION)
            .bind(draft.location_id)
            .bind(draft.observed_at.canonical())
            .bind(draft.captured_at.canonical())
            .bind(draft.cumulative_rainfall)
            .bind(draft.temperature)
            .bind(draft.wind_speed)
            .bind(draft.road_temperature)
            .bind(&draft.road_condition)
            .bind(&draft.image_filename)
            .bind(&draft.image_url)
            .execute(&self.pool)
            .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Ok(InsertOutcome::AlreadyPresent),
            Ok(done) => Ok(InsertOutcome::Inserted {
                id: done.last_insert_rowid(),
            }),
            Err(sqlx::Error::Database(db_err)) if db_err.is_foreign_key_violation() => {
                Err(PersistenceError::UnknownLocation {
                    location_id: draft.location_id,
                })
            }
            Err(err) => Err(PersistenceError::Query(err)),
        }
    }

    pub async fn find_observation(
        &self,
        observed_at: &str,
    ) -> Result<Option<StoredObservation>, PersistenceError> {
        let sql = format!("{SELECT_OBSERVATION_COLUMNS} WHERE observed_at = ?1");
        let row = sqlx::query(&sql)
            .bind(observed_at)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(observation_from_row)
            .transpose()
            .map_err(PersistenceError::Query)
    }

    /// Newest first.
    pub async fn latest_observations(
        &self,
        limit: u32,
    ) -> Result<Vec<StoredObservation>, PersistenceError> {
        let sql = format!("{SELECT_OBSERVATION_COLUMNS} ORDER BY observed_at DESC LIMIT ?1");
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(observation_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(PersistenceError::Query)
    }

    pub async fn count_observations(&self) -> Result<i64, PersistenceError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM observations")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn observation_from_row(row: &SqliteRow) -> Result<StoredObservation, sqlx::Error> {
    Ok(StoredObservation {
        id: row.try_get("id")?,
        location_id: row.try_get("location_id")?,
        observed_at: row.try_get("observed_at")?,
        captured_at: row.try_get("captured_at")?,
        cumulative_rainfall: row.try_get("cumulative_rainfall")?,
        temperature: row.try_get("temperature")?,
        wind_speed: row.try_get("wind_speed")?,
        road_temperature: row.try_get("road_temperature")?,
        road_condition: row.try_get("road_condition")?,
        image_filename: row.try_get("image_filename")?,
        image_url: row.try_get("image_url")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use roadwatch_core::SiteTimestamp;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn seed() -> LocationSeed {
        LocationSeed {
            location_name: "作並宿（チェーン着脱所）".to_string(),
            location_address: Some("宮城県仙台市青葉区作並".to_string()),
            source_url: "http://www2.thr.mlit.go.jp/sendai/html/DR-74125.html".to_string(),
        }
    }

    fn draft(location_id: i64, observed_at: &str) -> ObservationDraft {
        ObservationDraft {
            location_id,
            observed_at: SiteTimestamp::parse_canonical(observed_at).unwrap(),
            captured_at: SiteTimestamp::parse_canonical(observed_at).unwrap(),
            cumulative_rainfall: Some(0.0),
            temperature: Some(4.7),
            wind_speed: None,
            road_temperature: Some(8.0),
            road_condition: None,
            image_filename: "20260216_1050_DR-74125-l.jpg".to_string(),
            image_url: "http://www2.thr.mlit.go.jp/sendai/html/image/DR-74125-l.jpg".to_string(),
        }
    }

    async fn initialized_store() -> (TempDir, ObservationStore, Location) {
        let dir = tempdir().expect("tempdir");
        let store = ObservationStore::open_path(
            &dir.path().join("delta_station.db"),
            StoreOptions {
                create_if_missing: true,
                busy_timeout: Duration::from_secs(5),
            },
        )
        .await
        .expect("open");
        store.migrate().await.expect("migrate");
        let location = store.ensure_location(&seed()).await.expect("seed");
        (dir, store, location)
    }

    #[tokio::test]
    async fn second_insert_of_same_timestamp_is_already_present() {
        let (_dir, store, location) = initialized_store().await;

        let first = store
            .insert_observation(&draft(location.id, "2026-02-16 10:50"))
            .await
            .unwrap();
        let second = store
            .insert_observation(&draft(location.id, "2026-02-16 10:50"))
            .await
            .unwrap();

        assert!(matches!(first, InsertOutcome::Inserted { .. }));
        assert_eq!(second, InsertOutcome::AlreadyPresent);
        assert_eq!(store.count_observations().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn nulls_round_trip_as_nulls() {
        let (_dir, store, location) = initialized_store().await;
        store
            .insert_observation(&draft(location.id, "2026-02-16 10:50"))
            .await
            .unwrap();

        let row = store
            .find_observation("2026-02-16 10:50")
            .await
            .unwrap()
            .expect("row");
        assert_eq!(row.location_id, location.id);
        assert_eq!(row.wind_speed, None);
        assert_eq!(row.road_condition, None);
        assert_eq!(row.temperature, Some(4.7));
        assert!(!row.created_at.is_empty());
    }

    #[tokio::test]
    async fn unknown_location_is_a_fatal_error_not_a_skip() {
        let (_dir, store, _location) = initialized_store().await;
        let err = store
            .insert_observation(&draft(999, "2026-02-16 10:50"))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::UnknownLocation { location_id: 999 }));
        assert_eq!(store.count_observations().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn seeding_and_migrating_are_idempotent() {
        let (_dir, store, location) = initialized_store().await;
        store.migrate().await.expect("second migrate");
        let again = store.ensure_location(&seed()).await.unwrap();
        assert_eq!(again, location);
        assert_eq!(
            store.find_location("unknown").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn run_mode_refuses_to_create_a_database() {
        let dir = tempdir().expect("tempdir");
        let result = ObservationStore::open_path(
            &dir.path().join("missing.db"),
            StoreOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(PersistenceError::Connect { .. })));
    }

    #[tokio::test]
    async fn latest_observations_are_newest_first() {
        let (_dir, store, location) = initialized_store().await;
        for ts in ["2026-02-16 10:40", "2026-02-16 10:50", "2026-02-16 10:30"] {
            store.insert_observation(&draft(location.id, ts)).await.unwrap();
        }
        let latest = store.latest_observations(2).await.unwrap();
        let stamps: Vec<_> = latest.iter().map(|o| o.observed_at.as_str()).collect();
        assert_eq!(stamps, ["2026-02-16 10:50", "2026-02-16 10:40"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_writers_insert_exactly_once() {
        let (dir, store, location) = initialized_store().await;
        let options = StoreOptions {
            create_if_missing: false,
            busy_timeout: Duration::from_secs(5),
        };
        let other = ObservationStore::open_path(&dir.path().join("delta_station.db"), options)
            .await
            .expect("second writer");

        let a = {
            let store = store.clone();
            let draft = draft(location.id, "2026-02-16 11:00");
            tokio::spawn(async move { store.insert_observation(&draft).await })
        };
        let b = {
            let draft = draft(location.id, "2026-02-16 11:00");
            tokio::spawn(async move { other.insert_observation(&draft).await })
        };
        let mut outcomes = vec![a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
        outcomes.sort_by_key(|o| matches!(o, InsertOutcome::AlreadyPresent));

        assert!(matches!(outcomes[0], InsertOutcome::Inserted { .. }));
        assert_eq!(outcomes[1], InsertOutcome::AlreadyPresent);
        assert_eq!(store.count_observations().await.unwrap(), 1);
    }
}
