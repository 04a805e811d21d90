use crate::config::DatabaseConfig;
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Errors raised by a status store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid stored status {id}: {reason}")]
    InvalidRow { id: Uuid, reason: String },
}

/// Where a status picture is stored and how big it is
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PictureDescriptor {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

/// Validated position and motion readings of one status update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Telemetry {
    pub latitude: f64,
    pub longitude: f64,
    pub velocity: f64,
    pub acceleration: Option<f64>,
}

/// One point-in-time status of a unit. Never updated once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitStatus {
    /// Time-ordered identifier
    pub id: Uuid,
    /// Owning unit
    pub unit_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub velocity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceleration: Option<f64>,
    pub picture: PictureDescriptor,
    pub created_at: DateTime<Utc>,
}

impl UnitStatus {
    /// Build a new status stamped with the current time
    pub fn new(
        unit_id: impl Into<String>,
        telemetry: Telemetry,
        picture: PictureDescriptor,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            unit_id: unit_id.into(),
            latitude: telemetry.latitude,
            longitude: telemetry.longitude,
            velocity: telemetry.velocity,
            acceleration: telemetry.acceleration,
            picture,
            // Postgres keeps microseconds
            created_at: Utc::now().trunc_subsecs(6),
        }
    }
}

/// Most recent status time of a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LastStatus {
    pub unit_id: String,
    pub created_at: DateTime<Utc>,
}

/// Persistence for unit statuses
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Persist a new status
    async fn insert_status(&self, status: &UnitStatus) -> Result<(), StoreError>;

    /// Status with the greatest creation time for a unit
    async fn latest_status(&self, unit_id: &str) -> Result<Option<UnitStatus>, StoreError>;

    /// One entry per unit carrying its greatest creation time
    async fn last_statuses(&self) -> Result<Vec<LastStatus>, StoreError>;

    /// Check that the store is reachable
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, FromRow)]
struct UnitStatusRow {
    id: Uuid,
    unit_id: String,
    latitude: f64,
    longitude: f64,
    velocity: f64,
    acceleration: Option<f64>,
    picture_url: String,
    picture_width: i64,
    picture_height: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<UnitStatusRow> for UnitStatus {
    type Error = StoreError;

    fn try_from(row: UnitStatusRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let dimension = move |value: i64| {
            u32::try_from(value).map_err(|_| StoreError::InvalidRow {
                id,
                reason: format!("picture dimension {} out of range", value),
            })
        };
        let width = dimension(row.picture_width)?;
        let height = dimension(row.picture_height)?;

        Ok(UnitStatus {
            id: row.id,
            unit_id: row.unit_id,
            latitude: row.latitude,
            longitude: row.longitude,
            velocity: row.velocity,
            acceleration: row.acceleration,
            picture: PictureDescriptor {
                url: row.picture_url,
                width,
                height,
            },
            created_at: row.created_at,
        })
    }
}

/// Status store backed by PostgreSQL
pub struct PgStatusStore {
    pool: PgPool,
}

impl PgStatusStore {
    /// Create a new store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Wrap an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl StatusStore for PgStatusStore {
    #[instrument(skip(self, status), fields(status_id = %status.id, unit_id = %status.unit_id))]
    async fn insert_status(&self, status: &UnitStatus) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO unit_statuses (
                id, unit_id, latitude, longitude, velocity, acceleration,
                picture_url, picture_width, picture_height, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, $8, $9, $10
            )
            "#,
        )
        .bind(status.id)
        .bind(&status.unit_id)
        .bind(status.latitude)
        .bind(status.longitude)
        .bind(status.velocity)
        .bind(status.acceleration)
        .bind(&status.picture.url)
        .bind(i64::from(status.picture.width))
        .bind(i64::from(status.picture.height))
        .bind(status.created_at)
        .execute(&self.pool)
        .await?;

        debug!(url = %status.picture.url, "Status persisted");

        Ok(())
    }

    async fn latest_status(&self, unit_id: &str) -> Result<Option<UnitStatus>, StoreError> {
        let row = sqlx::query_as::<_, UnitStatusRow>(
            r#"
            SELECT id, unit_id, latitude, longitude, velocity, acceleration,
                   picture_url, picture_width, picture_height, created_at
            FROM unit_statuses
            WHERE unit_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(unit_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(UnitStatus::try_from).transpose()
    }

    async fn last_statuses(&self) -> Result<Vec<LastStatus>, StoreError> {
        let statuses = sqlx::query_as::<_, LastStatus>(
            r#"
            SELECT unit_id, MAX(created_at) AS created_at
            FROM unit_statuses
            GROUP BY unit_id
            ORDER BY unit_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(statuses)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Status store kept in process memory. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStatusStore {
    statuses: RwLock<Vec<UnitStatus>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.statuses.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.read().is_empty()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn insert_status(&self, status: &UnitStatus) -> Result<(), StoreError> {
        self.statuses.write().push(status.clone());
        Ok(())
    }

    async fn latest_status(&self, unit_id: &str) -> Result<Option<UnitStatus>, StoreError> {
        let statuses = self.statuses.read();
        Ok(statuses
            .iter()
            .filter(|s| s.unit_id == unit_id)
            .max_by_key(|s| (s.created_at, s.id))
            .cloned())
    }

    async fn last_statuses(&self) -> Result<Vec<LastStatus>, StoreError> {
        let mut last: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
        for status in self.statuses.read().iter() {
            let entry = last
                .entry(status.unit_id.clone())
                .or_insert(status.created_at);
            if status.created_at > *entry {
                *entry = status.created_at;
            }
        }

        Ok(last
            .into_iter()
            .map(|(unit_id, created_at)| LastStatus {
                unit_id,
                created_at,
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
