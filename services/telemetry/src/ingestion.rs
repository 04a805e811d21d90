//! Status ingestion.
//!
//! One call turns a status request into a stored picture and a persisted
//! status, strictly in this order:
//!
//! ```text
//! validate ─▶ decode picture ─▶ write file ─▶ persist status
//!    │              │               │               │
//!    ▼              ▼               ▼               ▼
//! MissingPicture  Decode        FileWrite        DbWrite
//! InvalidTelemetry
//! ```
//!
//! Nothing is retried. A failed persist leaves the written file in place;
//! the orphan is logged with its path.

use crate::picture::{decode_picture, PictureError, PicturePayload, PictureRequest};
use crate::status_store::{PictureDescriptor, StatusStore, StoreError, Telemetry, UnitStatus};
use crate::upload_store::{UploadError, UploadStore};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Message returned when a request carries no picture.
pub const MISSING_PICTURE_MESSAGE: &str = "Missing picture data.";

/// Terminal failures of an ingestion call.
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("{}", MISSING_PICTURE_MESSAGE)]
    MissingPicture,

    #[error("Invalid telemetry: {}", .0.join(" "))]
    InvalidTelemetry(Vec<String>),

    #[error(transparent)]
    Decode(#[from] PictureError),

    #[error(transparent)]
    FileWrite(#[from] UploadError),

    #[error(transparent)]
    DbWrite(#[from] StoreError),
}

impl IngestionError {
    /// Messages reported to the submitting unit
    pub fn messages(&self) -> Vec<String> {
        match self {
            IngestionError::InvalidTelemetry(messages) => messages.clone(),
            other => vec![other.to_string()],
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            IngestionError::MissingPicture => "missing_picture",
            IngestionError::InvalidTelemetry(_) => "invalid_telemetry",
            IngestionError::Decode(_) => "decode_failed",
            IngestionError::FileWrite(_) => "file_write_failed",
            IngestionError::DbWrite(_) => "db_write_failed",
        }
    }
}

/// Status update body as submitted by a unit
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusRequest {
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub velocity: Option<f64>,
    #[serde(default)]
    pub acceleration: Option<f64>,
    #[serde(default)]
    pub picture: Option<PictureRequest>,
}

impl StatusRequest {
    /// Split into telemetry readings and the picture, rejecting incomplete requests
    fn validate(self) -> Result<(Telemetry, PictureRequest), IngestionError> {
        let picture = self.picture.ok_or(IngestionError::MissingPicture)?;

        let missing: Vec<String> = [
            ("latitude", self.latitude),
            ("longitude", self.longitude),
            ("velocity", self.velocity),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_none())
        .map(|(name, _)| format!("Path `{}` is required.", name))
        .collect();

        match (self.latitude, self.longitude, self.velocity) {
            (Some(latitude), Some(longitude), Some(velocity)) => Ok((
                Telemetry {
                    latitude,
                    longitude,
                    velocity,
                    acceleration: self.acceleration,
                },
                picture,
            )),
            _ => Err(IngestionError::InvalidTelemetry(missing)),
        }
    }
}

/// Turns status requests into stored pictures and persisted statuses
pub struct Ingestor {
    uploads: Arc<UploadStore>,
    statuses: Arc<dyn StatusStore>,
}

impl Ingestor {
    pub fn new(uploads: Arc<UploadStore>, statuses: Arc<dyn StatusStore>) -> Self {
        Self { uploads, statuses }
    }

    /// Ingest one status update for `unit_id`
    #[instrument(skip_all, fields(unit_id = %unit_id))]
    pub async fn ingest(
        &self,
        unit_id: &str,
        request: StatusRequest,
    ) -> Result<UnitStatus, IngestionError> {
        let result = self.run(unit_id, request).await;

        let outcome = match &result {
            Ok(_) => "completed",
            Err(e) => e.outcome(),
        };
        metrics::counter!("telemetry.ingest.outcomes", "outcome" => outcome).increment(1);

        result
    }

    async fn run(
        &self,
        unit_id: &str,
        request: StatusRequest,
    ) -> Result<UnitStatus, IngestionError> {
        let (telemetry, picture) = request.validate()?;
        let payload = PicturePayload::try_from(picture)?;

        let started = Instant::now();
        let decoded = tokio::task::spawn_blocking(move || decode_picture(&payload))
            .await
            .unwrap_or_else(|e| Err(PictureError::Interrupted(e.to_string())))
            .map_err(|e| {
                warn!(error = %e, "Failed to decode picture");
                e
            })?;
        metrics::histogram!("telemetry.picture.decode_seconds")
            .record(started.elapsed().as_secs_f64());

        debug!(
            size_bytes = decoded.bytes.len(),
            width = decoded.width,
            height = decoded.height,
            "Picture decoded"
        );

        let stored = self
            .uploads
            .store_picture(&decoded.bytes)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to store picture");
                e
            })?;

        let status = UnitStatus::new(
            unit_id,
            telemetry,
            PictureDescriptor {
                url: stored.url,
                width: decoded.width,
                height: decoded.height,
            },
        );

        if let Err(e) = self.statuses.insert_status(&status).await {
            warn!(
                error = %e,
                orphan = %stored.path.display(),
                "Status not persisted, picture left without a record"
            );
            return Err(e.into());
        }

        metrics::counter!("telemetry.pictures.bytes").increment(decoded.bytes.len() as u64);

        info!(
            status_id = %status.id,
            url = %status.picture.url,
            "Status ingested"
        );

        Ok(status)
    }
}
