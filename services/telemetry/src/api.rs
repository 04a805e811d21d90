use crate::auth::{AccessToken, JwtVerifier};
use crate::config::ApiConfig;
use crate::ingestion::{IngestionError, Ingestor, StatusRequest};
use crate::status_store::{LastStatus, StatusStore, StoreError, UnitStatus};
use crate::upload_store::UploadStore;
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Message returned when a protected route is called without a token.
pub const MISSING_TOKEN_MESSAGE: &str = "This route requires an access token.";

/// Message returned when a token fails verification.
pub const INVALID_TOKEN_MESSAGE: &str = "Failed to authenticate token.";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub statuses: Arc<dyn StatusStore>,
    pub uploads: Arc<UploadStore>,
    pub jwt: Arc<JwtVerifier>,
}

/// Error body: `{"error": {"code": 400, "messages": [...]}}`
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    pub messages: Vec<String>,
}

impl ErrorResponse {
    fn new(code: Option<StatusCode>, messages: Vec<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.map(|c| c.as_u16()),
                messages,
            },
        }
    }
}

/// Every failure a handler can end with
#[derive(Debug)]
pub enum ApiError {
    Ingestion(IngestionError),
    MalformedBody(String),
    Store(StoreError),
    MissingToken,
    InvalidToken,
}

impl From<IngestionError> for ApiError {
    fn from(e: IngestionError) -> Self {
        ApiError::Ingestion(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::MalformedBody(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            // Tolerated: the unit is told what is missing but the call is not an error
            ApiError::Ingestion(IngestionError::MissingPicture) => (
                StatusCode::OK,
                ErrorResponse::new(None, IngestionError::MissingPicture.messages()),
            ),
            ApiError::Ingestion(e) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new(Some(StatusCode::BAD_REQUEST), e.messages()),
            ),
            ApiError::MalformedBody(message) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new(Some(StatusCode::BAD_REQUEST), vec![message]),
            ),
            ApiError::Store(e) => {
                error!(error = %e, "Status store query failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new(
                        Some(StatusCode::INTERNAL_SERVER_ERROR),
                        vec!["Failed to query statuses".to_string()],
                    ),
                )
            }
            ApiError::MissingToken => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::new(
                    Some(StatusCode::UNAUTHORIZED),
                    vec![MISSING_TOKEN_MESSAGE.to_string()],
                ),
            ),
            ApiError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::new(
                    Some(StatusCode::UNAUTHORIZED),
                    vec![INVALID_TOKEN_MESSAGE.to_string()],
                ),
            ),
        };

        (status, Json(body)).into_response()
    }
}

/// Body of a successful ingestion
#[derive(Debug, Serialize)]
pub struct CreatedStatusResponse {
    #[serde(rename = "unitStatus")]
    pub unit_status: UnitStatus,
}

/// `{"data": ...}` envelope of read endpoints
#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub data: T,
}

/// Latest status of a unit, or `{}` when it has none
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum LatestStatus {
    Found(UnitStatus),
    Empty {},
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let pictures = ServeDir::new(state.uploads.root());
    let prefix = state.uploads.url_prefix().to_string();

    let router = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route(
            "/api/units/:unit_id/status",
            get(latest_status).post(create_status),
        )
        .route("/api/statuses/last", get(last_statuses));

    let router = if prefix.is_empty() {
        router.fallback_service(pictures)
    } else {
        router.nest_service(&prefix, pictures)
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "telemetry-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.statuses.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Receive a status update and store its picture. Open to unauthenticated units.
#[instrument(skip(state, payload))]
async fn create_status(
    State(state): State<AppState>,
    Path(unit_id): Path<String>,
    payload: Result<Json<StatusRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedStatusResponse>), ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "Malformed status body");
        ApiError::from(rejection)
    })?;

    let status = state.ingestor.ingest(&unit_id, request).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedStatusResponse {
            unit_status: status,
        }),
    ))
}

/// Most recent status of a unit
#[instrument(skip(state, _token))]
async fn latest_status(
    State(state): State<AppState>,
    _token: AccessToken,
    Path(unit_id): Path<String>,
) -> Result<Json<DataResponse<LatestStatus>>, ApiError> {
    let latest = match state.statuses.latest_status(&unit_id).await? {
        Some(status) => LatestStatus::Found(status),
        None => LatestStatus::Empty {},
    };

    Ok(Json(DataResponse { data: latest }))
}

/// Most recent status time of every unit
#[instrument(skip(state, _token))]
async fn last_statuses(
    State(state): State<AppState>,
    _token: AccessToken,
) -> Result<Json<DataResponse<Vec<LastStatus>>>, ApiError> {
    let statuses = state.statuses.last_statuses().await?;
    Ok(Json(DataResponse { data: statuses }))
}

/// Start the API server, returning once `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting telemetry API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
