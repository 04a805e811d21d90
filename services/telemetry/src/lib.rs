//! Fleet Telemetry Service
//!
//! Status ingestion for the fleet-tracking backend. Units post their position,
//! speed and a camera picture; the service stores the picture as a JPEG under a
//! date-partitioned uploads folder, persists the status with the picture's
//! public URL, and answers the dashboard's "latest status" queries.
//!
//! ## Features
//!
//! - **Two picture forms**: nested RGBA pixel arrays, re-encoded as JPEG, or
//!   base64 data written through unchanged
//! - **Date-partitioned uploads**: `{root}/{YYYY-MM-DD}/{random}.jpeg`, served
//!   statically under a configurable prefix
//! - **Pluggable status store**: PostgreSQL in production, in-memory otherwise
//! - **Token-protected reads**: JWT access tokens on the query endpoints
//!
//! ## Architecture
//!
//! ```text
//!  Unit                         Uploads root               PostgreSQL
//! ┌──────────────┐             ┌──────────────┐           ┌──────────────┐
//! │ POST status  │             │ {date}/      │           │ unit_statuses│
//! └──────────────┘             │   {name}.jpeg│           └──────────────┘
//!        │                     └──────────────┘                  ▲
//!        ▼                            ▲                          │
//! ┌──────────────┐             ┌──────────────┐                  │
//! │ Ingestor     │────────────▶│ Upload       │                  │
//! │ (decode)     │             │ Store        │                  │
//! └──────────────┘             └──────────────┘                  │
//!        │                                                       │
//!        └─────────────────────────────────────▶┌──────────────┐ │
//!                                               │ Status       │─┘
//!  Dashboard                                    │ Store        │
//! ┌──────────────┐  x-access-token             └──────────────┘
//! │ GET latest   │─────────────────────────────────────▲
//! └──────────────┘
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod ingestion;
pub mod picture;
pub mod status_store;
pub mod upload_store;

pub use api::{create_router, start_api_server, ApiError, AppState};
pub use auth::{AccessToken, Claims, JwtVerifier};
pub use config::Config;
pub use ingestion::{IngestionError, Ingestor, StatusRequest};
pub use picture::{decode_picture, DecodedPicture, PictureError, PicturePayload, PictureRequest};
pub use status_store::{
    LastStatus, MemoryStatusStore, PgStatusStore, PictureDescriptor, StatusStore, StoreError,
    Telemetry, UnitStatus,
};
pub use upload_store::{StoredPicture, UploadError, UploadStore};
