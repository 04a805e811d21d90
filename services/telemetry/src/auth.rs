use crate::api::{ApiError, AppState};
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Header carrying the access token
pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";

/// Claims of an access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user identifier)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// Verifies HS256 access tokens issued by the user service
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.key, &self.validation).map(|data| data.claims)
    }
}

/// A request that presented a valid access token
#[derive(Debug, Clone)]
pub struct AccessToken(pub Claims);

#[async_trait]
impl FromRequestParts<AppState> for AccessToken {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = token_from_headers(parts).ok_or(ApiError::MissingToken)?;

        let claims = state.jwt.verify(token).map_err(|e| {
            debug!(error = %e, "Rejected access token");
            ApiError::InvalidToken
        })?;

        Ok(AccessToken(claims))
    }
}

fn token_from_headers(parts: &Parts) -> Option<&str> {
    if let Some(value) = parts.headers.get(ACCESS_TOKEN_HEADER) {
        return value.to_str().ok();
    }

    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}
