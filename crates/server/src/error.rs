use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Error)]
pub enum SsoError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Unsupported {0}")]
    Unsupported(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Not signed in: {0}")]
    Unauthenticated(String),
    #[error("Invalid grant: {0}")]
    InvalidGrant(String),
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    #[error("Invalid client: {0}")]
    InvalidClient(String),
    #[error("Upstream provider returned no usable identity: {0}")]
    UpstreamAuthFailure(String),
    #[error("Upstream provider error {code}: {message}")]
    UpstreamApi { code: i64, message: String },
    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SsoError {
    /// OAuth2-style error code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            SsoError::InvalidRequest(_) => "invalid_request",
            SsoError::Unsupported(_) => "unsupported",
            SsoError::NotFound(_) => "not_found",
            SsoError::Unauthenticated(_) => "unauthenticated",
            SsoError::InvalidGrant(_) => "invalid_grant",
            SsoError::InvalidToken(_) => "invalid_token",
            SsoError::InvalidClient(_) => "invalid_client",
            SsoError::UpstreamAuthFailure(_) => "upstream_auth_failure",
            SsoError::UpstreamApi { .. } | SsoError::Upstream(_) => "upstream_error",
            SsoError::Database(_) | SsoError::Internal(_) => "server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            SsoError::InvalidRequest(_)
            | SsoError::Unsupported(_)
            | SsoError::InvalidGrant(_) => StatusCode::BAD_REQUEST,
            SsoError::NotFound(_) => StatusCode::NOT_FOUND,
            SsoError::Unauthenticated(_)
            | SsoError::InvalidToken(_)
            | SsoError::InvalidClient(_) => StatusCode::UNAUTHORIZED,
            SsoError::UpstreamAuthFailure(_)
            | SsoError::UpstreamApi { .. }
            | SsoError::Upstream(_) => StatusCode::BAD_GATEWAY,
            SsoError::Database(_) | SsoError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error body for browser-facing endpoints.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

/// Error body for the server-to-server endpoints, which always answer 200.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorPayload {
    pub error: String,
}

impl From<&SsoError> for ErrorPayload {
    fn from(err: &SsoError) -> Self {
        Self {
            error: err.to_string(),
        }
    }
}

impl IntoResponse for SsoError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Hide storage details from the browser
        let description = match &self {
            SsoError::Database(_) | SsoError::Internal(_) => None,
            other => Some(other.to_string()),
        };
        (
            status,
            Json(ErrorResponse {
                error: self.code().to_string(),
                error_description: description,
            }),
        )
            .into_response()
    }
}
