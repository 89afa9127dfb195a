//! HTTP error handling and response types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::db::RepositoryError;
use crate::facility::FacilityError;
use crate::models::skymap::SkymapError;
use crate::services::{FollowupError, IngestError, QueryError};

/// API error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Application error type for HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Resource not found
    NotFound(String),
    /// Invalid request (validation error)
    BadRequest(String),
    /// Missing or unknown API token
    Unauthorized(String),
    /// Authenticated, but not allowed to touch this record
    Forbidden(String),
    /// Request conflicts with the current state (e.g. tiles not ready)
    Conflict(String),
    /// An upstream facility or skymap host could not be reached
    BadGateway(String),
    /// Internal server error
    Internal(String),
    /// Repository error
    Repository(RepositoryError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ApiError::new("NOT_FOUND", msg)),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ApiError::new("BAD_REQUEST", msg)),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, ApiError::new("UNAUTHORIZED", msg)),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, ApiError::new("FORBIDDEN", msg)),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, ApiError::new("CONFLICT", msg)),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, ApiError::new("BAD_GATEWAY", msg)),
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError::new("INTERNAL_ERROR", msg),
            ),
            AppError::Repository(e) => {
                let msg = e.to_string();
                match e {
                    RepositoryError::NotFound { .. } => {
                        (StatusCode::NOT_FOUND, ApiError::new("NOT_FOUND", msg))
                    }
                    RepositoryError::ValidationError { .. } => {
                        (StatusCode::BAD_REQUEST, ApiError::new("BAD_REQUEST", msg))
                    }
                    RepositoryError::Conflict { .. } => {
                        (StatusCode::CONFLICT, ApiError::new("CONFLICT", msg))
                    }
                    other => {
                        tracing::error!("repository error: {}", other);
                        let details = other.context().operation.clone();
                        let error = ApiError::new("REPOSITORY_ERROR", msg);
                        let error = match details {
                            Some(op) => error.with_details(format!("operation: {op}")),
                            None => error,
                        };
                        (StatusCode::INTERNAL_SERVER_ERROR, error)
                    }
                }
            }
        };

        (status, Json(error)).into_response()
    }
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        AppError::Repository(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<SkymapError> for AppError {
    fn from(err: SkymapError) -> Self {
        match err {
            SkymapError::Fetch(_) => AppError::BadGateway(err.to_string()),
            other => AppError::BadRequest(other.to_string()),
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::VoEvent(e) => AppError::BadRequest(e.to_string()),
            IngestError::Skymap(e) => e.into(),
            IngestError::Repository(e) => e.into(),
            IngestError::InvalidInput(msg) => AppError::BadRequest(msg),
            e @ IngestError::Forbidden(_) => AppError::Forbidden(e.to_string()),
        }
    }
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Repository(e) => e.into(),
            QueryError::Healpix(e) => AppError::BadRequest(e.to_string()),
            QueryError::InvalidInput(msg) => AppError::BadRequest(msg),
            e @ QueryError::TilesPending(_) => AppError::Conflict(e.to_string()),
        }
    }
}

impl From<FacilityError> for AppError {
    fn from(err: FacilityError) -> Self {
        match err {
            FacilityError::InvalidPayload(_) | FacilityError::NotConfigured(_) => {
                AppError::BadRequest(err.to_string())
            }
            FacilityError::Transport(_) | FacilityError::Tunnel(_) => AppError::BadGateway(err.to_string()),
            FacilityError::Token(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<FollowupError> for AppError {
    fn from(err: FollowupError) -> Self {
        match err {
            FollowupError::Repository(e) => e.into(),
            FollowupError::Facility(e) => e.into(),
            e @ FollowupError::NotFound(_) => AppError::NotFound(e.to_string()),
            e @ FollowupError::Forbidden(_) => AppError::Forbidden(e.to_string()),
        }
    }
}
