//! Error responses for the operational HTTP surface

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::events::EventError;
use crate::outbox::OutboxError;
use crate::queue::QueueError;

/// Standard API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code (e.g., "NOT_FOUND", "BAD_REQUEST")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Create a 404 Not Found error
    pub fn not_found(message: impl Into<String>) -> AppError {
        AppError::NotFound(message.into())
    }

    /// Create a 400 Bad Request error
    pub fn bad_request(message: impl Into<String>) -> AppError {
        AppError::BadRequest(message.into())
    }
}

/// Application error type that can be converted to HTTP responses
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    InternalError(String),
    DatabaseError(String),
    ExternalServiceError { service: String, message: String },
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::InternalError(_) | Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ExternalServiceError { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::InternalError(_) => "INTERNAL_ERROR",
            Self::DatabaseError(_) => "DATABASE_ERROR",
            Self::ExternalServiceError { .. } => "EXTERNAL_SERVICE_ERROR",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::NotFound(resource) => format!("{} not found", resource),
            Self::BadRequest(msg) => msg.clone(),
            Self::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
            Self::DatabaseError(msg) => {
                tracing::error!("Database error: {}", msg);
                "A database error occurred".to_string()
            }
            Self::ExternalServiceError { service, message } => {
                tracing::error!("External service error ({}): {}", service, message);
                format!("External service '{}' is unavailable", service)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error = ApiError::new(self.error_code(), self.message());
        (status, Json(error)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("Resource".to_string()),
            _ => Self::DatabaseError(err.to_string()),
        }
    }
}

impl From<OutboxError> for AppError {
    fn from(err: OutboxError) -> Self {
        match err {
            OutboxError::NotFound(id) => Self::NotFound(format!("Outbox record {}", id)),
            OutboxError::Database(e) => e.into(),
            OutboxError::Validation(msg) => Self::BadRequest(msg),
            other => Self::InternalError(other.to_string()),
        }
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        Self::ExternalServiceError {
            service: "queue".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<EventError> for AppError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::Invalid(msg) => Self::BadRequest(msg),
            EventError::Handler(msg) => Self::InternalError(msg),
        }
    }
}

/// Result type alias for handlers
pub type ApiResult<T> = Result<T, AppError>;
