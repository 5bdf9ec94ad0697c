use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use std::time::Duration;

use crate::reporter::BatchSummary;

/// How the retry executor should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The destination asked us to slow down (HTTP 429).
    RateLimited,
    /// 5xx, timeouts and connection failures.
    Retryable,
    /// Everything else; retrying would not change the answer.
    Permanent,
}

/// Application-specific error types.
#[derive(Debug)]
pub enum AppError {
    /// Missing credentials or invalid settings. Raised before any network call.
    Configuration(String),
    /// The destination answered 429.
    RateLimited(String),
    /// The destination answered with a 5xx status.
    ServerError { status: u16, message: String },
    /// Connection reset, DNS failure and other transport-level errors.
    TransientNetwork(String),
    /// A single call exceeded its per-call timeout.
    Timeout(Duration),
    /// The destination rejected the request (4xx other than 429).
    PermanentRequest { status: u16, message: String },
    /// Every item of a non-empty batch failed.
    TotalBatchFailure(Box<BatchSummary>),
    /// A listed entity could not be turned into an enriched record.
    InvalidEntity(String),
    /// Resource not found error.
    NotFound(String),
    /// Bad request error (invalid input).
    BadRequest(String),
    /// Database-related errors.
    DatabaseError(sqlx::Error),
    /// Durable cache or audit storage failure.
    Storage(String),
    /// Internal server error.
    InternalError(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl AppError {
    /// Maps a non-success HTTP status from a destination into the taxonomy.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            429 => AppError::RateLimited(format!("destination returned 429: {}", body)),
            500..=599 => AppError::ServerError {
                status,
                message: body.to_string(),
            },
            _ => AppError::PermanentRequest {
                status,
                message: body.to_string(),
            },
        }
    }

    pub fn classify(&self) -> FailureClass {
        match self {
            AppError::RateLimited(_) => FailureClass::RateLimited,
            AppError::ServerError { .. } | AppError::TransientNetwork(_) | AppError::Timeout(_) => {
                FailureClass::Retryable
            }
            AppError::WithContext { source, .. } => source.classify(),
            _ => FailureClass::Permanent,
        }
    }

    /// The HTTP status observed from the destination, when there was one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AppError::RateLimited(_) => Some(429),
            AppError::ServerError { status, .. } | AppError::PermanentRequest { status, .. } => {
                Some(*status)
            }
            AppError::WithContext { source, .. } => source.status_code(),
            _ => None,
        }
    }
}

impl fmt::Display for AppError {
    /// Formats the error for display.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            AppError::RateLimited(msg) => write!(f, "Rate limited: {}", msg),
            AppError::ServerError { status, message } => {
                write!(f, "Destination error {}: {}", status, message)
            }
            AppError::TransientNetwork(msg) => write!(f, "Network error: {}", msg),
            AppError::Timeout(after) => write!(f, "Request timed out after {:?}", after),
            AppError::PermanentRequest { status, message } => {
                write!(f, "Request rejected with {}: {}", status, message)
            }
            AppError::TotalBatchFailure(summary) => write!(
                f,
                "All {} items in the batch failed",
                summary.failure_count
            ),
            AppError::InvalidEntity(msg) => write!(f, "Invalid entity: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::DatabaseError(e) => write!(f, "Database error: {}", e),
            AppError::Storage(msg) => write!(f, "Storage error: {}", msg),
            AppError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    /// Converts the error into an HTTP response.
    ///
    /// Upstream failures map to gateway statuses; a total batch failure carries
    /// the per-item detail so the dashboard can still show which leads failed.
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Configuration(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
            AppError::RateLimited(_) => (
                StatusCode::TOO_MANY_REQUESTS,
                "Destination rate limit reached".to_string(),
            ),
            AppError::ServerError { .. }
            | AppError::TransientNetwork(_)
            | AppError::PermanentRequest { .. } => {
                tracing::error!("External API error: {}", self);
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            AppError::Timeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "Destination timed out".to_string(),
            ),
            AppError::TotalBatchFailure(summary) => {
                tracing::error!(
                    failure_count = summary.failure_count,
                    "Batch dispatch failed for every item"
                );
                let body = Json(json!({
                    "success": false,
                    "error": "All items failed to dispatch",
                    "summary": summary,
                }));
                return (StatusCode::BAD_GATEWAY, body).into_response();
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::DatabaseError(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            }
            AppError::InvalidEntity(msg) | AppError::Storage(msg) | AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::WithContext { source, context } => {
                tracing::error!("Error with context: {} -> {}", context, source);
                return source.clone().into_response();
            }
        };

        let body = Json(json!({
            "success": false,
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl Clone for AppError {
    /// Clones the error.
    ///
    /// `sqlx::Error` is not cloneable, so `DatabaseError` degrades to `Storage` carrying the message.
    fn clone(&self) -> Self {
        match self {
            AppError::Configuration(msg) => AppError::Configuration(msg.clone()),
            AppError::RateLimited(msg) => AppError::RateLimited(msg.clone()),
            AppError::ServerError { status, message } => AppError::ServerError {
                status: *status,
                message: message.clone(),
            },
            AppError::TransientNetwork(msg) => AppError::TransientNetwork(msg.clone()),
            AppError::Timeout(after) => AppError::Timeout(*after),
            AppError::PermanentRequest { status, message } => AppError::PermanentRequest {
                status: *status,
                message: message.clone(),
            },
            AppError::TotalBatchFailure(summary) => AppError::TotalBatchFailure(summary.clone()),
            AppError::InvalidEntity(msg) => AppError::InvalidEntity(msg.clone()),
            AppError::NotFound(msg) => AppError::NotFound(msg.clone()),
            AppError::BadRequest(msg) => AppError::BadRequest(msg.clone()),
            AppError::DatabaseError(e) => AppError::Storage(e.to_string()),
            AppError::Storage(msg) => AppError::Storage(msg.clone()),
            AppError::InternalError(msg) => AppError::InternalError(msg.clone()),
            AppError::WithContext { source, context } => AppError::WithContext {
                source: source.clone(),
                context: context.clone(),
            },
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err)
    }
}

impl From<reqwest::Error> for AppError {
    /// Transport failures are retryable; a status carried by the error is mapped like a response.
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return AppError::TransientNetwork(format!("request timed out: {}", err));
        }
        if let Some(status) = err.status() {
            return AppError::from_status(status.as_u16(), &err.to_string());
        }
        if err.is_decode() || err.is_builder() {
            return AppError::InternalError(err.to_string());
        }
        AppError::TransientNetwork(err.to_string())
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;

    /// Add context lazily (only evaluated on error).
    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T, AppError> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: f(),
        })
    }
}

impl<T> ResultExt<T> for Result<T, sqlx::Error> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::DatabaseError(e)),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::DatabaseError(e)),
            context: f(),
        })
    }
}
