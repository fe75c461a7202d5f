//! # Error Handling
//!
//! Custom error types for the wake-word server and how they turn into HTTP
//! responses.
//!
//! Two audiences see these errors:
//! - **HTTP clients** (health/config/model endpoints and refused WebSocket
//!   upgrades) get a JSON body through the `ResponseError` impl.
//! - **WebSocket sessions** never see a structured error. A session that hits
//!   an `AppError` while processing a frame is closed, and the closure is the
//!   only signal the client receives.
//!
//! ## Error Categories:
//! - **Internal**: Server-side problems (500)
//! - **NotFound**: Requested resource doesn't exist (404)
//! - **ConfigError**: Configuration problems (500)
//! - **CapacityExceeded**: Session limit reached (503)
//! - **ModelLoad**: Keyword model files could not be read or parsed (500)
//! - **Classifier**: The classifier failed on a sample window (500)
//! - **Resample**: Sample-rate conversion failed (500)

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Usage Example:
/// ```rust
/// use wakeword_server::error::AppError;
///
/// let err = AppError::CapacityExceeded("Maximum concurrent sessions (64) reached".to_string());
/// assert_eq!(err.error_type(), "capacity_exceeded");
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file, environment variable or CLI flag problems
    ConfigError(String),

    /// The server is already running `max_concurrent_sessions` sessions
    CapacityExceeded(String),

    /// A keyword or feature model could not be loaded
    ModelLoad(String),

    /// The classifier raised while scoring a sample window
    Classifier(String),

    /// The resampler raised while converting a sample window
    Resample(String),
}

impl AppError {
    /// Machine-readable error type used in JSON bodies and log fields.
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::NotFound(_) => "not_found",
            AppError::ConfigError(_) => "config_error",
            AppError::CapacityExceeded(_) => "capacity_exceeded",
            AppError::ModelLoad(_) => "model_load_error",
            AppError::Classifier(_) => "classifier_error",
            AppError::Resample(_) => "resample_error",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::NotFound(msg)
            | AppError::ConfigError(msg)
            | AppError::CapacityExceeded(msg)
            | AppError::ModelLoad(msg)
            | AppError::Classifier(msg)
            | AppError::Resample(msg) => msg,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::CapacityExceeded(msg) => write!(f, "Capacity exceeded: {}", msg),
            AppError::ModelLoad(msg) => write!(f, "Model load error: {}", msg),
            AppError::Classifier(msg) => write!(f, "Classifier error: {}", msg),
            AppError::Resample(msg) => write!(f, "Resample error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Converts errors into HTTP responses.
///
/// ## HTTP Status Code Mapping:
/// - NotFound → 404
/// - CapacityExceeded → 503
/// - everything else → 500
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "capacity_exceeded",
///     "message": "Maximum concurrent sessions (64) reached",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;

        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::CapacityExceeded(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_)
            | AppError::ConfigError(_)
            | AppError::ModelLoad(_)
            | AppError::Classifier(_)
            | AppError::Resample(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// `anyhow` errors from startup helpers become internal errors.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// I/O failures only happen while reading model files at startup.
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::ModelLoad(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;
    use actix_web::http::StatusCode;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            AppError::CapacityExceeded("full".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::NotFound("hey_test".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Classifier("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[actix_web::test]
    async fn test_error_response_body() {
        let response = AppError::NotFound("no such keyword".into()).error_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "not_found");
        assert_eq!(value["error"]["message"], "no such keyword");
    }

    #[test]
    fn test_display_prefixes() {
        let err = AppError::Resample("ratio out of range".into());
        assert_eq!(err.to_string(), "Resample error: ratio out of range");
    }
}
