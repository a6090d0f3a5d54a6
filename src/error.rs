//! # Error Handling
//!
//! Two error layers live here:
//!
//! - **`AppError`**: errors surfaced through the HTTP API. Implements
//!   actix-web's `ResponseError` so handlers can return them directly and
//!   clients receive a consistent JSON envelope.
//! - **`RelayError`**: errors produced by the upstream relay (signing,
//!   connection, wire decoding). These never become HTTP responses — they
//!   are reported over the WebSocket channel as `error` events, or
//!   deliberately swallowed where the relay must stay resilient to
//!   protocol noise.
//!
//! ## Relay error policy:
//! - `Config` / `Signing` / `Connection`: fatal to the current start
//!   attempt only. One error event, session returns to idle, the client
//!   may start again.
//! - `Decode`: swallowed at the call site. A malformed inbound frame must
//!   not terminate a live session.
//! - `BadInput`: reported per occurrence, session keeps streaming.
//! - `UpstreamException`: reported with the upstream-supplied detail,
//!   session stays open until the upstream actually closes.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by HTTP request handlers.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500 (Internal Server Error)
/// - BadRequest/ValidationError → 400 (Bad Request)
/// - NotFound → 404 (Not Found)
#[derive(Debug)]
pub enum AppError {
    /// Server-side failures that are not the client's fault
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Converts `AppError` values into JSON HTTP responses.
///
/// All errors share one envelope:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Server port cannot be 0",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

/// Errors produced by the upstream transcription relay.
///
/// ## Error Categories:
/// - **Config**: required credentials are missing from the environment
/// - **Signing**: the presigned connection URL could not be built
/// - **Connection**: the upstream connection failed to open or died
/// - **Decode**: an inbound wire frame was truncated or malformed
/// - **BadInput**: the client sent an audio chunk we could not decode
/// - **UpstreamException**: the upstream service sent an exception frame
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    /// Missing or empty credentials at signing time
    Config(String),

    /// Presigned URL construction failed
    Signing(String),

    /// Upstream connection open or runtime failure
    Connection(String),

    /// Malformed inbound frame or payload
    Decode(String),

    /// Malformed audio chunk from the client
    BadInput(String),

    /// Protocol-level exception reported by the upstream service
    UpstreamException {
        /// Exception type from the frame headers (e.g. "BadRequestException")
        event_type: String,
        /// Decoded payload text supplied by the upstream
        message: String,
    },
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Config(msg) => write!(f, "Credential error: {}", msg),
            RelayError::Signing(msg) => write!(f, "Signing error: {}", msg),
            RelayError::Connection(msg) => write!(f, "Upstream connection error: {}", msg),
            RelayError::Decode(msg) => write!(f, "Frame decode error: {}", msg),
            RelayError::BadInput(msg) => write!(f, "Bad input: {}", msg),
            RelayError::UpstreamException {
                event_type,
                message,
            } => write!(f, "{}: {}", event_type, message),
        }
    }
}

impl std::error::Error for RelayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_exception_display_combines_type_and_detail() {
        let err = RelayError::UpstreamException {
            event_type: "BadRequestException".to_string(),
            message: "invalid sample rate".to_string(),
        };

        let text = err.to_string();
        assert!(text.contains("BadRequestException"));
        assert!(text.contains("invalid sample rate"));
    }

    #[test]
    fn test_app_error_display() {
        let err = AppError::ValidationError("Server port cannot be 0".to_string());
        assert_eq!(err.to_string(), "Validation error: Server port cannot be 0");
    }
}
