//! Centralized error types for the Spindrift core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::player::backend::BackendError;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the Spindrift endpoint.
#[derive(Debug, Error)]
pub enum SpindriftError {
    /// Endpoint name failed validation.
    #[error("invalid name: {0}")]
    NameInvalid(String),

    /// An endpoint with this name already exists.
    #[error("player already exists: {0}")]
    NameConflict(String),

    /// No endpoint with this name.
    #[error("player not found: {0}")]
    NotFound(String),

    /// The configured device is unknown or cannot be opened.
    #[error("invalid device: {0}")]
    DeviceInvalid(String),

    /// Start requested on a running endpoint.
    #[error("player already running: {0}")]
    AlreadyRunning(String),

    /// Stop requested on a stopped endpoint.
    #[error("player not running: {0}")]
    NotRunning(String),

    /// Another lifecycle transition is in progress.
    #[error("player busy: {0}")]
    Busy(String),

    /// A lifecycle operation exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Client sent an invalid or malformed request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The stream format changed and the pipeline must be rebuilt.
    #[error("format mismatch: {0}")]
    FormatMismatch(String),

    /// Operation not supported by the active backend.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Configuration error (bad roster file, missing settings).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SpindriftError {
    /// Returns a machine-readable error code for API responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NameInvalid(_) => "name_invalid",
            Self::NameConflict(_) => "name_conflict",
            Self::NotFound(_) => "not_found",
            Self::DeviceInvalid(_) => "device_invalid",
            Self::AlreadyRunning(_) => "already_running",
            Self::NotRunning(_) => "not_running",
            Self::Busy(_) => "busy",
            Self::Timeout(_) => "timeout",
            Self::InvalidRequest(_) => "invalid_request",
            Self::FormatMismatch(_) => "format_mismatch",
            Self::Unsupported(_) => "unsupported",
            Self::Configuration(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NameInvalid(_) | Self::DeviceInvalid(_) | Self::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::NameConflict(_)
            | Self::AlreadyRunning(_)
            | Self::NotRunning(_)
            | Self::Busy(_) => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Self::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            Self::FormatMismatch(_) | Self::Configuration(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl ErrorCode for SpindriftError {
    fn code(&self) -> &'static str {
        SpindriftError::code(self)
    }
}

impl From<BackendError> for SpindriftError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::UnknownDevice(id) => Self::DeviceInvalid(id),
            BackendError::OpenFailed { device, reason } => {
                Self::DeviceInvalid(format!("{device}: {reason}"))
            }
            BackendError::Unsupported { backend, operation } => {
                Self::Unsupported(format!("{operation} on {backend}"))
            }
            BackendError::System(reason) => Self::Internal(reason),
        }
    }
}

impl From<crate::utils::NameValidationError> for SpindriftError {
    fn from(err: crate::utils::NameValidationError) -> Self {
        Self::NameInvalid(err.to_string())
    }
}

/// Convenient Result alias for application-wide operations.
pub type SpindriftResult<T> = Result<T, SpindriftError>;

/// JSON body for error responses.
///
/// `error` and `message` intentionally carry the same text: historical
/// clients read one or the other, and the API treats them as synonyms.
#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
    message: String,
    code: &'static str,
}

impl IntoResponse for SpindriftError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let text = self.to_string();
        let body = ErrorResponse {
            success: false,
            error: text.clone(),
            message: text,
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_api_contract() {
        assert_eq!(
            SpindriftError::NameInvalid("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SpindriftError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            SpindriftError::Timeout("x".into()).status_code(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            SpindriftError::NameConflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            SpindriftError::Unsupported("x".into()).status_code(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            SpindriftError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn backend_errors_map_to_device_invalid() {
        let err: SpindriftError = BackendError::UnknownDevice("hw:9".into()).into();
        assert_eq!(err.code(), "device_invalid");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
