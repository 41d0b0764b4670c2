//! # Error Handling Module
//!
//! Crate-wide error type for the edge layer. The cache and rate-limit
//! subsystems keep their own error enums (`CacheError`, `RateLimitError`)
//! at the store seams; both convert into [`EdgeError`] so configuration
//! loading and context construction can use a single `?` chain.
//!
//! Note that neither middleware ever surfaces these errors to a request
//! handler: a failing cache degrades to a miss and a failing rate-limit
//! store degrades to "allow". The only user-visible non-2xx responses the
//! edge layer produces are 429 (quota exhausted) and 403 (deny-listed IP).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main result type used throughout the edge layer
pub type EdgeResult<T> = Result<T, EdgeError>;

/// Error categories produced by the edge layer
#[derive(Debug, Error, Clone)]
pub enum EdgeError {
    /// Configuration-related errors (unreadable file, malformed YAML)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Cache subsystem failures
    #[error("Cache error: {message}")]
    Cache { message: String },

    /// Rate limit backing store failures
    #[error("Rate limit store error: {message}")]
    RateLimitStore { message: String },

    /// Request quota exhausted
    #[error("Rate limit exceeded: {limit} requests per {window_secs}s")]
    RateLimitExceeded { limit: u32, window_secs: u64 },

    /// Client address is deny-listed
    #[error("Access denied for {ip}")]
    AccessDenied { ip: String },

    /// Backend call did not finish in time
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Unexpected internal failure
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EdgeError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::AccessDenied { .. } => StatusCode::FORBIDDEN,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Cache { .. } | Self::RateLimitStore { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Configuration { .. } | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable error code used in response bodies
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::Cache { .. } => "cache_error",
            Self::RateLimitStore { .. } => "rate_limit_store_error",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::AccessDenied { .. } => "access_denied",
            Self::Timeout { .. } => "timeout",
            Self::Internal { .. } => "internal_error",
        }
    }
}

impl From<std::io::Error> for EdgeError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal {
            message: format!("I/O error: {}", err),
        }
    }
}

impl From<serde_yaml::Error> for EdgeError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration {
            message: format!("YAML error: {}", err),
        }
    }
}

impl From<serde_json::Error> for EdgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("JSON error: {}", err),
        }
    }
}

impl IntoResponse for EdgeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": {
                "code": self.error_code(),
                "status": status.as_u16(),
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}
