//! Centralized error handling for stello-auth
//!
//! Every public operation returns [`AuthError`]. Variants are coarse on
//! purpose: cryptographic and parsing detail is logged where it happens and
//! never carried in the public message, so callers cannot tell a bad
//! signature from a wrong audience.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Error kinds surfaced to collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    Unauthenticated,
    Expired,
    ReuseDetected,
    RateLimited,
    UpstreamUnavailable,
    Internal,
}

/// Authentication error type with HTTP status code mapping
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Authentication failed")]
    Unauthenticated,

    #[error("Credential expired")]
    Expired,

    #[error("Refresh token reuse detected")]
    ReuseDetected,

    /// Lost a concurrent rotation race; the session itself is untouched
    #[error("Authentication failed")]
    StaleRefreshToken,

    #[error("Too many requests")]
    RateLimited,

    #[error("Upstream service unavailable")]
    UpstreamUnavailable(String),

    #[error("Upstream request timed out")]
    Timeout(String),

    #[error("Internal error")]
    Internal(String),
}

/// JSON error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

/// Error details in the response
#[derive(Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl AuthError {
    /// Coarse kind exposed to callers
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::InvalidInput(_) => ErrorKind::InvalidInput,
            AuthError::Unauthenticated | AuthError::StaleRefreshToken => {
                ErrorKind::Unauthenticated
            }
            AuthError::Expired => ErrorKind::Expired,
            AuthError::ReuseDetected => ErrorKind::ReuseDetected,
            AuthError::RateLimited => ErrorKind::RateLimited,
            AuthError::UpstreamUnavailable(_) | AuthError::Timeout(_) => {
                ErrorKind::UpstreamUnavailable
            }
            AuthError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a network-bound call ran past its deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, AuthError::Timeout(_))
    }

    /// Get the error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::InvalidInput(_) => "INVALID_INPUT",
            AuthError::Unauthenticated => "UNAUTHENTICATED",
            AuthError::Expired => "EXPIRED",
            AuthError::ReuseDetected => "REUSE_DETECTED",
            AuthError::StaleRefreshToken => "UNAUTHENTICATED",
            AuthError::RateLimited => "RATE_LIMITED",
            AuthError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            AuthError::Timeout(_) => "UPSTREAM_TIMEOUT",
            AuthError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AuthError::Unauthenticated
            | AuthError::Expired
            | AuthError::ReuseDetected
            | AuthError::StaleRefreshToken => StatusCode::UNAUTHORIZED,
            AuthError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AuthError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            AuthError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        // Log server errors with their private detail
        match &self {
            AuthError::Internal(detail)
            | AuthError::UpstreamUnavailable(detail)
            | AuthError::Timeout(detail) => {
                tracing::error!(error = %detail, code = %error_code, "Server error occurred");
            }
            _ => {
                tracing::debug!(error = %message, code = %error_code, "Client error occurred");
            }
        }

        let body = ErrorResponse {
            error: ErrorDetails {
                code: error_code.to_string(),
                message,
            },
        };

        (status, Json(body)).into_response()
    }
}

// Convenience conversions from common error types

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        AuthError::Internal(format!("database: {}", err))
    }
}

impl From<redis::RedisError> for AuthError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            AuthError::Timeout(format!("redis: {}", err))
        } else if err.is_connection_dropped() || err.is_connection_refusal() {
            AuthError::UpstreamUnavailable(format!("redis: {}", err))
        } else {
            AuthError::Internal(format!("redis: {}", err))
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AuthError::Timeout(err.to_string())
        } else {
            AuthError::UpstreamUnavailable(err.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for AuthError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        AuthError::Timeout("deadline elapsed".to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        AuthError::Internal(format!("json: {}", err))
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => {
                tracing::debug!(error = %err, "Token rejected");
                AuthError::Unauthenticated
            }
        }
    }
}

impl From<validator::ValidationErrors> for AuthError {
    fn from(err: validator::ValidationErrors) -> Self {
        AuthError::InvalidInput(err.to_string())
    }
}

/// Result type alias using AuthError
pub type AuthResult<T> = Result<T, AuthError>;
