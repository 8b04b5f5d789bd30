//! Structured error types shared by the pipeline and the HTTP layer.
//!
//! Every failure is categorized so callers can decide between retry,
//! degrade, and surface. Client-visible responses carry an opaque
//! message; the detailed error is logged server-side with the req_id.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// JSON error body returned to API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code
    pub code: String,
    /// Short opaque message; internals are never echoed
    pub message: String,
}

/// Application error, categorized by failure kind.
#[derive(Debug)]
pub enum AppError {
    /// Malformed input (400)
    BadRequest(String),

    /// Reserved for the front door's auth layer (401)
    Unauthorized(String),

    /// Idempotency key already in flight or completed (409)
    Duplicate(String),

    /// User or record absent (404). Doubles as the "new user" sentinel
    /// from the identity cache so callers can degrade to empty.
    NotFound(String),

    /// Retriable provider failure: 5xx / 429 / connection reset (503)
    Transient(String),

    /// Schema or contract violation; retrying cannot help (500)
    Permanent(String),

    /// Deadline exceeded (504)
    Timeout(String),

    /// Network-level failure talking to a collaborator (502)
    Transport(String),

    /// Everything else
    Internal(anyhow::Error),
}

impl AppError {
    /// Machine-readable code for client identification.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Duplicate(_) => "DUPLICATE_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Transient(_) => "TRANSIENT",
            Self::Permanent(_) => "PERMANENT",
            Self::Timeout(_) => "TIMEOUT",
            Self::Transport(_) => "TRANSPORT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Duplicate(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::Permanent(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Detailed message for server-side logs.
    pub fn message(&self) -> String {
        match self {
            Self::BadRequest(m) => format!("bad request: {m}"),
            Self::Unauthorized(m) => format!("unauthorized: {m}"),
            Self::Duplicate(m) => format!("duplicate request: {m}"),
            Self::NotFound(m) => format!("not found: {m}"),
            Self::Transient(m) => format!("transient failure: {m}"),
            Self::Permanent(m) => format!("permanent failure: {m}"),
            Self::Timeout(m) => format!("deadline exceeded: {m}"),
            Self::Transport(m) => format!("transport failure: {m}"),
            Self::Internal(e) => format!("internal error: {e:#}"),
        }
    }

    /// Short message safe to show a client.
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "Request format is wrong",
            Self::Unauthorized(_) => "Authentication required",
            Self::Duplicate(_) => "Request already submitted",
            Self::NotFound(_) => "Not found",
            Self::Timeout(_) => "Request timed out, please retry",
            Self::Transient(_) | Self::Transport(_) | Self::Permanent(_) | Self::Internal(_) => {
                "Oops, something went wrong! Please try again later"
            }
        }
    }

    /// Whether a retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Permanent(format!("json: {err}"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "handler error: {}", self.message());
        } else {
            tracing::warn!(code = self.code(), "handler rejection: {}", self.message());
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.client_message().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Type alias for Results using AppError.
pub type Result<T> = std::result::Result<T, AppError>;
