// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });

        (status, body).into_response()
    }
}

/// Convert core pipeline errors to HTTP errors.
///
/// Only validation and upstream failures carry their message to the
/// client; storage and coalescing internals are logged and replaced with
/// generic text.
impl From<vidgate_core::Error> for AppError {
    fn from(err: vidgate_core::Error) -> Self {
        use vidgate_core::Error;

        match err {
            Error::Validation { param, reason } => {
                Self::bad_request(format!("invalid {param}: {reason}"))
            }
            Error::UpstreamTransform { status, message } => {
                tracing::warn!(status, "upstream transform error: {message}");
                Self::bad_gateway(format!("upstream transform returned {status}"))
            }
            Error::Network(reason) => {
                tracing::warn!("upstream fetch failed: {reason}");
                Self::bad_gateway("upstream fetch failed")
            }
            Error::Range(message) => {
                Self::new(StatusCode::RANGE_NOT_SATISFIABLE, message)
            }
            Error::Coalescing => {
                tracing::error!("coalesced fetch failed");
                Self::bad_gateway("upstream fetch failed")
            }
            Error::Storage(err) => {
                tracing::error!("storage error: {err}");
                Self::internal_server_error("internal error")
            }
            Error::Config(message) => {
                tracing::error!("configuration error: {message}");
                Self::internal_server_error("internal error")
            }
        }
    }
}
