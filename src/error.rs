//! Error types for the sidecar and its API surface

use crate::launcher::ServerState;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Errors produced while launching, gating, or proxying to the upstream server
#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    /// The subprocess exited before its listener came up. Fatal, never retried.
    #[error("server process exited before becoming ready (exit code {code:?})")]
    StartupFailure { code: Option<i32> },

    /// The attempt limit was reached while the subprocess was still running.
    /// The process is left running; the caller owns teardown.
    #[error("server not reachable after {attempts} probe attempts")]
    ProbeTimeout { attempts: u32 },

    /// A request was issued against a handle that is not `Ready`.
    #[error("server is not ready (state: {state:?})")]
    NotReady { state: ServerState },

    /// Non-success HTTP status from the ready server. Propagated, not retried.
    #[error("upstream returned {status}: {message}")]
    UpstreamError { status: u16, message: String },

    /// The upstream stream closed or errored mid-flight. Fragments already
    /// delivered to the consumer stay delivered.
    #[error("upstream stream interrupted: {reason}")]
    StreamInterrupted { reason: String },

    /// OS-level launch failure (binary missing, not executable, ...)
    #[error("failed to spawn server process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

pub type SidecarResult<T> = Result<T, SidecarError>;

/// API error types
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    ServiceUnavailable(String),
    UpstreamFailed(u16, String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::UpstreamFailed(status, msg) => (
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                msg,
            ),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

impl From<SidecarError> for ApiError {
    fn from(err: SidecarError) -> Self {
        match err {
            SidecarError::NotReady { .. } => ApiError::ServiceUnavailable(err.to_string()),
            SidecarError::UpstreamError { status, ref message } => {
                ApiError::UpstreamFailed(status, message.clone())
            }
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}
