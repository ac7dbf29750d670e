//! HTTP-facing error wrapper. Converts the domain [`AgentError`] taxonomy
//! into a status code + JSON body, keeping the HTTP status mapping out of
//! `logagent-core` entirely.

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use logagent_core::AgentError;
use serde_json::json;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        AppError { status, message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));
        (self.status, body).into_response()
    }
}

/// Maps the domain error taxonomy onto HTTP status: transient sink/queue
/// conditions read as retryable-by-the-client, permanent/config errors as
/// client or server faults depending on who controls the input.
impl From<AgentError> for AppError {
    fn from(err: AgentError) -> Self {
        match &err {
            AgentError::QueueFull { .. } | AgentError::EnqueueTimeout(_) | AgentError::BufferExhausted(_) => {
                Self::rate_limited(err.to_string())
            }
            AgentError::BreakerOpen { .. } | AgentError::SinkTransient { .. } => Self::service_unavailable(err.to_string()),
            AgentError::Config(_) => Self::bad_request(err.to_string()),
            AgentError::Source { .. } | AgentError::SinkPermanent { .. } => Self::internal(err.to_string()),
            AgentError::Io(_) | AgentError::Serialization(_) | AgentError::Internal(_) => Self::internal(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}
