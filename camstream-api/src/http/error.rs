// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use camstream_fanout::StreamError;
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

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
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
pub struct ErrorResponse {
    pub error: String,
    pub status: u16,
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

impl From<StreamError> for AppError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::StreamNotFound(id) => Self::not_found(format!("Unknown stream: {id}")),
            StreamError::BranchNotFound(id) => Self::not_found(format!("Unknown branch: {id}")),
            StreamError::AlreadyRegistered(id) => {
                Self::conflict(format!("Stream already registered: {id}"))
            }
            StreamError::ShutDown(id) => {
                Self::service_unavailable(format!("Stream is shutting down: {id}"))
            }
            StreamError::Lookup(msg) => {
                tracing::error!(error = %msg, "Camera lookup failed");
                Self::internal("Camera lookup failed")
            }
            err @ (StreamError::Engine(_) | StreamError::GraphInsert(_)) => {
                tracing::error!(error = %err, "Media pipeline error");
                Self::internal("Media pipeline error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camstream_fanout::StreamId;
    use camstream_media::EngineError;

    #[test]
    fn test_stream_error_status() {
        let err = AppError::from(StreamError::StreamNotFound(StreamId::from("cam")));
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = AppError::from(StreamError::Engine(EngineError::Other("boom".into())));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "Media pipeline error");
    }

    #[test]
    fn test_lookup_failure_hides_upstream_detail() {
        let err = AppError::from(StreamError::Lookup(
            "Upstream service error: connection refused to 10.0.0.9".into(),
        ));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "Camera lookup failed");

        let err = AppError::from(StreamError::AlreadyRegistered(StreamId::from("cam")));
        assert_eq!(err.status, StatusCode::CONFLICT);
    }
}
