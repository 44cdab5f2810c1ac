use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Failures raised by the coordinator and the capabilities it drives.
///
/// Validation variants (`InvalidArgument`, `OutOfRange`) are always produced
/// before any side effect. Store and database failures pass through unchanged.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{name} {reason}")]
    InvalidArgument { name: &'static str, reason: String },
    #[error("{name} is out of range: {reason}")]
    OutOfRange { name: &'static str, reason: String },
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    PreconditionFailed(String),
    #[error(
        "TotalChunks mismatch for existing file. Expected: {expected}, Received: {received}. Approx. expected chunk size: {expected_chunk_mb:.2} MB."
    )]
    TotalChunksMismatch {
        expected: u32,
        received: u32,
        expected_chunk_mb: f64,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Unexpected(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    pub fn out_of_range(name: &'static str, reason: impl Into<String>) -> Self {
        Self::OutOfRange {
            name,
            reason: reason.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// HTTP status the transport layer reports for this failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument { .. }
            | Self::OutOfRange { .. }
            | Self::TotalChunksMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Self::Sqlx(_) | Self::Io(_) | Self::Serialization(_) | Self::Unexpected(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Reject blank or whitespace-only string arguments.
pub fn ensure_present(value: &str, name: &'static str) -> ServiceResult<()> {
    if value.trim().is_empty() {
        return Err(ServiceError::invalid(name, "must be provided."));
    }
    Ok(())
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 403 Forbidden
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
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
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        let status = err.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {}", err);
        } else {
            tracing::warn!("request rejected: {}", err);
        }
        AppError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
