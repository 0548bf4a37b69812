use crate::{models::upload::ChunkReceipt, services::upload_service::UploadError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::fmt;
use tracing::warn;

/// A rejected upload request. The message stays in the server log; the client
/// only sees the status and the minimal rejection body.
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

    /// Shortcut for a 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
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
        warn!(status = self.status.as_u16(), "rejected upload request: {}", self.message);
        (self.status, Json(ChunkReceipt::rejected())).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = match &err {
            UploadError::InvalidChunk(_) => StatusCode::BAD_REQUEST,
            UploadError::Unauthorized(_) => StatusCode::FORBIDDEN,
            UploadError::Forbidden(_) => StatusCode::GONE,
            UploadError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::HashMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            UploadError::LockTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            UploadError::Io(_) | UploadError::Json(_) => {
                return AppError::internal(err.to_string());
            }
        };
        AppError::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_errors_map_to_statuses() {
        let cases = [
            (UploadError::InvalidChunk("x".into()), StatusCode::BAD_REQUEST),
            (UploadError::Unauthorized("t".into()), StatusCode::FORBIDDEN),
            (UploadError::Forbidden("t".into()), StatusCode::GONE),
            (UploadError::LockTimeout("t".into()), StatusCode::SERVICE_UNAVAILABLE),
            (
                UploadError::TooLarge {
                    token: "t".into(),
                    limit: 1,
                },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                UploadError::HashMismatch {
                    token: "t".into(),
                    expected: "a".into(),
                    actual: "b".into(),
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                UploadError::Io(std::io::Error::other("disk")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }
}
