//! HTTP error mapping: one variant per failure class in the service's
//! taxonomy, so every handler exits through the same status table.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::scheduler::SchedulerError;
use crate::store::StoreError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    #[error("Content-Length is mandatory")]
    MissingContentLength,

    #[error("checksum is mandatory in the headers")]
    MissingChecksum,

    #[error("invalid size, expected {expected}, received {received}")]
    SizeMismatch { expected: u64, received: u64 },

    #[error("invalid checksum, received {declared}, calculated {computed}")]
    ChecksumMismatch { declared: String, computed: String },

    #[error("upload aborted: {0}")]
    UploadAborted(std::io::Error),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::MissingContentLength
            | ApiError::SizeMismatch { .. }
            | ApiError::ChecksumMismatch { .. }
            | ApiError::UploadAborted(_) => StatusCode::BAD_REQUEST,
            ApiError::MissingChecksum => StatusCode::FORBIDDEN,
            ApiError::Scheduler(err) => match err {
                SchedulerError::Validation(_) => StatusCode::BAD_REQUEST,
                SchedulerError::Conflict => StatusCode::CONFLICT,
                SchedulerError::NotFound => StatusCode::NOT_FOUND,
                SchedulerError::StreamNotAllowed(_) => StatusCode::FORBIDDEN,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Store(err) => match err {
                StoreError::NotFound => StatusCode::NOT_FOUND,
                StoreError::Conflict => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(
            ApiError::Unauthorized("bad token").status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::MissingChecksum.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::SizeMismatch {
                expected: 10,
                received: 7
            }
            .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(SchedulerError::Validation("too small".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(SchedulerError::Conflict).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(SchedulerError::StreamNotAllowed("queued".into())).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::from(StoreError::NotFound).status(),
            StatusCode::NOT_FOUND
        );
    }
}
