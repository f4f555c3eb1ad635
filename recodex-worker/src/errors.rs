//! Worker-side error taxonomy.
//!
//! Transient transport failures are retried by the stage loops; everything
//! else is terminal for the attempt and surfaces as a `failed` (or
//! `canceled`) job event.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("job not found")]
    JobNotFound,

    #[error("operation canceled")]
    Canceled,

    #[error("checksum error on download, source {expected} downloaded {got}")]
    ChecksumMismatch { expected: String, got: String },

    #[error("timeout waiting for PGS conversion")]
    PgsTimeout,

    #[error("PGS conversion of stream {stream} failed: {message}")]
    PgsFailed { stream: i32, message: String },

    #[error("{0}")]
    EncodeValidation(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected http status {0}")]
    HttpStatus(u16),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Media(#[from] recodex_media::MediaError),

    #[error(transparent)]
    Broker(#[from] recodex_broker::BrokerError),

    #[error("{0}")]
    Other(String),
}

impl WorkerError {
    /// Errors that no amount of retrying will fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            WorkerError::JobNotFound
                | WorkerError::Canceled
                | WorkerError::ChecksumMismatch { .. }
        )
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, WorkerError::Canceled)
            || matches!(self, WorkerError::Media(recodex_media::MediaError::Canceled))
    }
}
