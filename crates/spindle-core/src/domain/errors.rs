//! Errors raised by the queue itself (not by jobs).
//!
//! Job の失敗は `Outcome` で返すので、ここには入らない。
//! ここにあるのは store / manager / registry レベルのエラーだけ。

use thiserror::Error;

use super::{JobId, JobKind};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("payload for kind={0} must be a JSON object")]
    InvalidPayload(JobKind),

    #[error("max_attempts must be positive")]
    InvalidMaxAttempts,

    #[error("job {0} is not reserved")]
    NotFound(JobId),

    #[error("job {id} exhausted its retries ({attempts}/{max_attempts})")]
    RetriesExhausted {
        id: JobId,
        attempts: u32,
        max_attempts: u32,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend unreachable or failing. Workers treat this as transient.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl QueueError {
    /// Errors the worker should ride out with backoff instead of giving up.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

impl From<std::io::Error> for QueueError {
    fn from(e: std::io::Error) -> Self {
        QueueError::Unavailable(e.to_string())
    }
}
