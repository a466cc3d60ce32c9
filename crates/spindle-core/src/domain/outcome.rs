//! Outcome model: the explicit result of one job attempt.
//!
//! Retry eligibility is decided by the worker from this value and the
//! record's attempt counters, never from the type of a raised error.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,

    /// Optional structured detail (status codes, response bodies, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for JobFailure {
    fn from(e: E) -> Self {
        Self::new(e.to_string())
    }
}

/// Result of `Job::handle`.
///
/// - `Success`: delete the job.
/// - `Retry`: release it again while attempts remain, dead-letter otherwise.
/// - `Fail`: dead-letter now, regardless of remaining attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Retry(JobFailure),
    Fail(JobFailure),
}

impl Outcome {
    pub fn success() -> Self {
        Outcome::Success
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        Outcome::Retry(JobFailure::new(reason))
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Outcome::Fail(JobFailure::new(reason))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        match self {
            Outcome::Success => None,
            Outcome::Retry(f) | Outcome::Fail(f) => Some(f),
        }
    }
}

/// `?` で使えるように: `Err` はリトライ可能な失敗として扱う。
impl<E: Into<JobFailure>> From<Result<(), E>> for Outcome {
    fn from(r: Result<(), E>) -> Self {
        match r {
            Ok(()) => Outcome::Success,
            Err(e) => Outcome::Retry(e.into()),
        }
    }
}
