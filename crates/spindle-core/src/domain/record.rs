//! Job record: queue bookkeeping + payload.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, JobKind, QueueName};
use crate::domain::errors::QueueError;

/// Opaque payload handed to the job factory: string keys to JSON values.
pub type Payload = serde_json::Map<String, serde_json::Value>;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Extra time a reserved job is held past its timeout before a store hands it
/// out again.
pub const RESERVE_GRACE: Duration = Duration::from_secs(30);

/// Reservation length for jobs without a timeout.
pub const UNBOUNDED_RESERVATION: Duration = Duration::from_secs(60 * 60);

/// Everything the store keeps about one job.
///
/// Design:
/// - store はこの record をそのまま（serde JSON で）保存する
/// - `attempts` は pop のたびに store 側で +1 する（減ることはない）
/// - payload 以外はすべて queue の都合の値で、job 本体のデータではない
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub queue: QueueName,
    pub payload: Payload,

    /// Number of times the job has been dequeued for execution.
    pub attempts: u32,

    /// Ceiling on executions. Always positive.
    pub max_attempts: u32,

    /// Per-attempt budget, in milliseconds. 0 means unbounded.
    pub timeout_ms: u64,

    pub created_at: DateTime<Utc>,

    /// Not visible to pop before this instant (delayed jobs only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,

    /// Cause recorded by the most recent release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl JobRecord {
    pub fn new(
        id: JobId,
        kind: JobKind,
        queue: QueueName,
        payload: Payload,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            queue,
            payload,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout_ms: duration_ms(DEFAULT_TIMEOUT),
            created_at,
            run_at: None,
            last_error: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Sub-millisecond budgets round up so they never read as unbounded.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout_ms = duration_ms(timeout);
    }

    /// How long a popped job stays reserved before it counts as abandoned.
    pub fn reservation(&self) -> Duration {
        if self.timeout_ms == 0 {
            UNBOUNDED_RESERVATION
        } else {
            self.timeout() + RESERVE_GRACE
        }
    }

    /// True when the job may be handed to a worker at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.run_at.is_none_or(|run_at| run_at <= now)
    }

    /// True once no further attempt is allowed.
    pub fn retries_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Mark the record as dequeued for one more execution.
    pub fn start_attempt(&mut self) {
        self.attempts += 1;
        self.run_at = None;
    }

    /// Prepare a reserved record for re-enqueue.
    ///
    /// `run_at` is `None` for an immediate retry.
    pub fn prepare_release(
        &mut self,
        run_at: Option<DateTime<Utc>>,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        if self.retries_exhausted() {
            return Err(QueueError::RetriesExhausted {
                id: self.id,
                attempts: self.attempts,
                max_attempts: self.max_attempts,
            });
        }
        self.run_at = run_at;
        if error.is_some() {
            self.last_error = error;
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self, QueueError> {
        Ok(serde_json::from_str(s)?)
    }
}

fn duration_ms(d: Duration) -> u64 {
    if d.is_zero() {
        return 0;
    }
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}
