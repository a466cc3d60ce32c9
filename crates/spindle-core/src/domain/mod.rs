//! Domain model: ids, records, outcomes, retry policy, errors.
//!
//! ここは store や worker を知らない。
//! queue の実装に依存しない「形」だけを定義する。

pub mod errors;
pub mod ids;
pub mod kind;
pub mod outcome;
pub mod record;
pub mod retry;

pub use self::errors::QueueError;
pub use self::ids::{JobId, ParseJobIdError};
pub use self::kind::{JobKind, QueueName};
pub use self::outcome::{JobFailure, Outcome};
pub use self::record::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT, JobRecord, Payload, RESERVE_GRACE, UNBOUNDED_RESERVATION,
};
pub use self::retry::{ParseRetryPolicyError, RetryPolicy};
