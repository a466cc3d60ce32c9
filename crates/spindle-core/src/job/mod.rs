//! Job - 1 単位の遅延処理
//!
//! # 二層構造
//! - **Job**: object-safe な実行インターフェース（`handle` / `failed`）
//! - **TypedJob**: `KIND` と payload の serde 対応を静的に結びつける
//!
//! Job は payload だけから構築される。attempts / max_attempts / timeout は
//! queue 側の bookkeeping なので `JobContext` 経由で読むだけ。

pub mod factory;
pub mod registry;

pub use self::factory::{FnFactory, JobFactory, TypedFactory};
pub use self::registry::{JobRegistry, RegistryError};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{JobFailure, JobId, JobKind, JobRecord, Outcome, QueueName};

/// Bookkeeping visible to a running job.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub kind: JobKind,
    pub queue: QueueName,
    /// 1 for the first execution.
    pub attempt: u32,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
}

impl JobContext {
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            job_id: record.id,
            kind: record.kind.clone(),
            queue: record.queue.clone(),
            attempt: record.attempts,
            max_attempts: record.max_attempts,
            timeout: record.timeout(),
            created_at: record.created_at,
        }
    }

    /// True when a failure of this attempt will not be retried.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A unit of deferred work.
///
/// Side effects must tolerate at-least-once delivery: the same job can run
/// again if a worker dies between `handle` and the store's delete.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    async fn handle(&self, ctx: &JobContext) -> Outcome;

    /// Called exactly once when the job is given up on, after it has been
    /// removed from the queue. The worker already logs the failure.
    async fn failed(&self, _ctx: &JobContext, _cause: &JobFailure) {}
}

/// A job whose payload is its own serde representation.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail { to: String, subject: String, body: String }
///
/// #[async_trait]
/// impl Job for SendEmail {
///     async fn handle(&self, _ctx: &JobContext) -> Outcome { ... }
/// }
///
/// impl TypedJob for SendEmail {
///     const KIND: &'static str = "send_email";
/// }
/// ```
pub trait TypedJob: Job + Serialize + DeserializeOwned {
    const KIND: &'static str;

    fn kind() -> JobKind {
        JobKind::new(Self::KIND)
    }
}
