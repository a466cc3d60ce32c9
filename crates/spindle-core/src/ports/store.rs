//! QueueStore port - ready list + delayed set + reserved jobs
//!
//! すべての backend（ListStore / IndexStore / RedisStore）がこの契約を満たす。
//!
//! # 契約
//! - `push`: 失敗するのは storage が失敗したときだけ。ブロックしない
//! - `pop`: ブロックしない。空なら即 `None`。due な delayed job を先に昇格する
//! - `pop` は取り出しと `attempts += 1` を 1 つの原子的操作として行う
//! - pop された job は `delete` か `release` されるまで reserved として保持される
//! - `delete`: 冪等。存在しない id でもエラーにしない
//! - `size`: ready のみ数える（delayed は含まない）

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{JobId, JobRecord, QueueError, QueueName};

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Store a new job on the ready list of `job.queue`, or on its delayed
    /// set when `job.run_at` is in the future.
    async fn push(&self, job: JobRecord) -> Result<JobId, QueueError>;

    /// Take the oldest ready job, with its attempt counter already bumped.
    async fn pop(&self, queue: &QueueName) -> Result<Option<JobRecord>, QueueError>;

    /// Forget a job wherever it is. Unknown ids are a no-op.
    async fn delete(&self, queue: &QueueName, id: JobId) -> Result<(), QueueError>;

    /// Put a reserved job back: ready list when `delay` is zero, delayed set
    /// with `run_at = now + delay` otherwise.
    async fn release(
        &self,
        queue: &QueueName,
        id: JobId,
        delay: Duration,
        error: Option<String>,
    ) -> Result<(), QueueError>;

    /// Number of ready entries.
    async fn size(&self, queue: &QueueName) -> Result<usize, QueueError>;

    /// Number of delayed entries.
    async fn delayed_size(&self, queue: &QueueName) -> Result<usize, QueueError>;

    /// Move delayed jobs whose `run_at` has passed onto the ready list.
    ///
    /// `pop` already does this; exposed for reapers and tests.
    async fn promote(&self, queue: &QueueName) -> Result<usize, QueueError>;
}
