//! Worker - 1 本の逐次 polling loop
//!
//! # フロー
//! 1. 停止条件を確認（stop 要求 / max_jobs / max_run_time）
//! 2. 設定された queue を優先順に `pop`。全部空なら sleep して再 poll
//! 3. registry で job を組み立て、別 task で `handle`（panic を隔離、timeout 付き）
//! 4. Outcome に応じて delete / release / 失敗確定
//! 5. 実行後にメモリ上限を確認（delete / release が失敗したときも）
//!
//! 実行中の job は途中で打ち切らない。stop は次の poll の前に効く。
//! settle できなかった job は reservation の期限切れで store が再配送する。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::manager::JobManager;
use crate::domain::{JobFailure, JobRecord, Outcome, QueueError, QueueName, RetryPolicy};
use crate::job::{Job, JobContext};
use crate::ports::{MemoryProbe, ProcMemoryProbe};

pub const DEFAULT_SLEEP: Duration = Duration::from_secs(3);
pub const DEFAULT_MEMORY_LIMIT: u64 = 128 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Polling,
    Executing,
    /// Stop was requested while a job was running; no further polls.
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    MaxJobs,
    MaxRunTime,
    MemoryLimit,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Requested => "requested",
            StopReason::MaxJobs => "max jobs reached",
            StopReason::MaxRunTime => "max run time reached",
            StopReason::MemoryLimit => "memory limit exceeded",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Polled in order; earlier queues win.
    pub queues: Vec<QueueName>,
    /// Idle wait when every queue is empty, and backoff after store errors.
    pub sleep: Duration,
    pub max_jobs: Option<u64>,
    pub max_run_time: Option<Duration>,
    /// Resident set ceiling in bytes.
    pub memory_limit: Option<u64>,
    pub backoff: RetryPolicy,
    /// Bound each attempt by the job's timeout. A zero timeout is unbounded.
    pub enforce_timeout: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            queues: vec![QueueName::default()],
            sleep: DEFAULT_SLEEP,
            max_jobs: None,
            max_run_time: None,
            memory_limit: Some(DEFAULT_MEMORY_LIMIT),
            backoff: RetryPolicy::default(),
            enforce_timeout: true,
        }
    }
}

/// What one [`Worker::run_once`] call did.
#[derive(Debug)]
pub enum Polled {
    /// Every queue was empty.
    Empty,
    /// A job ran and was deleted or released.
    Settled,
    /// A job ran but the store rejected its delete or release.
    Unsettled(QueueError),
}

impl Polled {
    pub fn executed(&self) -> bool {
        !matches!(self, Polled::Empty)
    }
}

/// Requests a graceful stop. Cloneable; usable from signal handlers.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

pub struct Worker {
    manager: Arc<JobManager>,
    options: WorkerOptions,
    memory: Arc<dyn MemoryProbe>,
    state: watch::Sender<WorkerState>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    processed: u64,
}

impl Worker {
    pub fn new(manager: Arc<JobManager>, options: WorkerOptions) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            manager,
            options,
            memory: Arc::new(ProcMemoryProbe),
            state,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            processed: 0,
        }
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory = probe;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Jobs taken off a queue so far, whatever their outcome.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Poll until a stop condition holds. Store errors never end the loop.
    pub async fn run(&mut self) -> StopReason {
        let started = self.manager.clock().now();
        info!(
            queues = ?self.options.queues,
            backoff = %self.options.backoff,
            "worker started"
        );

        let reason = loop {
            if let Some(reason) = self.stop_reason(started) {
                break reason;
            }
            match self.run_once().await {
                Ok(Polled::Empty) => self.idle().await,
                Ok(Polled::Settled) => {
                    if let Some(reason) = self.memory_exceeded() {
                        break reason;
                    }
                }
                Ok(Polled::Unsettled(e)) => {
                    warn!(
                        error = %e,
                        "job could not be settled; it returns once its reservation expires"
                    );
                    if let Some(reason) = self.memory_exceeded() {
                        break reason;
                    }
                    self.idle().await;
                }
                Err(e) => {
                    warn!(error = %e, "queue store error; backing off");
                    self.idle().await;
                }
            }
        };

        self.state.send_replace(WorkerState::Stopped);
        info!(reason = %reason, processed = self.processed, "worker stopped");
        reason
    }

    /// Take and settle at most one job. `Err` only when polling itself failed.
    pub async fn run_once(&mut self) -> Result<Polled, QueueError> {
        self.state.send_replace(WorkerState::Polling);
        let Some(record) = self.next_job().await? else {
            self.state.send_replace(WorkerState::Idle);
            return Ok(Polled::Empty);
        };

        self.state.send_replace(WorkerState::Executing);
        self.processed += 1;
        let result = self.execute(record).await;

        let next = if *self.stop_rx.borrow() {
            WorkerState::Draining
        } else {
            WorkerState::Idle
        };
        self.state.send_replace(next);
        Ok(match result {
            Ok(()) => Polled::Settled,
            Err(e) => Polled::Unsettled(e),
        })
    }

    fn stop_reason(&self, started: DateTime<Utc>) -> Option<StopReason> {
        if *self.stop_rx.borrow() {
            return Some(StopReason::Requested);
        }
        if let Some(max) = self.options.max_jobs
            && self.processed >= max
        {
            return Some(StopReason::MaxJobs);
        }
        if let Some(max) = self.options.max_run_time {
            let elapsed = (self.manager.clock().now() - started)
                .to_std()
                .unwrap_or_default();
            if elapsed >= max {
                return Some(StopReason::MaxRunTime);
            }
        }
        None
    }

    fn memory_exceeded(&self) -> Option<StopReason> {
        let limit = self.options.memory_limit?;
        let used = self.memory.resident_bytes()?;
        if used >= limit {
            warn!(used, limit, "memory limit exceeded");
            return Some(StopReason::MemoryLimit);
        }
        None
    }

    async fn idle(&mut self) {
        self.state.send_replace(WorkerState::Idle);
        tokio::select! {
            _ = tokio::time::sleep(self.options.sleep) => {}
            _ = self.stop_rx.changed() => {}
        }
    }

    async fn next_job(&self) -> Result<Option<JobRecord>, QueueError> {
        for queue in &self.options.queues {
            if let Some(record) = self.manager.pop(queue).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn execute(&self, record: JobRecord) -> Result<(), QueueError> {
        let ctx = JobContext::from_record(&record);
        info!(
            job_id = %ctx.job_id,
            kind = %ctx.kind,
            queue = %ctx.queue,
            attempts = ctx.attempt,
            "job started"
        );

        let job = match self.manager.resolve(&record) {
            Ok(job) => job,
            Err(e) => {
                // 誰も処理できない job は残しても再配送を繰り返すだけなので消す。
                // 中身はログに全部残す
                let dump = record
                    .to_json()
                    .unwrap_or_else(|err| format!("<unserializable: {err}>"));
                error!(
                    job_id = %ctx.job_id,
                    kind = %ctx.kind,
                    queue = %ctx.queue,
                    attempts = ctx.attempt,
                    error = %e,
                    record = %dump,
                    "job cannot be resolved; removing it"
                );
                return self.manager.delete(&record.queue, record.id).await;
            }
        };

        // reservation 切れで戻ってきた最後の attempt の続き。もう実行しない
        if record.attempts > record.max_attempts {
            let cause = JobFailure::new(format!(
                "job exceeded {} attempts; its last run was abandoned",
                record.max_attempts
            ));
            return self.fail_permanently(job, &ctx, cause).await;
        }

        match self.attempt(Arc::clone(&job), &ctx).await {
            Outcome::Success => {
                self.manager.delete(&record.queue, record.id).await?;
                info!(
                    job_id = %ctx.job_id,
                    kind = %ctx.kind,
                    queue = %ctx.queue,
                    attempts = ctx.attempt,
                    "job succeeded"
                );
                Ok(())
            }
            Outcome::Retry(cause) if !record.retries_exhausted() => {
                let delay = self.options.backoff.next_delay(record.attempts);
                let released = self
                    .manager
                    .release(&record.queue, record.id, delay, Some(cause.message.clone()))
                    .await;
                match released {
                    Ok(()) => {
                        warn!(
                            job_id = %ctx.job_id,
                            kind = %ctx.kind,
                            queue = %ctx.queue,
                            attempts = ctx.attempt,
                            delay = ?delay,
                            error = %cause,
                            "job released for retry"
                        );
                        Ok(())
                    }
                    Err(QueueError::RetriesExhausted { .. }) => {
                        self.fail_permanently(job, &ctx, cause).await
                    }
                    Err(e) => Err(e),
                }
            }
            Outcome::Retry(cause) | Outcome::Fail(cause) => {
                self.fail_permanently(job, &ctx, cause).await
            }
        }
    }

    /// Run `handle` on its own task so a panic or a hang cannot take the loop down.
    async fn attempt(&self, job: Arc<dyn Job>, ctx: &JobContext) -> Outcome {
        let task_ctx = ctx.clone();
        let task = tokio::spawn(async move { job.handle(&task_ctx).await });
        let abort = task.abort_handle();

        let joined = if self.options.enforce_timeout && !ctx.timeout.is_zero() {
            match tokio::time::timeout(ctx.timeout, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    abort.abort();
                    return Outcome::retry(format!("job timed out after {:?}", ctx.timeout));
                }
            }
        } else {
            task.await
        };

        match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                Outcome::retry(format!("job panicked: {}", panic_message(e.into_panic())))
            }
            Err(e) => Outcome::retry(format!("job task was cancelled: {e}")),
        }
    }

    async fn fail_permanently(
        &self,
        job: Arc<dyn Job>,
        ctx: &JobContext,
        cause: JobFailure,
    ) -> Result<(), QueueError> {
        self.manager.delete(&ctx.queue, ctx.job_id).await?;
        error!(
            job_id = %ctx.job_id,
            kind = %ctx.kind,
            queue = %ctx.queue,
            attempts = ctx.attempt,
            error = %cause,
            "job failed permanently"
        );

        let hook_ctx = ctx.clone();
        let hook = tokio::spawn(async move { job.failed(&hook_ctx, &cause).await });
        if let Err(e) = hook.await {
            warn!(job_id = %ctx.job_id, error = %e, "failed hook did not complete");
        } else {
            debug!(job_id = %ctx.job_id, "failed hook ran");
        }
        Ok(())
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
