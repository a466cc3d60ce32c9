//! JobManager - producer / consumer API over a QueueStore
//!
//! producer は `enqueue` / `dispatch`、worker は `pop` → `resolve` →
//! `delete` / `release` を使う。queue 名の解決、ID 採番、payload の検証はここで行い、
//! store は渡された record をそのまま保存するだけにする。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::domain::{JobId, JobKind, JobRecord, QueueError, QueueName};
use crate::impls::list_store::run_at_after;
use crate::job::{Job, JobRegistry, RegistryError, TypedJob};
use crate::ports::{Clock, IdGenerator, QueueStore};

/// Per-enqueue overrides. Unset fields fall back to the manager defaults.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub queue: Option<QueueName>,
    pub delay: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub timeout: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_queue(mut self, queue: impl Into<QueueName>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Built with [`ManagerBuilder`](super::ManagerBuilder).
pub struct JobManager {
    pub(super) store: Arc<dyn QueueStore>,
    pub(super) registry: Arc<JobRegistry>,
    pub(super) ids: Arc<dyn IdGenerator>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) default_queue: QueueName,
    pub(super) default_max_attempts: u32,
    pub(super) default_timeout: Duration,
}

impl JobManager {
    pub fn builder() -> super::ManagerBuilder {
        super::ManagerBuilder::new()
    }

    pub fn default_queue(&self) -> &QueueName {
        &self.default_queue
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn store(&self) -> Arc<dyn QueueStore> {
        Arc::clone(&self.store)
    }

    /// `None` means the default queue.
    pub fn resolve_queue(&self, queue: Option<QueueName>) -> QueueName {
        queue.unwrap_or_else(|| self.default_queue.clone())
    }

    /// Store a new job. `payload` must be a JSON object.
    pub async fn enqueue(
        &self,
        kind: impl Into<JobKind>,
        payload: Value,
        opts: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let kind = kind.into();
        let Value::Object(payload) = payload else {
            return Err(QueueError::InvalidPayload(kind));
        };
        let max_attempts = opts.max_attempts.unwrap_or(self.default_max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::InvalidMaxAttempts);
        }

        let now = self.clock.now();
        let queue = self.resolve_queue(opts.queue);
        let mut record = JobRecord::new(self.ids.generate_job_id(), kind, queue, payload, now);
        record.max_attempts = max_attempts;
        record.set_timeout(opts.timeout.unwrap_or(self.default_timeout));
        record.run_at = opts.delay.and_then(|d| run_at_after(now, d));

        let id = self.store.push(record.clone()).await?;
        tracing::debug!(
            job_id = %id,
            kind = %record.kind,
            queue = %record.queue,
            run_at = ?record.run_at,
            "job enqueued"
        );
        Ok(id)
    }

    /// Enqueue a typed job; its serde form is the payload.
    pub async fn dispatch<J: TypedJob>(
        &self,
        job: &J,
        opts: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let payload = serde_json::to_value(job)?;
        self.enqueue(J::kind(), payload, opts).await
    }

    pub async fn pop(&self, queue: &QueueName) -> Result<Option<JobRecord>, QueueError> {
        self.store.pop(queue).await
    }

    /// Build the job instance for a popped record.
    pub fn resolve(&self, record: &JobRecord) -> Result<Arc<dyn Job>, RegistryError> {
        self.registry.build(record)
    }

    pub async fn delete(&self, queue: &QueueName, id: JobId) -> Result<(), QueueError> {
        self.store.delete(queue, id).await
    }

    pub async fn release(
        &self,
        queue: &QueueName,
        id: JobId,
        delay: Duration,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        self.store.release(queue, id, delay, error).await
    }

    pub async fn size(&self, queue: &QueueName) -> Result<usize, QueueError> {
        self.store.size(queue).await
    }

    pub async fn delayed_size(&self, queue: &QueueName) -> Result<usize, QueueError> {
        self.store.delayed_size(queue).await
    }

    pub async fn promote(&self, queue: &QueueName) -> Result<usize, QueueError> {
        self.store.promote(queue).await
    }
}
