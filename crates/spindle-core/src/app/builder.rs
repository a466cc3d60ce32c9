//! ManagerBuilder - JobManager の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - `expect_kinds()` でこのプロセスが処理するはずの job kind を宣言
//! - `build()` 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - 不足があれば `BuildError::MissingKinds` を返す（実行中に unknown kind で
//!   job を捨てるより、起動時に落ちるほうがよい）

use std::sync::Arc;
use std::time::Duration;

use super::manager::JobManager;
use crate::domain::{DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT, JobKind, QueueName};
use crate::impls::ListStore;
use crate::job::JobRegistry;
use crate::ports::{Clock, QueueStore, SystemClock, UlidGenerator};

/// # 使用例
/// ```ignore
/// let mut registry = JobRegistry::new();
/// registry.register::<SendEmail>()?;
///
/// let manager = ManagerBuilder::new()
///     .store(Arc::new(ListStore::new()))
///     .registry(registry)
///     .expect_kinds(&["send_email"])
///     .build()?;
/// ```
pub struct ManagerBuilder {
    store: Option<Arc<dyn QueueStore>>,
    registry: JobRegistry,
    clock: Arc<dyn Clock>,
    default_queue: QueueName,
    default_max_attempts: u32,
    default_timeout: Duration,
    expected_kinds: Option<Vec<JobKind>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing job kinds: {0:?}. These kinds were expected but not registered.")]
    MissingKinds(Vec<JobKind>),
}

impl ManagerBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            registry: JobRegistry::new(),
            clock: Arc::new(SystemClock),
            default_queue: QueueName::default(),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            default_timeout: DEFAULT_TIMEOUT,
            expected_kinds: None,
        }
    }

    /// Backend to use. Defaults to an in-memory `ListStore` on the builder's clock.
    pub fn store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(mut self, registry: JobRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Clock for `created_at`, delays and id timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn default_queue(mut self, queue: impl Into<QueueName>) -> Self {
        self.default_queue = queue.into();
        self
    }

    /// Attempt budget for jobs enqueued without an explicit `max_attempts`.
    pub fn default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn expect_kinds(mut self, kinds: &[&str]) -> Self {
        self.expected_kinds = Some(kinds.iter().map(|k| JobKind::new(*k)).collect());
        self
    }

    pub fn build(self) -> Result<JobManager, BuildError> {
        if let Some(expected) = &self.expected_kinds {
            let missing: Vec<JobKind> = expected
                .iter()
                .filter(|k| !self.registry.contains(k))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingKinds(missing));
            }
        }

        let clock = self.clock;
        let store: Arc<dyn QueueStore> = match self.store {
            Some(store) => store,
            None => Arc::new(ListStore::with_clock(Arc::clone(&clock))),
        };

        Ok(JobManager {
            store,
            registry: Arc::new(self.registry),
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
            default_queue: self.default_queue,
            default_max_attempts: self.default_max_attempts,
            default_timeout: self.default_timeout,
        })
    }
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
