//! Worker / store settings.
//!
//! ここは serde の形とデフォルト値だけを持つ。ファイルや環境変数からの読み込みは
//! バイナリ側（`spindle-cli`）が `config` crate で行う。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::app::WorkerOptions;
use crate::domain::{DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT, QueueError, QueueName, RetryPolicy};
use crate::impls::index_store::DEFAULT_PREFIX;
use crate::impls::{FileKv, IndexStore, ListStore};
use crate::ports::{Clock, QueueStore};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("store backend '{0}' is not compiled in (enable the `{0}` feature)")]
    BackendUnavailable(&'static str),

    #[error("queue list must not be empty")]
    NoQueues,

    #[error("tries must be positive")]
    NoTries,

    #[error("could not open store: {0}")]
    Store(#[from] QueueError),
}

/// Which `QueueStore` to run on.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreSettings {
    /// In-process `ListStore`; jobs are lost on exit.
    #[default]
    Memory,
    /// `IndexStore` over a directory of files.
    File {
        path: PathBuf,
        #[serde(default = "default_prefix")]
        prefix: String,
    },
    /// `RedisStore` (feature `redis`).
    Redis {
        url: String,
        #[serde(default = "default_prefix")]
        prefix: String,
    },
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Polled in priority order.
    pub queues: Vec<QueueName>,
    pub sleep_secs: u64,
    /// Default attempt budget for new jobs.
    pub tries: u32,
    /// Default per-attempt timeout for new jobs.
    pub timeout_secs: u64,
    /// Resident memory ceiling in MiB; 0 disables the check.
    pub memory_mb: u64,
    pub max_jobs: Option<u64>,
    pub max_time_secs: Option<u64>,
    pub backoff: RetryPolicy,
    pub enforce_timeout: bool,
    pub store: StoreSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            queues: vec![QueueName::default()],
            sleep_secs: 3,
            tries: DEFAULT_MAX_ATTEMPTS,
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            memory_mb: 128,
            max_jobs: None,
            max_time_secs: None,
            backoff: RetryPolicy::Immediate,
            enforce_timeout: true,
            store: StoreSettings::Memory,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::NoQueues);
        }
        if self.tries == 0 {
            return Err(ConfigError::NoTries);
        }
        Ok(())
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            queues: self.queues.clone(),
            sleep: Duration::from_secs(self.sleep_secs),
            max_jobs: self.max_jobs,
            max_run_time: self.max_time_secs.map(Duration::from_secs),
            memory_limit: (self.memory_mb > 0).then(|| self.memory_mb * 1024 * 1024),
            backoff: self.backoff.clone(),
            enforce_timeout: self.enforce_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Open the configured backend.
    pub async fn open_store(&self, clock: Arc<dyn Clock>) -> Result<Arc<dyn QueueStore>, ConfigError> {
        match &self.store {
            StoreSettings::Memory => Ok(Arc::new(ListStore::with_clock(clock))),
            StoreSettings::File { path, prefix } => {
                let kv = FileKv::open(path).await?;
                Ok(Arc::new(IndexStore::with_clock(kv, clock).with_prefix(prefix.clone())))
            }
            #[cfg(feature = "redis")]
            StoreSettings::Redis { url, prefix } => Ok(Arc::new(
                crate::impls::RedisStore::with_clock(url, clock)?.with_prefix(prefix.clone()),
            )),
            #[cfg(not(feature = "redis"))]
            StoreSettings::Redis { .. } => Err(ConfigError::BackendUnavailable("redis")),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_support::{self, fixed_clock};

    #[test]
    fn empty_document_gives_defaults() {
        let settings: Settings = serde_json::from_value(json!({})).unwrap();
        assert_eq!(settings, Settings::default());

        let options = settings.worker_options();
        assert_eq!(options.queues, vec![QueueName::default()]);
        assert_eq!(options.sleep, Duration::from_secs(3));
        assert_eq!(options.memory_limit, Some(128 * 1024 * 1024));
        assert_eq!(options.backoff, RetryPolicy::Immediate);
        assert!(options.enforce_timeout);
        assert_eq!(settings.default_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn fields_override_defaults() {
        let settings: Settings = serde_json::from_value(json!({
            "queues": ["high", "default"],
            "memory_mb": 0,
            "max_time_secs": 600,
            "backoff": "exponential:2",
            "store": {"backend": "file", "path": "/var/lib/spindle"}
        }))
        .unwrap();

        let options = settings.worker_options();
        assert_eq!(options.queues[0].as_str(), "high");
        assert_eq!(options.memory_limit, None);
        assert_eq!(options.max_run_time, Some(Duration::from_secs(600)));
        assert_eq!(
            options.backoff,
            RetryPolicy::exponential(Duration::from_secs(2))
        );
        assert_eq!(
            settings.store,
            StoreSettings::File {
                path: PathBuf::from("/var/lib/spindle"),
                prefix: "spindle:queue:".into(),
            }
        );
    }

    #[test]
    fn bad_backoff_is_rejected() {
        let result: Result<Settings, _> = serde_json::from_value(json!({"backoff": "sometimes"}));
        assert!(result.is_err());
    }

    #[test]
    fn empty_queue_list_is_invalid() {
        let settings = Settings {
            queues: Vec::new(),
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(ConfigError::NoQueues)));
    }

    #[test]
    fn zero_tries_is_invalid() {
        let settings: Settings = serde_json::from_value(json!({"tries": 0})).unwrap();
        assert!(matches!(settings.validate(), Err(ConfigError::NoTries)));
        assert!(Settings::default().validate().is_ok());
    }

    #[tokio::test]
    async fn file_store_opens_in_the_configured_directory() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            store: StoreSettings::File {
                path: dir.path().join("jobs"),
                prefix: default_prefix(),
            },
            ..Settings::default()
        };

        let clock = fixed_clock();
        let store = settings.open_store(Arc::new(clock.clone())).await.unwrap();
        test_support::check_fifo(store.as_ref(), &clock).await;
        assert!(dir.path().join("jobs").is_dir());
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn redis_needs_the_feature() {
        let settings = Settings {
            store: StoreSettings::Redis {
                url: "redis://127.0.0.1/".into(),
                prefix: default_prefix(),
            },
            ..Settings::default()
        };
        let err = settings
            .open_store(Arc::new(fixed_clock()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::BackendUnavailable("redis")));
    }
}
