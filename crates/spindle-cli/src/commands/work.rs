//! Work command: one worker per invocation

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use spindle_core::config::{Settings, StoreSettings};
use spindle_core::{QueueName, RetryPolicy, Worker};
use tracing::{info, warn};

use super::build_manager;

/// Arguments for the `work` command
#[derive(Args, Debug, Default)]
pub struct WorkArgs {
    /// Queue to poll; repeat for several, earlier ones first
    #[arg(long = "queue", value_name = "NAME")]
    pub queues: Vec<String>,

    /// Seconds to sleep when no job is available
    #[arg(long, value_name = "SECS")]
    pub sleep: Option<u64>,

    /// Stop after this many jobs
    #[arg(long, value_name = "N")]
    pub max_jobs: Option<u64>,

    /// Stop after this many seconds
    #[arg(long, value_name = "SECS")]
    pub max_time: Option<u64>,

    /// Memory ceiling in MiB (0 disables)
    #[arg(long, value_name = "MB")]
    pub memory: Option<u64>,

    /// Retry delay: immediate, fixed:N, linear:N or exponential:N
    #[arg(long, value_name = "POLICY")]
    pub backoff: Option<RetryPolicy>,

    /// Let jobs run past their timeout
    #[arg(long)]
    pub no_timeout: bool,
}

impl WorkArgs {
    /// Flags win over file and environment settings.
    pub fn apply(self, settings: &mut Settings) {
        if !self.queues.is_empty() {
            settings.queues = self.queues.into_iter().map(QueueName::new).collect();
        }
        if let Some(sleep) = self.sleep {
            settings.sleep_secs = sleep;
        }
        if self.max_jobs.is_some() {
            settings.max_jobs = self.max_jobs;
        }
        if self.max_time.is_some() {
            settings.max_time_secs = self.max_time;
        }
        if let Some(memory) = self.memory {
            settings.memory_mb = memory;
        }
        if let Some(backoff) = self.backoff {
            settings.backoff = backoff;
        }
        if self.no_timeout {
            settings.enforce_timeout = false;
        }
    }
}

/// Run the worker; Ctrl-C lets the current job finish, then exits.
pub async fn work(mut settings: Settings, args: WorkArgs) -> Result<()> {
    args.apply(&mut settings);
    if settings.store == StoreSettings::Memory {
        warn!("memory store: only jobs enqueued by this process will run");
    }
    let manager = Arc::new(build_manager(&settings).await?);

    let mut worker = Worker::new(manager, settings.worker_options());
    let stop = worker.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("stop requested");
            stop.stop();
        }
    });

    let reason = worker.run().await;
    info!(%reason, processed = worker.processed(), "worker exited");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn flags_override_settings() {
        let mut settings = Settings::default();
        WorkArgs {
            queues: vec!["high".into(), "low".into()],
            sleep: Some(1),
            max_jobs: Some(5),
            memory: Some(0),
            backoff: Some(RetryPolicy::Fixed(Duration::from_secs(2))),
            no_timeout: true,
            ..WorkArgs::default()
        }
        .apply(&mut settings);

        let options = settings.worker_options();
        assert_eq!(options.queues, vec![QueueName::new("high"), QueueName::new("low")]);
        assert_eq!(options.sleep, Duration::from_secs(1));
        assert_eq!(options.max_jobs, Some(5));
        assert_eq!(options.max_run_time, None);
        assert_eq!(options.memory_limit, None);
        assert!(!options.enforce_timeout);
    }

    #[test]
    fn absent_flags_keep_settings() {
        let mut settings = Settings {
            sleep_secs: 9,
            ..Settings::default()
        };
        WorkArgs::default().apply(&mut settings);
        assert_eq!(settings, Settings {
            sleep_secs: 9,
            ..Settings::default()
        });
    }

    #[tokio::test]
    async fn bounded_worker_drains_and_exits() {
        let mut settings = Settings::default();
        WorkArgs {
            max_jobs: Some(1),
            memory: Some(0),
            ..WorkArgs::default()
        }
        .apply(&mut settings);

        // in-memory store: nothing to run, so seed it through the same manager
        let manager = Arc::new(build_manager(&settings).await.unwrap());
        manager
            .enqueue(
                "hello",
                serde_json::json!({"name": "spindle"}),
                spindle_core::EnqueueOptions::new(),
            )
            .await
            .unwrap();

        let mut worker = Worker::new(Arc::clone(&manager), settings.worker_options());
        assert_eq!(worker.run().await, spindle_core::StopReason::MaxJobs);
        assert_eq!(manager.size(&QueueName::default()).await.unwrap(), 0);
    }
}
