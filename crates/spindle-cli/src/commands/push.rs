//! Push command: enqueue one job

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use spindle_core::EnqueueOptions;
use spindle_core::config::Settings;

use super::{build_manager, require_shared_store};

/// Arguments for the `push` command
#[derive(Args, Debug)]
pub struct PushArgs {
    /// Job kind, e.g. `hello`
    pub kind: String,

    /// JSON object payload
    pub payload: String,

    /// Target queue
    #[arg(long)]
    pub queue: Option<String>,

    /// Seconds before the job becomes visible
    #[arg(long, value_name = "SECS")]
    pub delay: Option<u64>,

    /// Attempt budget
    #[arg(long)]
    pub tries: Option<u32>,

    /// Per-attempt timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

impl PushArgs {
    fn options(&self) -> EnqueueOptions {
        EnqueueOptions {
            queue: self.queue.clone().map(Into::into),
            delay: self.delay.map(Duration::from_secs),
            max_attempts: self.tries,
            timeout: self.timeout.map(Duration::from_secs),
        }
    }
}

pub async fn push(settings: Settings, args: PushArgs) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("payload is not valid JSON")?;
    require_shared_store(&settings)?;
    let manager = build_manager(&settings).await?;

    let id = manager
        .enqueue(args.kind.as_str(), payload, args.options())
        .await?;
    println!("{id}");
    Ok(())
}
