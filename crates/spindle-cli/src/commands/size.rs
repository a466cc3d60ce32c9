//! Size command

use anyhow::Result;
use clap::Args;
use spindle_core::QueueName;
use spindle_core::config::Settings;

use super::{build_manager, require_shared_store};

/// Arguments for the `size` command
#[derive(Args, Debug)]
pub struct SizeArgs {
    /// Queue to inspect; all configured queues when omitted
    #[arg(long)]
    pub queue: Option<String>,
}

pub async fn size(settings: Settings, args: SizeArgs) -> Result<()> {
    require_shared_store(&settings)?;
    let manager = build_manager(&settings).await?;
    let queues = match args.queue {
        Some(queue) => vec![QueueName::new(queue)],
        None => settings.queues.clone(),
    };

    for queue in &queues {
        let ready = manager.size(queue).await?;
        let delayed = manager.delayed_size(queue).await?;
        println!("{queue}\tready={ready}\tdelayed={delayed}");
    }
    Ok(())
}
