//! CLI commands

mod push;
mod size;
mod work;

use std::sync::Arc;

use anyhow::bail;
use spindle_core::JobManager;
use spindle_core::config::{Settings, StoreSettings};
use spindle_core::ports::{Clock, SystemClock};

pub use push::{PushArgs, push};
pub use size::{SizeArgs, size};
pub use work::{WorkArgs, work};

use crate::jobs;

/// Manager over the configured store with every demo job registered.
pub async fn build_manager(settings: &Settings) -> anyhow::Result<JobManager> {
    settings.validate()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = settings.open_store(Arc::clone(&clock)).await?;

    let manager = JobManager::builder()
        .store(store)
        .registry(jobs::registry()?)
        .clock(clock)
        .default_max_attempts(settings.tries)
        .default_timeout(settings.default_timeout())
        .expect_kinds(jobs::KINDS)
        .build()?;
    Ok(manager)
}

/// `push` and `size` exit right away, so an in-process store would only ever
/// show them their own jobs.
pub fn require_shared_store(settings: &Settings) -> anyhow::Result<()> {
    if settings.store == StoreSettings::Memory {
        bail!(
            "the memory store does not outlive this command; \
             set store.backend to \"file\" or \"redis\""
        );
    }
    Ok(())
}
