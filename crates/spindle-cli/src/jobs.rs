//! Jobs this binary can run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spindle_core::{Job, JobContext, JobRegistry, Outcome, RegistryError, TypedJob};
use tracing::info;

pub const KINDS: &[&str] = &[Hello::KIND, SendEmail::KIND];

pub fn registry() -> Result<JobRegistry, RegistryError> {
    let mut registry = JobRegistry::new();
    registry.register::<Hello>()?.register::<SendEmail>()?;
    Ok(registry)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub name: String,
}

#[async_trait]
impl Job for Hello {
    async fn handle(&self, _ctx: &JobContext) -> Outcome {
        if self.name.trim().is_empty() {
            return Outcome::fail("name is empty");
        }
        info!("Hello, {}!", self.name);
        Outcome::Success
    }
}

impl TypedJob for Hello {
    const KIND: &'static str = "hello";
}

/// Pretend mail delivery. `fail_times` makes the first attempts fail, which
/// is handy for watching retries from the shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendEmail {
    pub to: String,
    pub subject: String,
    #[serde(default)]
    pub fail_times: u32,
}

#[async_trait]
impl Job for SendEmail {
    async fn handle(&self, ctx: &JobContext) -> Outcome {
        if ctx.attempt <= self.fail_times {
            return Outcome::retry(format!(
                "intentional failure (attempt {} of {} planned)",
                ctx.attempt, self.fail_times
            ));
        }
        info!(to = %self.to, subject = %self.subject, "email sent");
        Outcome::Success
    }
}

impl TypedJob for SendEmail {
    const KIND: &'static str = "send_email";
}
