//! CLI argument parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::commands::{self, PushArgs, SizeArgs, WorkArgs};
use crate::settings;

/// spindle - deferred job queue worker
#[derive(Parser, Debug)]
#[command(name = "spindle")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Settings file (TOML). `spindle.toml` in the working directory is
    /// read when present.
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a worker until a stop condition or Ctrl-C
    Work(WorkArgs),

    /// Enqueue one job
    Push(PushArgs),

    /// Show ready and delayed counts
    Size(SizeArgs),
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> anyhow::Result<()> {
        let settings = settings::load(self.config.as_deref())?;
        match self.command {
            Commands::Work(args) => commands::work(settings, args).await,
            Commands::Push(args) => commands::push(settings, args).await,
            Commands::Size(args) => commands::size(settings, args).await,
        }
    }
}
