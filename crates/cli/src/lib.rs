//! Command-line front end for the kiln compile scheduler

pub mod commands;
pub mod logging;
pub mod report;
pub mod runtime;
pub mod settings;

pub use commands::Commands;
pub use settings::GlobalArgs;

use clap::Parser;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "kiln")]
#[command(about = "Priority-scheduled, cached compile job runner", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<ExitCode> {
        let config = self.global.resolve()?;
        tracing::debug!(
            cache_dir = %config.cache.base_dir.display(),
            cache = config.cache.enabled,
            max_concurrent = config.scheduler.max_concurrent,
            "Configuration resolved"
        );

        match self.command {
            Commands::Compile(args) => args.execute(&self.global, &config).await,
            Commands::Batch(args) => args.execute(&self.global, &config).await,
            Commands::Cache { command } => {
                command.execute(&config).await?;
                Ok(ExitCode::SUCCESS)
            }
            Commands::History(args) => {
                args.execute(&self.global)?;
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}
