//! Flags shared by every subcommand and how they overlay the loaded config

use anyhow::{Context, Result};
use clap::{ArgAction, Args};
use kiln_task::KilnConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Args)]
pub struct GlobalArgs {
    /// Config file (defaults to $XDG_CONFIG_HOME/kiln/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Cache directory
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Maximum number of compiles running at once
    #[arg(long, global = true, value_name = "N")]
    pub max_concurrent: Option<usize>,

    /// Per-compile timeout in seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Compile everything, ignoring and not populating the cache
    #[arg(long, global = true)]
    pub no_cache: bool,

    /// Task history file (JSON lines)
    #[arg(long, global = true, value_name = "PATH")]
    pub history: Option<PathBuf>,

    /// More log output (repeatable)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

impl GlobalArgs {
    /// Defaults, config file and `KILN_*` environment, then these flags
    pub fn resolve(&self) -> Result<KilnConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let mut config = KilnConfig::from_file(path)
                    .with_context(|| format!("failed to load config {}", path.display()))?;
                config
                    .apply_env(|name| std::env::var(name).ok())
                    .context("invalid KILN_* environment")?;
                config
            }
            None => KilnConfig::load().context("failed to load configuration")?,
        };
        self.apply(&mut config);
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    pub fn apply(&self, config: &mut KilnConfig) {
        if let Some(dir) = &self.cache_dir {
            config.cache.base_dir = dir.clone();
        }
        if let Some(max) = self.max_concurrent {
            config.scheduler.max_concurrent = max;
        }
        if let Some(secs) = self.timeout {
            config.scheduler.task_timeout = Duration::from_secs(secs);
        }
        if self.no_cache {
            config.cache.enabled = false;
        }
    }

    pub fn history_path(&self) -> Option<PathBuf> {
        self.history.clone().or_else(default_history_path)
    }
}

/// `<data dir>/kiln/history.jsonl`
pub fn default_history_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("kiln").join("history.jsonl"))
}
