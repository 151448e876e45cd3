use crate::report;
use crate::runtime::Session;
use crate::settings::GlobalArgs;
use anyhow::{Context, Result};
use clap::Args;
use kiln_core::{CompileRequest, CompilerConfig, OptimizationLevel, Priority};
use kiln_task::KilnConfig;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Args)]
pub struct CompileArgs {
    /// Compiler command to run
    pub command: String,

    /// Arguments passed to the compiler (put them after `--`)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Project directory the compiler runs in
    #[arg(short = 'C', long, value_name = "DIR", default_value = ".")]
    pub project: PathBuf,

    /// Source file hashed into the cache key (repeatable)
    #[arg(short, long = "source", value_name = "FILE")]
    pub sources: Vec<PathBuf>,

    /// Artifact the compile produces (repeatable)
    #[arg(short, long = "output", value_name = "FILE")]
    pub outputs: Vec<PathBuf>,

    /// low, normal, high or critical
    #[arg(short, long, default_value = "normal")]
    pub priority: Priority,

    /// Optimization level: O0, O1, O2, O3 or Os
    #[arg(short = 'O', long = "opt", default_value = "O0")]
    pub optimization: OptimizationLevel,

    /// Build with debug info
    #[arg(short = 'g', long)]
    pub debug: bool,

    /// Enable compiler warnings
    #[arg(short = 'W', long)]
    pub warnings: bool,

    /// Extra environment for the compiler, as KEY=VALUE (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Print the finished task as JSON
    #[arg(long)]
    pub json: bool,
}

impl CompileArgs {
    pub fn to_request(&self) -> CompileRequest {
        let mut compiler = CompilerConfig::new(&self.command)
            .with_args(&self.args)
            .with_optimization(self.optimization)
            .with_debug(self.debug)
            .with_warnings(self.warnings);
        for output in &self.outputs {
            compiler = compiler.with_output(output);
        }

        let mut request = CompileRequest::new(&self.project, compiler)
            .with_sources(&self.sources)
            .with_priority(self.priority);
        for (key, value) in &self.env {
            request = request.with_env(key, value);
        }
        request
    }

    pub async fn execute(self, global: &GlobalArgs, config: &KilnConfig) -> Result<ExitCode> {
        let request = self.to_request();
        let session = Session::start(global, config)?;
        let id = session
            .scheduler
            .add_task(request)
            .context("compile request rejected")?;
        tracing::debug!(task_id = %id, "Submitted compile");

        let tasks = session.run_to_completion(&[id]).await;
        session.close().await;
        let tasks = tasks?;

        for task in &tasks {
            if self.json {
                println!("{}", serde_json::to_string_pretty(task)?);
            } else {
                print!("{}", report::render(task));
            }
        }
        Ok(report::exit_code(&tasks))
    }
}

/// `KEY=VALUE`, splitting on the first `=`
pub fn parse_env_pair(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}
