use crate::report;
use crate::runtime::Session;
use crate::settings::GlobalArgs;
use anyhow::{bail, Context, Result};
use clap::Args;
use kiln_core::{CompileRequest, TaskId};
use kiln_task::KilnConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Debug, Args)]
pub struct BatchArgs {
    /// JSON manifest: an array of compile requests, or `{"requests": [...]}`
    pub manifest: PathBuf,

    /// Print the finished tasks as a JSON array
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Manifest {
    List(Vec<CompileRequest>),
    Wrapped { requests: Vec<CompileRequest> },
}

/// Parse a manifest. Relative project paths resolve against `base`.
pub fn parse_manifest(content: &str, base: &Path) -> Result<Vec<CompileRequest>> {
    let manifest: Manifest =
        serde_json::from_str(content).context("manifest is not a list of compile requests")?;
    let mut requests = match manifest {
        Manifest::List(requests) | Manifest::Wrapped { requests } => requests,
    };
    for request in &mut requests {
        if request.project_path.is_relative() {
            request.project_path = base.join(&request.project_path);
        }
    }
    Ok(requests)
}

pub fn load_manifest(path: &Path) -> Result<Vec<CompileRequest>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_manifest(&content, base).with_context(|| format!("invalid manifest {}", path.display()))
}

impl BatchArgs {
    pub async fn execute(self, global: &GlobalArgs, config: &KilnConfig) -> Result<ExitCode> {
        let requests = load_manifest(&self.manifest)?;
        if requests.is_empty() {
            bail!("manifest {} has no compile requests", self.manifest.display());
        }
        // reject the whole batch before anything runs
        for (index, request) in requests.iter().enumerate() {
            request
                .validate()
                .with_context(|| format!("request #{index} is invalid"))?;
        }

        let session = Session::start(global, config)?;
        let mut ids: Vec<TaskId> = Vec::with_capacity(requests.len());
        for request in requests {
            match session.scheduler.add_task(request) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    session.close().await;
                    return Err(e).context("compile request rejected");
                }
            }
        }
        tracing::info!(count = ids.len(), "Submitted batch");

        let tasks = session.run_to_completion(&ids).await;
        session.close().await;
        let tasks = tasks?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&tasks)?);
        } else {
            for task in &tasks {
                print!("{}", report::render(task));
            }
            let (ok, failed, cancelled, cached) = report::tally(&tasks);
            println!("{ok} succeeded ({cached} cached), {failed} failed, {cancelled} cancelled");
        }
        Ok(report::exit_code(&tasks))
    }
}
