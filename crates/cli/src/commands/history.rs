use crate::settings::GlobalArgs;
use anyhow::{Context, Result};
use clap::Args;
use kiln_core::{HistoryRecord, TaskStatus};
use kiln_task::history::read_records;

#[derive(Debug, Args)]
pub struct HistoryArgs {
    /// How many of the most recent records to show
    #[arg(short = 'n', long, default_value_t = 20)]
    pub limit: usize,

    /// Only show records with this status
    #[arg(long, value_name = "STATUS")]
    pub status: Option<TaskStatus>,

    /// Print as JSON lines
    #[arg(long)]
    pub json: bool,
}

impl HistoryArgs {
    pub fn execute(self, global: &GlobalArgs) -> Result<()> {
        let Some(path) = global.history_path() else {
            println!("No history location is available on this platform");
            return Ok(());
        };
        if !path.exists() {
            println!("No history recorded yet");
            return Ok(());
        }

        let records = read_records(&path)
            .with_context(|| format!("failed to read history {}", path.display()))?;
        for record in select(records, self.status, self.limit) {
            if self.json {
                println!("{}", serde_json::to_string(&record)?);
            } else {
                println!("{}", render(&record));
            }
        }
        Ok(())
    }
}

/// The last `limit` records matching `status`, oldest first
pub fn select(
    records: Vec<HistoryRecord>,
    status: Option<TaskStatus>,
    limit: usize,
) -> Vec<HistoryRecord> {
    let matching: Vec<HistoryRecord> = records
        .into_iter()
        .filter(|r| status.map_or(true, |s| r.status == s))
        .collect();
    let skip = matching.len().saturating_sub(limit);
    matching.into_iter().skip(skip).collect()
}

fn render(record: &HistoryRecord) -> String {
    let when = record.recorded_at.format("%Y-%m-%d %H:%M:%S");
    let duration = record
        .duration_ms
        .map(|ms| format!(" {ms}ms"))
        .unwrap_or_default();
    let cached = if record.from_cache { " (cached)" } else { "" };
    format!(
        "{when} {:<9} {} {} [{}]{duration}{cached}",
        record.status, record.task_id, record.command, record.priority
    )
}
