//! File-backed task history

use kiln_core::{CompileResult, CompileTask, Error, HistoryRecord, HistorySink, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Appends one JSON line per finished task
#[derive(Debug)]
pub struct JsonlHistory {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlHistory {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::file_system(parent, "create history directory", e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::file_system(&path, "open history file", e))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every record written so far. Lines that fail to parse are skipped.
    pub fn read_all(&self) -> Result<Vec<HistoryRecord>> {
        read_records(&self.path)
    }
}

/// Parse a history file written by [`JsonlHistory`]
pub fn read_records(path: &Path) -> Result<Vec<HistoryRecord>> {
    let file = File::open(path).map_err(|e| Error::file_system(path, "open history file", e))?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| Error::file_system(path, "read history file", e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(e) => tracing::debug!(error = %e, "Skipping malformed history line"),
        }
    }
    Ok(records)
}

impl HistorySink for JsonlHistory {
    fn record(&self, task: &CompileTask, result: Option<&CompileResult>) {
        let record = HistoryRecord::from_task(task, result);
        let mut line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Failed to encode history record");
                return;
            }
        };
        line.push('\n');

        let mut file = self.file.lock();
        let written = file.write_all(line.as_bytes());
        if let Err(e) = written.and_then(|()| file.flush()) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to append history record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{CompileRequest, CompilerConfig, TaskStatus};
    use tempfile::TempDir;

    #[test]
    fn appends_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs/history.jsonl");

        let mut task = CompileTask::admit(CompileRequest::new("/p", CompilerConfig::new("cc")));
        task.cancel("not needed").unwrap();

        JsonlHistory::open(&path).unwrap().record(&task, None);
        let history = JsonlHistory::open(&path).unwrap();
        history.record(&task, None);

        let records = history.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].task_id, task.id);
        assert_eq!(records[0].status, TaskStatus::Cancelled);
        assert_eq!(records[0].message.as_deref(), Some("not needed"));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        std::fs::write(&path, "not json\n\n").unwrap();
        assert!(read_records(&path).unwrap().is_empty());
    }
}
