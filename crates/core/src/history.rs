//! Terminal-task history sinks

use crate::types::{CompileResult, CompileTask, Priority, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Receives one record per task that reaches a terminal state
pub trait HistorySink: Send + Sync {
    fn record(&self, task: &CompileTask, result: Option<&CompileResult>);
}

/// Flattened summary of a finished task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub task_id: TaskId,
    pub project_path: PathBuf,
    pub command: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub cache_key: Option<String>,
    pub from_cache: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,
    pub success: Option<bool>,
    pub error_count: usize,
    pub message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn from_task(task: &CompileTask, result: Option<&CompileResult>) -> Self {
        let message = match task.status {
            TaskStatus::Cancelled => task.cancel_reason.clone(),
            TaskStatus::Failed if !task.error_output.is_empty() => {
                Some(task.error_output.clone())
            }
            _ => None,
        };

        Self {
            task_id: task.id,
            project_path: task.project_path.clone(),
            command: task.compiler.command.clone(),
            priority: task.priority,
            status: task.status,
            cache_key: task.cache_key.clone(),
            from_cache: task.from_cache,
            exit_code: task.exit_code,
            duration_ms: task.duration().map(|d| d.as_millis() as u64),
            success: result.map(|r| r.success),
            error_count: result.map(|r| r.counters.error_count).unwrap_or(0),
            message,
            recorded_at: Utc::now(),
        }
    }
}

/// In-memory history, mostly for tests and short-lived sessions
#[derive(Debug, Default)]
pub struct MemoryHistory {
    records: Mutex<Vec<HistoryRecord>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn count_for(&self, task_id: TaskId) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.task_id == task_id)
            .count()
    }
}

impl HistorySink for MemoryHistory {
    fn record(&self, task: &CompileTask, result: Option<&CompileResult>) {
        self.records
            .lock()
            .push(HistoryRecord::from_task(task, result));
    }
}

/// Discards every record
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHistory;

impl HistorySink for NoopHistory {
    fn record(&self, _task: &CompileTask, _result: Option<&CompileResult>) {}
}
