//! Rendering finished tasks for the terminal

use kiln_core::{CompileTask, TaskStatus};
use std::fmt::Write as _;
use std::process::ExitCode;

/// One block per task: a status line, then any captured error text indented
pub fn render(task: &CompileTask) -> String {
    let mut out = String::new();
    let id = task.id;
    let command = &task.compiler.command;
    let millis = task
        .duration()
        .map(|d| d.as_millis())
        .or_else(|| task.result.as_ref().map(|r| u128::from(r.execution_time_ms)))
        .unwrap_or(0);

    let _ = match task.status {
        TaskStatus::Succeeded if task.from_cache => {
            writeln!(out, "ok      {id} {command} (cached)")
        }
        TaskStatus::Succeeded => writeln!(out, "ok      {id} {command} in {millis}ms"),
        TaskStatus::Failed => match task.exit_code {
            Some(code) => writeln!(out, "failed  {id} {command} (exit {code})"),
            None => writeln!(out, "failed  {id} {command}"),
        },
        TaskStatus::Cancelled => writeln!(
            out,
            "cancel  {id} {command}: {}",
            task.cancel_reason.as_deref().unwrap_or("cancelled")
        ),
        TaskStatus::Queued | TaskStatus::Running => {
            writeln!(out, "pending {id} {command} ({})", task.status)
        }
    };

    if task.status == TaskStatus::Failed {
        for line in task.error_output.lines().filter(|l| !l.trim().is_empty()) {
            let _ = writeln!(out, "    {line}");
        }
    }
    out
}

/// 0 when every task succeeded, 130 when any was cancelled, 1 otherwise
pub fn exit_code(tasks: &[CompileTask]) -> ExitCode {
    if tasks.iter().all(|t| t.status == TaskStatus::Succeeded) {
        ExitCode::SUCCESS
    } else if tasks.iter().any(|t| t.status == TaskStatus::Cancelled) {
        ExitCode::from(130)
    } else {
        ExitCode::FAILURE
    }
}

/// `(succeeded, failed, cancelled, from cache)`
pub fn tally(tasks: &[CompileTask]) -> (usize, usize, usize, usize) {
    tasks.iter().fold((0, 0, 0, 0), |(ok, failed, cancelled, cached), t| {
        match t.status {
            TaskStatus::Succeeded => (ok + 1, failed, cancelled, cached + usize::from(t.from_cache)),
            TaskStatus::Failed => (ok, failed + 1, cancelled, cached),
            TaskStatus::Cancelled => (ok, failed, cancelled + 1, cached),
            TaskStatus::Queued | TaskStatus::Running => (ok, failed, cancelled, cached),
        }
    })
}
