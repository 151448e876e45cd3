//! Bridge that runs the compiler as a local child process

use async_trait::async_trait;
use kiln_core::{
    BridgeEvent, BridgeEventSink, CommandBridge, CompileTask, CompilerConfig, Error,
    OptimizationLevel, ProcessResult, Result, StopSignal,
};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Runs `task.compiler.command` in the task's project directory.
///
/// Output is streamed line by line as bridge events. When the stop signal
/// fires the child is killed and the invocation reports cancellation.
#[derive(Debug, Default, Clone)]
pub struct ProcessBridge;

impl ProcessBridge {
    pub fn new() -> Self {
        Self
    }
}

/// Arguments passed to the compiler: the configured args followed by the
/// flags implied by non-default optimization, debug and warning settings
pub fn command_args(compiler: &CompilerConfig) -> Vec<String> {
    let mut args = compiler.args.clone();
    if compiler.optimization != OptimizationLevel::O0 {
        args.push(format!("-{}", compiler.optimization));
    }
    if compiler.debug {
        args.push("-g".to_string());
    }
    if compiler.warnings {
        args.push("-Wall".to_string());
    }
    args
}

/// Completion percentage from `[ 42%]` or `[3/10]` style progress prefixes
pub fn parse_progress(line: &str) -> Option<f32> {
    let inner = line.trim_start().strip_prefix('[')?;
    let (inner, _) = inner.split_once(']')?;
    let inner = inner.trim();
    if let Some(percent) = inner.strip_suffix('%') {
        return percent.trim().parse::<f32>().ok().map(|p| p.clamp(0.0, 100.0));
    }
    let (done, total) = inner.split_once('/')?;
    let done: f32 = done.trim().parse().ok()?;
    let total: f32 = total.trim().parse().ok()?;
    if total <= 0.0 {
        return None;
    }
    Some((done / total * 100.0).clamp(0.0, 100.0))
}

#[async_trait]
impl CommandBridge for ProcessBridge {
    async fn execute(
        &self,
        task: &CompileTask,
        events: BridgeEventSink,
        mut stop: StopSignal,
    ) -> Result<ProcessResult> {
        let command = &task.compiler.command;
        let args = command_args(&task.compiler);
        tracing::debug!(task_id = %task.id, %command, ?args, "Spawning compiler");

        let mut child = Command::new(command)
            .args(&args)
            .current_dir(&task.project_path)
            .envs(&task.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::bridge(command, format!("failed to spawn: {e}"), None))?;

        let stdout = child
            .stdout
            .take()
            .map(|out| spawn_reader(out, events.clone(), Stream::Stdout));
        let stderr = child
            .stderr
            .take()
            .map(|err| spawn_reader(err, events.clone(), Stream::Stderr));

        let finish = tokio::select! {
            status = child.wait() => Finish::Exited(status),
            reason = stop.stopped() => Finish::Stopped(reason),
        };
        let status = match finish {
            Finish::Exited(status) => status
                .map_err(|e| Error::bridge(command, format!("failed to wait: {e}"), None))?,
            Finish::Stopped(reason) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(task_id = %task.id, error = %e, "Failed to kill compiler");
                }
                events.emit(BridgeEvent::Cancelled {
                    reason: reason.clone(),
                });
                return Err(Error::Cancelled {
                    task_id: task.id.to_string(),
                    reason,
                });
            }
        };

        let output = collect(stdout).await;
        let error_output = collect(stderr).await;
        events.emit(BridgeEvent::Completed);

        Ok(ProcessResult {
            success: status.success(),
            output,
            error_output,
            exit_code: status.code(),
        })
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

enum Finish {
    Exited(std::io::Result<std::process::ExitStatus>),
    Stopped(String),
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn spawn_reader<R>(reader: R, events: BridgeEventSink, stream: Stream) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut captured = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(percent) = parse_progress(&line) {
                events.progress(percent, line.clone());
            }
            captured.push_str(&line);
            captured.push('\n');
            match stream {
                Stream::Stdout => events.stdout(line),
                Stream::Stderr => events.stderr(line),
            }
        }
        captured
    })
}

async fn collect(reader: Option<JoinHandle<String>>) -> String {
    match reader {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}
