//! Running tasks and the bridge invocation each one wraps

use kiln_core::{
    BridgeEvent, BridgeEventSink, CommandBridge, CompileTask, EventBus, ProcessResult, Result,
    SchedulerEvent, StopHandle, StopSignal, TaskId,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Everything a bridge invocation produced
#[derive(Debug)]
pub(crate) struct RunOutcome {
    pub result: Result<ProcessResult>,
    pub stdout: String,
    pub stderr: String,
    pub progress_events: u32,
    /// Set when the bridge reported that it stopped early
    pub cancelled: Option<String>,
    pub elapsed: Duration,
}

/// A launched task occupying a concurrency slot
#[derive(Debug)]
pub(crate) struct RunningTask {
    pub handle: JoinHandle<RunOutcome>,
    pub stop: StopHandle,
    pub started: Instant,
    pub cache_key: Option<String>,
}

impl RunningTask {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn is_overdue(&self, timeout: Duration) -> bool {
        self.started.elapsed() > timeout
    }

    /// Stop tracking the slot but keep the invocation until it returns
    pub fn into_draining(self) -> DrainingTask {
        DrainingTask {
            handle: self.handle,
            cache_key: self.cache_key,
            since: Instant::now(),
        }
    }
}

/// A cancelled run whose bridge invocation has not returned yet.
///
/// It holds no concurrency slot, but its cache key stays claimed so parked
/// duplicates cannot start a second execution alongside it.
#[derive(Debug)]
pub(crate) struct DrainingTask {
    pub handle: JoinHandle<RunOutcome>,
    pub cache_key: Option<String>,
    pub since: Instant,
}

/// Run `task` through `bridge`, relaying its events onto `bus`
pub(crate) async fn invoke(
    bridge: Arc<dyn CommandBridge>,
    task: CompileTask,
    stop: StopSignal,
    bus: EventBus,
) -> RunOutcome {
    let started = Instant::now();
    let (sink, mut events) = BridgeEventSink::channel();
    let mut relay = Relay::new(task.id, bus);

    let execution = bridge.execute(&task, sink, stop);
    tokio::pin!(execution);

    let result = loop {
        tokio::select! {
            result = &mut execution => break result,
            Some(event) = events.recv() => relay.handle(event),
        }
    };
    drain(&mut events, &mut relay);

    RunOutcome {
        result,
        stdout: relay.stdout,
        stderr: relay.stderr,
        progress_events: relay.progress_events,
        cancelled: relay.cancelled,
        elapsed: started.elapsed(),
    }
}

fn drain(events: &mut mpsc::UnboundedReceiver<BridgeEvent>, relay: &mut Relay) {
    while let Ok(event) = events.try_recv() {
        relay.handle(event);
    }
}

struct Relay {
    task_id: TaskId,
    bus: EventBus,
    stdout: String,
    stderr: String,
    progress_events: u32,
    cancelled: Option<String>,
}

impl Relay {
    fn new(task_id: TaskId, bus: EventBus) -> Self {
        Self {
            task_id,
            bus,
            stdout: String::new(),
            stderr: String::new(),
            progress_events: 0,
            cancelled: None,
        }
    }

    fn handle(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::StandardOutput(line) => push_line(&mut self.stdout, &line),
            BridgeEvent::StandardError(line) => push_line(&mut self.stderr, &line),
            BridgeEvent::Progress { percent, message } => {
                self.progress_events += 1;
                self.bus.publish(SchedulerEvent::TaskProgress {
                    task_id: self.task_id,
                    percent,
                    message,
                });
            }
            BridgeEvent::Info(message) => {
                tracing::debug!(task_id = %self.task_id, %message, "Bridge info");
            }
            BridgeEvent::Warning(message) => self.bus.publish(SchedulerEvent::Warning {
                task_id: Some(self.task_id),
                message,
            }),
            BridgeEvent::Error(message) => self.bus.publish(SchedulerEvent::Error {
                task_id: Some(self.task_id),
                message,
            }),
            BridgeEvent::Completed => {
                tracing::trace!(task_id = %self.task_id, "Bridge reported completion");
            }
            BridgeEvent::Cancelled { reason } => self.cancelled = Some(reason),
        }
    }
}

fn push_line(buffer: &mut String, line: &str) {
    buffer.push_str(line);
    if !line.ends_with('\n') {
        buffer.push('\n');
    }
}
