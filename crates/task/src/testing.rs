//! Scripted [`CommandBridge`] for exercising the scheduler without
//! spawning processes

use async_trait::async_trait;
use kiln_core::{
    BridgeEvent, BridgeEventSink, CommandBridge, CompileTask, Error, ProcessResult, Result,
    StopSignal, TaskId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// How a scripted invocation ends
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Succeed { output: String },
    Fail { error_output: String, exit_code: i32 },
    /// The bridge itself errors instead of reporting an exit status
    BridgeError { message: String },
    Panic,
}

/// One scripted invocation
#[derive(Debug, Clone)]
pub struct MockStep {
    pub delay: Duration,
    pub outcome: MockOutcome,
    pub progress: Vec<f32>,
    /// When false the invocation ignores stop requests and runs out its delay
    pub honor_stop: bool,
}

impl MockStep {
    pub fn succeed(output: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: MockOutcome::Succeed {
                output: output.into(),
            },
            progress: Vec::new(),
            honor_stop: true,
        }
    }

    pub fn fail(error_output: impl Into<String>, exit_code: i32) -> Self {
        Self {
            outcome: MockOutcome::Fail {
                error_output: error_output.into(),
                exit_code,
            },
            ..Self::succeed("")
        }
    }

    pub fn bridge_error(message: impl Into<String>) -> Self {
        Self {
            outcome: MockOutcome::BridgeError {
                message: message.into(),
            },
            ..Self::succeed("")
        }
    }

    pub fn panic() -> Self {
        Self {
            outcome: MockOutcome::Panic,
            ..Self::succeed("")
        }
    }

    /// Runs until stopped
    pub fn hang() -> Self {
        Self::succeed("").with_delay(Duration::from_secs(24 * 60 * 60))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_progress(mut self, percents: impl IntoIterator<Item = f32>) -> Self {
        self.progress = percents.into_iter().collect();
        self
    }

    pub fn ignoring_stop(mut self) -> Self {
        self.honor_stop = false;
        self
    }
}

/// Test double keyed by compiler command.
///
/// Commands without a script run the default step. Every call is recorded,
/// along with the peak number of concurrent invocations.
#[derive(Debug)]
pub struct MockBridge {
    default_step: MockStep,
    scripts: Mutex<HashMap<String, MockStep>>,
    calls: Mutex<Vec<TaskId>>,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl Default for MockBridge {
    fn default() -> Self {
        Self::new(MockStep::succeed("ok"))
    }
}

impl MockBridge {
    pub fn new(default_step: MockStep) -> Self {
        Self {
            default_step,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
        }
    }

    /// Script what invocations of `command` do
    pub fn script(&self, command: impl Into<String>, step: MockStep) -> &Self {
        self.scripts.lock().insert(command.into(), step);
        self
    }

    /// Ids of the tasks executed so far, in call order
    pub fn calls(&self) -> Vec<TaskId> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    fn step_for(&self, command: &str) -> MockStep {
        self.scripts
            .lock()
            .get(command)
            .cloned()
            .unwrap_or_else(|| self.default_step.clone())
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CommandBridge for MockBridge {
    async fn execute(
        &self,
        task: &CompileTask,
        events: BridgeEventSink,
        mut stop: StopSignal,
    ) -> Result<ProcessResult> {
        self.calls.lock().push(task.id);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        let step = self.step_for(&task.compiler.command);
        for percent in &step.progress {
            events.progress(*percent, format!("{percent}%"));
        }

        if step.honor_stop {
            tokio::select! {
                _ = tokio::time::sleep(step.delay) => {}
                reason = stop.stopped() => {
                    events.emit(BridgeEvent::Cancelled { reason: reason.clone() });
                    return Err(Error::Cancelled { task_id: task.id.to_string(), reason });
                }
            }
        } else {
            tokio::time::sleep(step.delay).await;
        }

        match step.outcome {
            MockOutcome::Succeed { output } => {
                events.stdout(output.clone());
                events.emit(BridgeEvent::Completed);
                Ok(ProcessResult::succeeded(output))
            }
            MockOutcome::Fail {
                error_output,
                exit_code,
            } => {
                events.stderr(error_output.clone());
                Ok(ProcessResult::failed(error_output, Some(exit_code)))
            }
            MockOutcome::BridgeError { message } => {
                Err(Error::bridge(&task.compiler.command, message, None))
            }
            MockOutcome::Panic => panic!("scripted bridge panic"),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
