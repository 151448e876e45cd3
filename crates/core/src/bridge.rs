//! The command-execution surface consumed by the scheduler.
//!
//! A [`CommandBridge`] runs one compile invocation and reports what happens
//! through a [`BridgeEventSink`]. The scheduler never knows how or where the
//! command runs; it only awaits the returned [`ProcessResult`] and, when it
//! wants the run to end early, trips the invocation's [`StopSignal`].

use crate::errors::Result;
use crate::types::{CompileTask, ProcessResult};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

/// Raw events streamed by a bridge while an invocation runs
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    StandardOutput(String),
    StandardError(String),
    Progress { percent: f32, message: String },
    Info(String),
    Warning(String),
    Error(String),
    Completed,
    Cancelled { reason: String },
}

/// Sending half handed to a bridge for one invocation
#[derive(Debug, Clone)]
pub struct BridgeEventSink {
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl BridgeEventSink {
    /// Create a sink and the receiver that drains it
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A sink whose events go nowhere
    pub fn detached() -> Self {
        let (sink, _rx) = Self::channel();
        sink
    }

    /// Emit an event. Never blocks; events are dropped once nobody listens.
    pub fn emit(&self, event: BridgeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn stdout(&self, line: impl Into<String>) {
        self.emit(BridgeEvent::StandardOutput(line.into()));
    }

    pub fn stderr(&self, line: impl Into<String>) {
        self.emit(BridgeEvent::StandardError(line.into()));
    }

    pub fn progress(&self, percent: f32, message: impl Into<String>) {
        self.emit(BridgeEvent::Progress {
            percent,
            message: message.into(),
        });
    }
}

/// Scheduler-side trigger for stopping a running invocation
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<Option<String>>,
}

/// Bridge-side view of a stop request
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<Option<String>>,
}

/// Create a connected stop handle and signal
pub fn stop_pair() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(None);
    (StopHandle { tx }, StopSignal { rx })
}

impl StopHandle {
    /// Ask the invocation to stop. Only the first reason is kept.
    pub fn stop(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(reason);
                true
            }
        });
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl StopSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (handle, signal) = stop_pair();
        // Dropping the handle leaves the value at `None` forever.
        drop(handle);
        signal
    }

    pub fn is_stopped(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Resolve with the stop reason once a stop is requested.
    ///
    /// Pends forever when the handle is dropped without stopping.
    pub async fn stopped(&mut self) -> String {
        loop {
            if let Some(reason) = self.rx.borrow_and_update().clone() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Executes compile invocations on behalf of the scheduler
#[async_trait]
pub trait CommandBridge: Send + Sync {
    /// Run one invocation of `task`'s compiler.
    ///
    /// Returning `Ok` with `success == false` is a compile failure; `Err` is
    /// a failure to execute at all. Implementations should watch `stop` and
    /// end promptly once it fires, emitting [`BridgeEvent::Cancelled`].
    async fn execute(
        &self,
        task: &CompileTask,
        events: BridgeEventSink,
        stop: StopSignal,
    ) -> Result<ProcessResult>;

    /// Name used in logs
    fn name(&self) -> &'static str {
        "bridge"
    }
}
