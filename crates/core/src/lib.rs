//! Core domain types, errors, and events for `kiln`.
//!
//! ## Key Components
//!
//! - **`errors`**: the primary `Error` enum and `Result` alias.
//! - **`types`**: compile requests, tasks, the lifecycle state machine and
//!   compile results.
//! - **`events`**: the scheduler event bus.
//! - **`bridge`**: the `CommandBridge` trait through which compiles run.
//! - **`history`**: sinks receiving one record per finished task.

pub mod bridge;
pub mod errors;
pub mod events;
pub mod history;
pub mod serde_duration;
pub mod types;

pub use self::{
    bridge::{stop_pair, BridgeEvent, BridgeEventSink, CommandBridge, StopHandle, StopSignal},
    errors::{Error, Result},
    events::{EventBus, EventStats, EventSubscriber, PublishedEvent, SchedulerEvent},
    history::{HistoryRecord, HistorySink, MemoryHistory, NoopHistory},
    types::*,
};
