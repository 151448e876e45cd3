//! Task queue and scheduler for kiln
//!
//! [`Scheduler`] admits compile requests, consults the cache, and runs the
//! rest through a [`kiln_core::CommandBridge`] with bounded concurrency,
//! priority ordering, timeouts and cancellation.

pub mod bridge;
pub mod config;
mod dispatch;
pub mod history;
mod inflight;
pub mod queue;
mod running;
pub mod scheduler;
pub mod state;
pub mod testing;

pub use bridge::ProcessBridge;
pub use config::{default_config_path, KilnConfig, SchedulerConfig};
pub use history::JsonlHistory;
pub use queue::TaskQueue;
pub use scheduler::{Scheduler, CANCEL_REASON, SHUTDOWN_REASON};
pub use state::SchedulerState;
