//! Core domain types for kiln.
//!
//! - **`ids`**: task identifiers
//! - **`status`**: the task lifecycle state machine
//! - **`task`**: compile requests, compiler configuration and tasks
//! - **`result`**: bridge and compile results, structured diagnostics

pub mod ids;
pub mod result;
pub mod status;
pub mod task;

pub use ids::*;
pub use result::*;
pub use status::*;
pub use task::*;
