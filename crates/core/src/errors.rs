use crate::types::TaskStatus;
use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for kiln operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for kiln operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A compile request was rejected at admission
    #[error("invalid compile request: {message}")]
    Validation { message: String },

    /// A task status change that the lifecycle does not allow
    #[error("task '{task_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Unknown task id
    #[error("task '{task_id}' not found")]
    TaskNotFound { task_id: String },

    /// The command bridge could not run an invocation
    #[error("{}", format_bridge_error(.command, .message, .exit_code))]
    Bridge {
        command: String,
        message: String,
        exit_code: Option<i32>,
    },

    /// File system operations
    #[error("file system {operation} operation failed for '{path}': {source}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: serde_json::Error,
    },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Operation timeout errors
    #[error("operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// The operation was stopped before it finished
    #[error("task '{task_id}' was cancelled: {reason}")]
    Cancelled { task_id: String, reason: String },
}

fn format_bridge_error(command: &str, message: &str, exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("command '{command}' failed with exit code {code}: {message}"),
        None => format!("command '{command}' failed: {message}"),
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::FileSystem {
            path: PathBuf::new(),
            operation: "unknown".to_string(),
            source: error,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Json {
            message: error.to_string(),
            source: error,
        }
    }
}

// Helper methods for creating errors with context
impl Error {
    /// Create a validation error for a malformed request
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    /// Create a bridge execution error
    #[must_use]
    pub fn bridge(
        command: impl Into<String>,
        message: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Error::Bridge {
            command: command.into(),
            message: message.into(),
            exit_code,
        }
    }

    /// Create a file system error
    #[must_use]
    pub fn file_system(
        path: impl Into<PathBuf>,
        operation: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Error::FileSystem {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Create a task-not-found error
    #[must_use]
    pub fn task_not_found(task_id: impl ToString) -> Self {
        Error::TaskNotFound {
            task_id: task_id.to_string(),
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Whether the error represents a cancellation rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}
