//! Error types for the cache system
//!
//! Every variant carries a [`RecoveryHint`]. Callers outside this crate
//! rarely see these errors: lookups absorb them and report a miss.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Error type for cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// I/O errors during cache operations
    #[error("cache I/O error during {operation} on '{path}': {source}")]
    Io {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: std::io::Error,
        recovery_hint: RecoveryHint,
    },

    /// Serialization/deserialization errors
    #[error("failed to {operation} cache record '{key}': {source}")]
    Serialization {
        key: String,
        operation: SerializationOp,
        #[source]
        source: serde_json::Error,
        recovery_hint: RecoveryHint,
    },

    /// Cache corruption detected
    #[error("corrupted cache entry '{key}': {reason}")]
    Corruption {
        key: String,
        reason: String,
        recovery_hint: RecoveryHint,
    },

    /// Key that cannot be stored or derived
    #[error("invalid cache key '{key}': {reason}")]
    InvalidKey {
        key: String,
        reason: String,
        recovery_hint: RecoveryHint,
    },

    /// Configuration error
    #[error("invalid cache configuration: {message}")]
    Configuration {
        message: String,
        recovery_hint: RecoveryHint,
    },
}

/// Recovery hints for error handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryHint {
    /// Retry the operation
    Retry { after: Duration },
    /// Clear the cache and retry
    ClearAndRetry,
    /// Check file permissions
    CheckPermissions { path: PathBuf },
    /// Update cache configuration
    UpdateConfiguration,
    /// Operation can be safely ignored
    Ignore,
}

/// Serialization operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationOp {
    Serialize,
    Deserialize,
}

impl fmt::Display for SerializationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialize => f.write_str("serialize"),
            Self::Deserialize => f.write_str("deserialize"),
        }
    }
}

impl CacheError {
    /// Build an I/O error with a hint derived from the error kind
    pub fn io(path: impl Into<PathBuf>, operation: &'static str, source: std::io::Error) -> Self {
        let path = path.into();
        let recovery_hint = match source.kind() {
            std::io::ErrorKind::PermissionDenied => RecoveryHint::CheckPermissions {
                path: path.clone(),
            },
            std::io::ErrorKind::NotFound => RecoveryHint::Ignore,
            _ => RecoveryHint::Retry {
                after: Duration::from_millis(100),
            },
        };
        Self::Io {
            path,
            operation,
            source,
            recovery_hint,
        }
    }

    pub fn corruption(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corruption {
            key: key.into(),
            reason: reason.into(),
            recovery_hint: RecoveryHint::ClearAndRetry,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            recovery_hint: RecoveryHint::UpdateConfiguration,
        }
    }

    /// Get the recovery hint for this error
    #[must_use]
    pub const fn recovery_hint(&self) -> &RecoveryHint {
        match self {
            Self::Io { recovery_hint, .. }
            | Self::Serialization { recovery_hint, .. }
            | Self::Corruption { recovery_hint, .. }
            | Self::InvalidKey { recovery_hint, .. }
            | Self::Configuration { recovery_hint, .. } => recovery_hint,
        }
    }

    /// Check if this error indicates data corruption
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corruption { .. }
                | Self::Serialization {
                    operation: SerializationOp::Deserialize,
                    ..
                }
        )
    }
}

impl From<CacheError> for kiln_core::Error {
    fn from(error: CacheError) -> Self {
        match error {
            CacheError::Io {
                path,
                operation,
                source,
                ..
            } => kiln_core::Error::file_system(path, operation, source),
            other => kiln_core::Error::configuration(other.to_string()),
        }
    }
}
