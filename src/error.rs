//! Error types for engine-gate.
//!
//! Every failure is strongly typed using thiserror and grouped by the
//! concern that produced it. Unit failures travel through the unit's own
//! ticket; lock, flush and transaction failures surface on the lifecycle
//! call or drain attempt that hit them.

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::SyncDirection;

/// Named lock failures.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to open lock file '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to acquire lock '{name}': {source}")]
    Acquire {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Lock registry for '{name}' is poisoned")]
    Poisoned {
        name: String,
    },

    #[error("Invalid lock name '{name}': {reason}")]
    InvalidName {
        name: String,
        reason: String,
    },
}

/// Filesystem synchronization failures.
#[derive(Debug, Error)]
#[error("{direction} flush failed: {message}")]
pub struct FlushError {
    /// Direction of the failed flush.
    pub direction: SyncDirection,
    /// Engine error text.
    pub message: String,
}

/// Failures raised by the engine or while building it.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine construction failed: {message}")]
    Construction {
        message: String,
    },

    #[error("Filesystem error at '{path}': {message}")]
    Filesystem {
        path: String,
        message: String,
    },

    #[error("No such file or directory: {path}")]
    NotFound {
        path: String,
    },

    #[error("Native call '{name}' failed: {message}")]
    Invoke {
        name: String,
        message: String,
    },

    #[error("Engine refresh did not complete within {duration_ms}ms")]
    RefreshTimeout {
        duration_ms: u64,
    },

    #[error("Engine refresh thread exited without reporting a result")]
    RefreshAbandoned,
}

/// Failures of a single queued unit or of waiting on its result.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Operation failed: {message}")]
    Operation {
        message: String,
    },

    #[error("Operation panicked: {message}")]
    Panicked {
        message: String,
    },

    #[error("Result channel for unit #{sequence} was dropped before settling")]
    Disconnected {
        sequence: u64,
    },

    #[error("Timed out after {duration_ms}ms waiting for unit #{sequence}")]
    Timeout {
        sequence: u64,
        duration_ms: u64,
    },
}

/// Transaction envelope failures.
///
/// Returned by `TransactionEnvelope` implementations from `begin` and
/// `commit`; the dispatcher also reports a panicking hook with it.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Transaction begin failed: {message}")]
    Begin {
        message: String,
    },

    #[error("Transaction commit failed: {message}")]
    Commit {
        message: String,
    },
}

/// Configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    Invalid {
        field: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {message}")]
    Parse {
        message: String,
    },

    #[error("Failed to read configuration file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level error type for engine-gate.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Flush error: {0}")]
    Flush(#[from] FlushError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl GateError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an operation failure, for use inside queued units.
    #[must_use]
    pub fn operation(message: impl Into<String>) -> Self {
        Self::Execution(ExecutionError::Operation {
            message: message.into(),
        })
    }

    /// Creates a flush failure for the given direction.
    #[must_use]
    pub fn flush(direction: SyncDirection, message: impl Into<String>) -> Self {
        Self::Flush(FlushError {
            direction,
            message: message.into(),
        })
    }

    /// Returns true if this is a lock error.
    #[must_use]
    pub const fn is_lock(&self) -> bool {
        matches!(self, Self::Lock(_))
    }

    /// Returns true if this is a flush error.
    #[must_use]
    pub const fn is_flush(&self) -> bool {
        matches!(self, Self::Flush(_))
    }

    /// Returns true if this is an engine error.
    #[must_use]
    pub const fn is_engine(&self) -> bool {
        matches!(self, Self::Engine(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is a transaction error.
    #[must_use]
    pub const fn is_transaction(&self) -> bool {
        matches!(self, Self::Transaction(_))
    }

    /// Returns true if the failure concerns the shared engine rather than a
    /// single unit, meaning the engine itself may be unusable.
    #[must_use]
    pub const fn is_shared_resource(&self) -> bool {
        matches!(
            self,
            Self::Lock(_) | Self::Flush(_) | Self::Engine(_) | Self::Transaction(_)
        )
    }
}

/// Result type alias for engine-gate operations.
pub type GateResult<T> = Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_error_names_direction() {
        let err = GateError::flush(SyncDirection::Populate, "disk unplugged");
        let msg = format!("{err}");
        assert!(msg.contains("populate"));
        assert!(msg.contains("disk unplugged"));
        assert!(err.is_flush());
        assert!(err.is_shared_resource());
    }

    #[test]
    fn test_operation_error_is_not_shared() {
        let err = GateError::operation("bad input");
        assert!(err.is_execution());
        assert!(!err.is_shared_resource());
        assert!(format!("{err}").contains("bad input"));
    }

    #[test]
    fn test_lock_error_from() {
        let err: GateError = LockError::Poisoned {
            name: "engine-fs-lock".to_string(),
        }
        .into();
        assert!(err.is_lock());
        assert!(format!("{err}").contains("engine-fs-lock"));
    }

    #[test]
    fn test_timeout_error_message() {
        let err = ExecutionError::Timeout {
            sequence: 7,
            duration_ms: 250,
        };
        let msg = format!("{err}");
        assert!(msg.contains("#7"));
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn test_transaction_errors() {
        let err: GateError = TransactionError::Commit {
            message: "busy".to_string(),
        }
        .into();
        assert!(err.is_transaction());
        assert!(format!("{err}").contains("commit failed"));
    }

    #[test]
    fn test_internal() {
        let err = GateError::internal("unexpected state");
        assert!(matches!(err, GateError::Internal { .. }));
        assert!(format!("{err}").contains("unexpected state"));
    }
}
