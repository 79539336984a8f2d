//! Error types for vbox-snapshotter

use crate::types::LockType;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for vbox-snapshotter operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the virtualization platform
#[derive(Error, Debug)]
pub enum Error {
    #[error("Machine '{0}' not found")]
    MachineNotFound(String),

    #[error("Snapshot '{0}' not found")]
    SnapshotNotFound(String),

    #[error("Session is already locked ({0})")]
    SessionLocked(LockType),

    #[error("Session is not locked")]
    SessionNotLocked,

    #[error("{operation} failed: {reason}")]
    OperationFailed { operation: String, reason: String },

    #[error("{operation} did not complete within {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Unexpected platform output: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a failed platform operation
    pub fn operation(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::OperationFailed {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}
