//! # Core Error Types
//!
//! Error handling for the MantisDB core with machine-readable kinds,
//! severity classification and the identifiers (LSN, resource, transaction,
//! snapshot id) the failing operation was working on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for core operations
pub type MantisResult<T> = Result<T, MantisError>;

/// Errors surfaced by the MantisDB core
#[derive(Debug, Error)]
pub enum MantisError {
    /// Entity lookup failures (key, snapshot, checkpoint, WAL record)
    #[error("not found: {0}")]
    NotFound(String),

    /// Attempt to create an entity that already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Concurrency limit reached (snapshots, streams)
    #[error("busy: {0}")]
    Busy(String),

    /// Lock acquisition timed out
    #[error("timeout acquiring {resource} for txn {txn} after {waited_ms}ms")]
    Timeout {
        txn: u64,
        resource: String,
        waited_ms: u64,
    },

    /// Operation observed a cancellation request
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Lock ordered below an already-held lock
    #[error(
        "hierarchy violation: txn {txn} holds order {held_order}, requested {resource} has order {requested_order}"
    )]
    HierarchyViolation {
        txn: u64,
        resource: String,
        requested_order: u64,
        held_order: u64,
    },

    /// Transaction chosen to break a deadlock cycle
    #[error("txn {txn} selected as deadlock victim waiting on {resource}")]
    DeadlockVictim { txn: u64, resource: String },

    /// Cache or storage limits cannot admit the value
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Checksum verification failed
    #[error("integrity failure at {location}: expected {expected}, got {actual}")]
    IntegrityFailure {
        location: String,
        expected: String,
        actual: String,
    },

    /// On-disk artifact is structurally corrupt (torn write, bad header)
    #[error("corruption detected at {location}: {detail}")]
    CorruptionDetected { location: String, detail: String },

    /// I/O operation failures
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration or arguments
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine is shutting down and no longer accepts work
    #[error("shutting down: {0}")]
    ShuttingDown(String),
}

/// Machine-readable error kind, stable across message changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Busy,
    Timeout,
    Cancelled,
    HierarchyViolation,
    DeadlockVictim,
    CapacityExceeded,
    IntegrityFailure,
    CorruptionDetected,
    Io,
    InvalidArgument,
    ShuttingDown,
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
}

impl MantisError {
    /// Machine-readable kind for callers that dispatch on error class
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::HierarchyViolation { .. } => ErrorKind::HierarchyViolation,
            Self::DeadlockVictim { .. } => ErrorKind::DeadlockVictim,
            Self::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            Self::IntegrityFailure { .. } => ErrorKind::IntegrityFailure,
            Self::CorruptionDetected { .. } => ErrorKind::CorruptionDetected,
            Self::Io(_) => ErrorKind::Io,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::ShuttingDown(_) => ErrorKind::ShuttingDown,
        }
    }

    /// Whether a retry of the same operation can reasonably succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Busy
                | ErrorKind::Timeout
                | ErrorKind::DeadlockVictim
                | ErrorKind::CapacityExceeded
                | ErrorKind::Io
        )
    }

    /// Severity used when reporting the error to the event sink
    pub fn severity(&self) -> ErrorSeverity {
        match self.kind() {
            ErrorKind::IntegrityFailure | ErrorKind::CorruptionDetected => ErrorSeverity::High,
            ErrorKind::Io | ErrorKind::InvalidArgument | ErrorKind::ShuttingDown => {
                ErrorSeverity::Medium
            }
            _ => ErrorSeverity::Low,
        }
    }

    /// Category label for metrics
    pub fn category(&self) -> &'static str {
        match self.kind() {
            ErrorKind::NotFound | ErrorKind::AlreadyExists => "data",
            ErrorKind::Busy | ErrorKind::CapacityExceeded => "resource",
            ErrorKind::Timeout
            | ErrorKind::Cancelled
            | ErrorKind::HierarchyViolation
            | ErrorKind::DeadlockVictim => "concurrency",
            ErrorKind::IntegrityFailure | ErrorKind::CorruptionDetected => "integrity",
            ErrorKind::Io => "io",
            ErrorKind::InvalidArgument => "configuration",
            ErrorKind::ShuttingDown => "lifecycle",
        }
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an invalid-argument error
    pub fn invalid<S: Into<String>>(what: S) -> Self {
        Self::InvalidArgument(what.into())
    }

    /// Create a busy error
    pub fn busy<S: Into<String>>(what: S) -> Self {
        Self::Busy(what.into())
    }
}

impl From<serde_json::Error> for MantisError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArgument(format!("JSON encoding: {}", err))
    }
}

impl From<bincode::Error> for MantisError {
    fn from(err: bincode::Error) -> Self {
        Self::CorruptionDetected {
            location: "payload".to_string(),
            detail: err.to_string(),
        }
    }
}
