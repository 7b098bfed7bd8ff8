//! Error types for bouvet-guest.

use std::fmt;
use thiserror::Error;

/// Result type alias for bouvet-guest operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur while driving guest devices, network or transport.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Something expected is absent (link by MAC, virtio port, PCI bridge).
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller supplied structurally invalid input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No handler is registered for the device type.
    #[error("unknown device type: {0}")]
    UnknownDeviceType(String),

    /// A kernel call failed during an otherwise valid operation.
    #[error("internal error: {0}")]
    Internal(String),

    /// The guest kernel lacks a required capability.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A hotplugged resource did not show up in time.
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout {
        /// What was being waited on
        what: String,
        /// How long we waited
        after: std::time::Duration,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by callers to tell configuration bugs
/// apart from transient hotplug races and kernel failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    Internal,
    Unsupported,
    DeadlineExceeded,
}

impl AgentError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::NotFound(_) => ErrorKind::NotFound,
            AgentError::InvalidArgument(_) | AgentError::UnknownDeviceType(_) => {
                ErrorKind::InvalidArgument
            }
            AgentError::Internal(_) | AgentError::Io(_) => ErrorKind::Internal,
            AgentError::Unsupported(_) => ErrorKind::Unsupported,
            AgentError::Timeout { .. } => ErrorKind::DeadlineExceeded,
        }
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        AgentError::NotFound(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        AgentError::InvalidArgument(msg.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        AgentError::Internal(msg.into())
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not-found"),
            ErrorKind::InvalidArgument => write!(f, "invalid-argument"),
            ErrorKind::Internal => write!(f, "internal"),
            ErrorKind::Unsupported => write!(f, "unsupported"),
            ErrorKind::DeadlineExceeded => write!(f, "deadline-exceeded"),
        }
    }
}

/// A failed reconciliation together with the best-known kernel state
/// observed after the failure.
///
/// `current` is `None` when the re-read itself failed.
#[derive(Debug)]
pub struct ReconcileError<T> {
    /// Why the reconciliation failed.
    pub source: AgentError,
    /// State re-read from the kernel after the failure.
    pub current: Option<T>,
}

impl<T> ReconcileError<T> {
    /// A failure that happened before anything was read back.
    pub fn new(source: AgentError) -> Self {
        Self {
            source,
            current: None,
        }
    }

    /// Attach the re-read state.
    pub fn with_current(source: AgentError, current: Option<T>) -> Self {
        Self { source, current }
    }
}

impl<T> fmt::Display for ReconcileError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.source, f)
    }
}

impl<T: fmt::Debug> std::error::Error for ReconcileError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl<T> From<AgentError> for ReconcileError<T> {
    fn from(source: AgentError) -> Self {
        Self::new(source)
    }
}

/// Combine the outcome of an operation with the outcome of a cleanup step
/// that ran after it regardless.
///
/// The operation's failure wins; a cleanup failure is only reported when the
/// operation itself succeeded.
pub fn finish_with_cleanup<T>(primary: Result<T>, cleanup: Result<()>) -> Result<T> {
    match (primary, cleanup) {
        (Err(e), Err(cleanup_err)) => {
            tracing::warn!(error = %cleanup_err, "cleanup failed after earlier error");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(_), Err(cleanup_err)) => Err(cleanup_err),
        (Ok(value), Ok(())) => Ok(value),
    }
}
