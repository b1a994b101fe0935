//! The tagged error value shared across the workspace
//!
//! Onitu distinguishes exactly three failure kinds:
//!
//! - [`Error::Driver`]: a configuration or contract violation attributable
//!   to the operator (bad path, negative timer, missing credentials). Fatal;
//!   the driver process exits and the supervisor decides restart policy.
//! - [`Error::Service`]: a transient backend or I/O failure. The current
//!   handler invocation fails and is reported; the referee re-issues the
//!   order on its own cadence. The plug never auto-retries at this layer.
//! - [`Error::StoreClosed`]: the metadata store has begun teardown. Workers
//!   treat this as a clean shutdown signal, not a failure.

use thiserror::Error;

/// Error value propagated by plug services, handlers, and adapters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Operator fault: bad configuration or a violated driver contract.
    #[error("driver error: {0}")]
    Driver(String),

    /// Transient backend or I/O fault; the invocation fails, no retry here.
    #[error("service error: {0}")]
    Service(String),

    /// The metadata store has been closed; shutdown is in progress.
    #[error("metadata store closed")]
    StoreClosed,
}

impl Error {
    /// Builds a [`Error::Driver`] from anything displayable.
    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }

    /// Builds a [`Error::Service`] from anything displayable.
    pub fn service(msg: impl Into<String>) -> Self {
        Self::Service(msg.into())
    }

    /// True when the error only signals that shutdown has begun.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::StoreClosed)
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
