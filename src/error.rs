//! # Errors
//!
//! Both primitives report failures synchronously to the caller, nothing gets retried internally.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// the thread got interrupted while parked (or was interrupted before it parked)
    #[error("wait interrupted")]
    Interrupted,
    /// misuse of a primitive, e.g. a deregistered party arriving again
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// only produced by the `*_timeout` flavours of the waits
    #[error("wait timed out")]
    TimedOut,
}

impl SyncError {
    pub(crate) fn illegal(reason: impl Into<String>) -> Self {
        Self::IllegalState(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
