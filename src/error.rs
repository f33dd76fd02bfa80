//! Error taxonomy for the session and command paths.

use crate::sandbox::ProviderError;
use std::time::Duration;

/// Outcomes of the public operations other than success.
///
/// `Rejected` and `Timeout` are expected user-facing results, not faults.
/// Teardown failures never appear here; they are logged and dropped.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    /// The admission policy refused the command.
    #[error("command rejected: {reason}")]
    Rejected { reason: String },

    /// Unknown or expired session id. The client has to start a new session.
    #[error("session not found")]
    SessionNotFound,

    /// The backend could not provision a sandbox. Not retried.
    #[error("failed to provision sandbox: {0}")]
    Provision(#[source] ProviderError),

    /// The command exceeded its wall-clock bound. The session survives.
    #[error("command timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The backend failed to run the command for reasons other than a timeout.
    #[error("sandbox execution failed: {0}")]
    Execution(#[source] ProviderError),
}

pub type Result<T> = std::result::Result<T, ShellError>;
