//! Dispatch error type.

use thiserror::Error;

/// Errors returned by [`AgentDispatcher::dispatch`](crate::AgentDispatcher::dispatch).
///
/// The orchestrator uses the variant to decide retry behaviour:
/// - `Retryable`: tried again with exponential back-off.
/// - `Fatal`    : given up immediately and reported.
///
/// Neither variant ever undoes the committed state transition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Transient failure (agent pool busy, transport hiccup).
    #[error("retryable dispatch error: {0}")]
    Retryable(String),

    /// Permanent failure (unknown role, rejected task).
    #[error("fatal dispatch error: {0}")]
    Fatal(String),
}
