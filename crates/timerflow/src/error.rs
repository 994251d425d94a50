//! Error types for timerflow.

use thiserror::Error;

use crate::workflow::WorkflowKey;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while generating or executing timer tasks.
///
/// Redispatch and discard are *not* errors; they are reported through
/// [`TaskOutcome`](crate::TaskOutcome). Everything here is either transient
/// (the dispatch layer retries with its own backoff) or an invariant failure
/// that parks the task for inspection. See [`Error::is_retryable`].
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to serialize or deserialize persisted state.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A concurrent writer advanced the execution before this update.
    ///
    /// The executor reloads and retries a bounded number of times before
    /// surfacing this upward.
    #[error("condition failed for {workflow}: expected db version {expected}, found {actual}")]
    ConditionFailed {
        /// The execution being updated.
        workflow: WorkflowKey,
        /// The db version the update was based on.
        expected: i64,
        /// The db version currently stored.
        actual: i64,
    },

    /// The execution does not exist in the store.
    #[error("workflow execution not found: {0}")]
    EntityNotExists(WorkflowKey),

    /// Persistence backend failure.
    #[error("store error: {0}")]
    Store(String),

    /// The history resender failed to pull missing events from the active cluster.
    #[error("history resend failed for {workflow}: {message}")]
    Resend {
        /// The execution whose history was requested.
        workflow: WorkflowKey,
        /// Transport or remote error message.
        message: String,
    },

    /// The per-execution lease could not be acquired before the deadline.
    #[error("timed out acquiring execution lease for {0}")]
    LeaseTimeout(WorkflowKey),

    /// A task attempt exceeded its deadline.
    #[error("task attempt timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The task references a cluster this process has no executor for.
    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// State the timer state machine cannot interpret.
    ///
    /// Fatal for the task being processed, never for the process.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an internal (invariant) error.
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// Create a store error from any displayable backend error.
    pub fn store(err: impl std::fmt::Display) -> Self {
        Error::Store(err.to_string())
    }

    /// Returns `true` if the dispatch layer should retry the task with backoff.
    ///
    /// Invariant failures, bad configuration and undecodable state will not
    /// change on retry, so they are reported as non-retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Internal(_) | Error::InvalidConfig(_) | Error::Serialization(_)
        )
    }
}
