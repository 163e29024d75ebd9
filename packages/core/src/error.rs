//! Error types shared by the queue and its callers.

use thiserror::Error;

use crate::JobStatus;

/// Errors surfaced by queue operations to producers and operators.
///
/// Handler failures never appear here: they are absorbed by the retry state
/// machine and only become visible as `failed` jobs in the diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The durable store could not be reached. The queue does not retry.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),
    /// A non-forced purge found jobs in progress and left the queue untouched.
    #[error("Purge refused: {active} job(s) are active")]
    PurgeConflict { active: u64 },
    /// Enqueue options failed validation.
    #[error("Invalid job options: {0}")]
    InvalidOptions(String),
    /// Any other store or query failure.
    #[error("Store error: {0}")]
    Store(String),
}

impl QueueError {
    /// Whether the caller may reasonably retry the operation later.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::BrokerUnavailable(_))
    }
}

/// A state machine transition that the job's current state does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot {action} a job in status {from}")]
    InvalidState {
        action: &'static str,
        from: JobStatus,
    },
    #[error("job is not eligible to run until {0}")]
    NotDue(chrono::DateTime<chrono::Utc>),
    #[error("job has exhausted all {0} attempts")]
    AttemptsExhausted(u32),
}
