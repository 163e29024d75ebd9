//! Core domain types for the notification job queue.
//!
//! This crate contains the shared types used across all packages:
//! - `Job`, `JobStatus` and the state machine that moves a job between states
//! - `JobOptions`, `WorkerOptions` and `JobCounts` for queue configuration and introspection
//! - `backoff_delay` for the exponential retry schedule
//! - `JobEvent` for worker lifecycle notifications
//! - `QueueError` for the errors producers and operators see

mod backoff;
mod error;
mod events;
mod job;
mod queue;

pub use backoff::backoff_delay;
pub use error::{QueueError, TransitionError};
pub use events::JobEvent;
pub use job::{FailureOutcome, Job, JobId, JobLock, JobStatus, Payload};
pub use queue::{JobCounts, JobOptions, ReportOutcome, WorkerOptions};
