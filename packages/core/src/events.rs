//! Worker lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// Events emitted by a worker pool. These are a side channel for
/// observability; job state lives only in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    // Pool events
    /// All execution slots are running and polling.
    WorkerReady {
        queue: String,
        concurrency: usize,
        timestamp: DateTime<Utc>,
    },
    /// The pool stopped claiming and every in-flight job has finished.
    WorkerStopped {
        queue: String,
        timestamp: DateTime<Utc>,
    },

    // Job events
    /// A slot claimed a job and started its handler.
    JobStarted {
        job_id: JobId,
        queue: String,
        name: String,
        worker_id: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// A handler succeeded.
    JobCompleted {
        job_id: JobId,
        queue: String,
        worker_id: String,
        attempts: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A handler failed; `will_retry` tells whether another attempt is scheduled.
    JobFailed {
        job_id: JobId,
        queue: String,
        worker_id: String,
        error: String,
        attempts: u32,
        will_retry: bool,
        retry_at: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },
    /// An active job lost its lock and was handed back to the state machine.
    JobStalled {
        job_id: JobId,
        queue: String,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::WorkerReady { timestamp, .. }
            | JobEvent::WorkerStopped { timestamp, .. }
            | JobEvent::JobStarted { timestamp, .. }
            | JobEvent::JobCompleted { timestamp, .. }
            | JobEvent::JobFailed { timestamp, .. }
            | JobEvent::JobStalled { timestamp, .. } => *timestamp,
        }
    }

    /// Get the queue name associated with this event.
    pub fn queue(&self) -> &str {
        match self {
            JobEvent::WorkerReady { queue, .. }
            | JobEvent::WorkerStopped { queue, .. }
            | JobEvent::JobStarted { queue, .. }
            | JobEvent::JobCompleted { queue, .. }
            | JobEvent::JobFailed { queue, .. }
            | JobEvent::JobStalled { queue, .. } => queue,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::JobStarted { job_id, .. }
            | JobEvent::JobCompleted { job_id, .. }
            | JobEvent::JobFailed { job_id, .. }
            | JobEvent::JobStalled { job_id, .. } => Some(*job_id),
            JobEvent::WorkerReady { .. } | JobEvent::WorkerStopped { .. } => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::WorkerReady {
                queue, concurrency, ..
            } => format!("Worker ready on '{}' with {} slots", queue, concurrency),
            JobEvent::WorkerStopped { queue, .. } => format!("Worker on '{}' stopped", queue),
            JobEvent::JobStarted {
                job_id,
                name,
                worker_id,
                attempt,
                ..
            } => format!(
                "Job {} ({}) started by {} (attempt {})",
                job_id, name, worker_id, attempt
            ),
            JobEvent::JobCompleted {
                job_id,
                duration_ms,
                ..
            } => format!("Job {} completed in {}ms", job_id, duration_ms),
            JobEvent::JobFailed {
                job_id,
                error,
                attempts,
                will_retry,
                ..
            } => {
                let retry = if *will_retry { " (will retry)" } else { "" };
                format!(
                    "Job {} failed after {} attempt(s): {}{}",
                    job_id, attempts, error, retry
                )
            }
            JobEvent::JobStalled {
                job_id, will_retry, ..
            } => {
                let retry = if *will_retry { " (will retry)" } else { "" };
                format!("Job {} stalled{}", job_id, retry)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_event_tag() {
        let event = JobEvent::WorkerReady {
            queue: "email".into(),
            concurrency: 5,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "worker_ready");
        assert_eq!(event.job_id(), None);
        assert_eq!(event.queue(), "email");
    }

    #[test]
    fn failure_description_mentions_retry() {
        let event = JobEvent::JobFailed {
            job_id: JobId::new(),
            queue: "email".into(),
            worker_id: "worker-1".into(),
            error: "smtp down".into(),
            attempts: 1,
            will_retry: true,
            retry_at: None,
            timestamp: Utc::now(),
        };
        assert!(event.description().ends_with("smtp down (will retry)"));
        assert!(event.job_id().is_some());
    }
}
