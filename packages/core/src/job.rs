//! Job domain types and the job state machine.

use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::Duration;

use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use ulid::{Generator, Ulid};

use crate::{JobOptions, TransitionError, backoff_delay};

/// Structured job payload: a mapping from string keys to JSON values.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Process-wide generator so ids created in the same millisecond still sort
/// in creation order.
static ID_GENERATOR: LazyLock<Mutex<Generator>> = LazyLock::new(|| Mutex::new(Generator::new()));

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID, monotonic within this process.
    pub fn new() -> Self {
        let mut generator = ID_GENERATOR.lock().unwrap_or_else(PoisonError::into_inner);
        // The monotonic generator only fails when the random component of a
        // single millisecond overflows.
        Self(generator.generate().unwrap_or_else(|_| Ulid::new()))
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current status of a job in its lifecycle.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job is waiting to be claimed, possibly delayed until `next_run_at`.
    #[default]
    Waiting,
    /// Job is claimed by exactly one worker slot.
    Active,
    /// Job handler succeeded.
    Completed,
    /// Job exhausted its attempts.
    Failed,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Waiting,
        JobStatus::Active,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Get the stored name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ownership record written when a worker slot claims a job.
///
/// Every report back to the queue is conditional on the token, so a slot
/// that lost its job (purge, stalled recovery) cannot overwrite a newer state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLock {
    pub token: String,
    pub worker_id: String,
    #[serde(with = "ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

impl JobLock {
    /// Create a lock with a fresh token that expires `duration` after `now`.
    pub fn new(worker_id: impl Into<String>, now: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            token: Ulid::new().to_string(),
            worker_id: worker_id.into(),
            expires_at: advance(now, duration),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// What a failed attempt turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Rescheduled as `waiting` after a backoff delay.
    Retry {
        delay: Duration,
        retry_at: DateTime<Utc>,
    },
    /// Moved to terminal `failed`.
    Exhausted,
}

impl FailureOutcome {
    pub fn will_retry(&self) -> bool {
        matches!(self, FailureOutcome::Retry { .. })
    }
}

/// A job represents a unit of work held by the durable queue.
///
/// The payload and the enqueue options are fixed at creation; everything else
/// is queue-state metadata that only the state machine methods below mutate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    #[serde(rename = "job_id")]
    pub id: JobId,
    /// Name of the queue this job belongs to.
    pub queue: String,
    /// Job type tag, for logging and introspection.
    pub name: String,
    /// Job payload.
    pub payload: Payload,
    /// Current status.
    pub status: JobStatus,
    /// Number of claims so far.
    #[serde(default)]
    pub attempts: u32,
    /// Claims allowed before the job fails for good.
    pub max_attempts: u32,
    /// Multiplier for the exponential retry delay.
    pub backoff_base_ms: u64,
    /// Delete the record on success instead of retaining it.
    pub remove_on_complete: bool,
    /// The job must not be claimed before this instant.
    #[serde(with = "ts_milliseconds")]
    pub next_run_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// When the job was last claimed.
    #[serde(
        default,
        with = "ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub processed_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    #[serde(
        default,
        with = "ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub finished_at: Option<DateTime<Utc>>,
    /// Detail of the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Present while the job is `active`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<JobLock>,
}

impl Job {
    /// Create a new waiting job from already validated options.
    pub fn new(
        queue: impl Into<String>,
        name: impl Into<String>,
        payload: Payload,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            name: name.into(),
            payload,
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts: options.max_attempts,
            backoff_base_ms: options.backoff_base_ms,
            remove_on_complete: options.remove_on_complete,
            next_run_at: advance(now, options.delay()),
            created_at: now,
            processed_at: None,
            finished_at: None,
            error: None,
            lock: None,
        }
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting
            && self.next_run_at <= now
            && self.attempts < self.max_attempts
    }

    /// `waiting -> active`: take ownership and count the attempt.
    pub fn claim(&mut self, lock: JobLock, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != JobStatus::Waiting {
            return Err(TransitionError::InvalidState {
                action: "claim",
                from: self.status,
            });
        }
        if self.next_run_at > now {
            return Err(TransitionError::NotDue(self.next_run_at));
        }
        if self.attempts >= self.max_attempts {
            return Err(TransitionError::AttemptsExhausted(self.max_attempts));
        }

        self.status = JobStatus::Active;
        self.attempts += 1;
        self.processed_at = Some(now);
        self.lock = Some(lock);
        Ok(())
    }

    /// `active -> completed`.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_active("complete")?;
        self.status = JobStatus::Completed;
        self.finished_at = Some(now);
        self.lock = None;
        Ok(())
    }

    /// `active -> waiting` (delayed) while attempts remain, `active -> failed` otherwise.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, TransitionError> {
        self.ensure_active("fail")?;
        self.error = Some(error.into());
        self.lock = None;

        if self.attempts < self.max_attempts {
            let delay = backoff_delay(self.backoff_base_ms, self.attempts);
            let retry_at = advance(now, delay);
            self.status = JobStatus::Waiting;
            self.next_run_at = retry_at;
            Ok(FailureOutcome::Retry { delay, retry_at })
        } else {
            self.status = JobStatus::Failed;
            self.finished_at = Some(now);
            Ok(FailureOutcome::Exhausted)
        }
    }

    /// Push the lock expiry forward for the slot that holds `token`.
    pub fn renew_lock(
        &mut self,
        token: &str,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Result<(), TransitionError> {
        self.ensure_active("renew the lock of")?;
        match self.lock.as_mut() {
            Some(lock) if lock.token == token => {
                lock.expires_at = advance(now, duration);
                Ok(())
            }
            _ => Err(TransitionError::InvalidState {
                action: "renew a foreign lock of",
                from: self.status,
            }),
        }
    }

    /// An active job whose owner stopped renewing its lock.
    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active && self.lock.as_ref().is_none_or(|l| l.is_expired(now))
    }

    /// Token of the slot that currently owns the job.
    pub fn lock_token(&self) -> Option<&str> {
        self.lock.as_ref().map(|l| l.token.as_str())
    }

    fn ensure_active(&self, action: &'static str) -> Result<(), TransitionError> {
        if self.status == JobStatus::Active {
            Ok(())
        } else {
            Err(TransitionError::InvalidState {
                action,
                from: self.status,
            })
        }
    }
}

/// `now + duration`, clamped to the latest representable instant.
pub(crate) fn advance(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
