//! Queue configuration and introspection types.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobStatus, QueueError};

/// Options fixed on a job at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Total claims allowed, including the first.
    pub max_attempts: u32,
    /// Multiplier for the exponential retry delay.
    pub backoff_base_ms: u64,
    /// Delete the record on success instead of retaining it.
    pub remove_on_complete: bool,
    /// Initial delay before the job becomes claimable.
    pub delay_ms: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1000,
            remove_on_complete: true,
            delay_ms: 0,
        }
    }
}

impl JobOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff_base_ms(mut self, backoff_base_ms: u64) -> Self {
        self.backoff_base_ms = backoff_base_ms;
        self
    }

    pub fn with_remove_on_complete(mut self, remove_on_complete: bool) -> Self {
        self.remove_on_complete = remove_on_complete;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Reject options the state machine cannot honour.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_attempts == 0 {
            return Err(QueueError::InvalidOptions(
                "max_attempts must be at least 1".into(),
            ));
        }
        // Stored as a signed integer.
        if i64::try_from(self.backoff_base_ms).is_err() || i64::try_from(self.delay_ms).is_err() {
            return Err(QueueError::InvalidOptions(
                "backoff_base_ms and delay_ms must fit in a signed 64-bit integer".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for a worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Number of execution slots.
    pub concurrency: usize,
    /// How long an idle slot sleeps before polling again.
    pub poll_interval_ms: u64,
    /// How long a claim stays valid without renewal.
    pub lock_duration_ms: u64,
    /// How often the pool looks for jobs whose lock expired.
    pub stalled_interval_ms: u64,
    /// Completed jobs kept when `remove_on_complete` is off. `None` keeps all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_completed: Option<usize>,
    /// Failed jobs kept for diagnostics. `None` keeps all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_failed: Option<usize>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval_ms: 100,
            lock_duration_ms: 30_000,
            stalled_interval_ms: 30_000,
            keep_completed: Some(100),
            keep_failed: Some(100),
        }
    }
}

impl WorkerOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn with_lock_duration_ms(mut self, lock_duration_ms: u64) -> Self {
        self.lock_duration_ms = lock_duration_ms;
        self
    }

    pub fn with_stalled_interval_ms(mut self, stalled_interval_ms: u64) -> Self {
        self.stalled_interval_ms = stalled_interval_ms;
        self
    }

    pub fn with_keep_completed(mut self, keep: Option<usize>) -> Self {
        self.keep_completed = keep;
        self
    }

    pub fn with_keep_failed(mut self, keep: Option<usize>) -> Self {
        self.keep_failed = keep;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }

    /// Renew held locks at half their lifetime.
    pub fn lock_renew_interval(&self) -> Duration {
        Duration::from_millis((self.lock_duration_ms / 2).max(1))
    }

    pub fn stalled_interval(&self) -> Duration {
        Duration::from_millis(self.stalled_interval_ms)
    }
}

/// Snapshot of job counts per status.
///
/// Not transactional across statuses: concurrent workers may move jobs
/// between the individual counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobCounts(BTreeMap<JobStatus, u64>);

impl JobCounts {
    /// Counts for `statuses`, every one of them starting at zero.
    pub fn zeroed(statuses: &[JobStatus]) -> Self {
        Self(statuses.iter().map(|s| (*s, 0)).collect())
    }

    pub fn set(&mut self, status: JobStatus, count: u64) {
        self.0.insert(status, count);
    }

    /// Count for `status`, zero when it was not requested.
    pub fn get(&self, status: JobStatus) -> u64 {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn contains(&self, status: JobStatus) -> bool {
        self.0.contains_key(&status)
    }

    /// Sum over every counted status.
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobStatus, u64)> + '_ {
        self.0.iter().map(|(s, c)| (*s, *c))
    }
}

impl std::fmt::Display for JobCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (status, count) in self.iter() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", status, count)?;
            first = false;
        }
        Ok(())
    }
}

/// Result of a worker reporting an attempt back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The job reached `completed`; `removed` when the record was deleted.
    Completed { removed: bool },
    /// The attempt failed and the job is waiting for its next attempt.
    Retrying {
        attempts: u32,
        delay: Duration,
        retry_at: DateTime<Utc>,
    },
    /// The attempt failed and no attempts remain.
    Failed { attempts: u32 },
    /// The job no longer belongs to the reporter (purged or recovered elsewhere).
    Missing,
}
