//! The named durable queue: producer, operator, and worker operations.

use std::time::Duration;

use chrono::Utc;
use queue_core::{
    FailureOutcome, Job, JobCounts, JobId, JobOptions, JobStatus, Payload, QueueError,
    ReportOutcome,
};

use crate::repositories::JobRepository;
use crate::{Broker, DbError};

impl From<DbError> for QueueError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Unavailable(reason) => QueueError::BrokerUnavailable(reason),
            DbError::PurgeRefused(active) => QueueError::PurgeConflict { active },
            other => QueueError::Store(other.to_string()),
        }
    }
}

/// A named queue backed by the store behind a [`Broker`].
///
/// The store is the single authority on job state: every method reads or
/// writes it directly, nothing is cached here.
#[derive(Debug, Clone)]
pub struct Queue {
    jobs: JobRepository,
}

impl Queue {
    pub fn new(broker: Broker, name: impl Into<String>) -> Self {
        Self {
            jobs: JobRepository::new(broker, name),
        }
    }

    pub fn name(&self) -> &str {
        self.jobs.queue()
    }

    pub fn broker(&self) -> &Broker {
        self.jobs.broker()
    }

    /// Persist a new `waiting` job and return its id.
    ///
    /// Does not wait for a worker. A store outage fails with
    /// `BrokerUnavailable` and is not retried here.
    pub async fn enqueue(
        &self,
        name: impl Into<String>,
        payload: Payload,
        options: &JobOptions,
    ) -> Result<JobId, QueueError> {
        options.validate()?;
        let job = Job::new(self.name(), name, payload, options, Utc::now());
        self.jobs.create(&job).await?;
        tracing::debug!(queue = %self.name(), job_id = %job.id, name = %job.name, "Job enqueued");
        Ok(job.id)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.jobs.get(id).await?)
    }

    /// Snapshot counts for `statuses`, or for every status when empty.
    pub async fn get_counts(&self, statuses: &[JobStatus]) -> Result<JobCounts, QueueError> {
        let statuses = if statuses.is_empty() {
            &JobStatus::ALL[..]
        } else {
            statuses
        };
        Ok(self.jobs.counts(statuses).await?)
    }

    /// Up to `limit` jobs in `statuses`, in enqueue order. Read-only.
    pub async fn list_jobs(
        &self,
        statuses: &[JobStatus],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        if statuses.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        Ok(self.jobs.list(statuses, offset, limit).await?)
    }

    /// Delete every job of this queue.
    ///
    /// Without `force` the purge is refused with `PurgeConflict` while any
    /// job is active. With `force`, workers still running a purged job find
    /// it gone when they report and treat that as a no-op.
    pub async fn purge(&self, force: bool) -> Result<(), QueueError> {
        self.jobs.purge(force).await?;
        tracing::info!(queue = %self.name(), force, "Queue purged");
        Ok(())
    }

    /// Claim the next due job for `worker_id`, if any.
    pub async fn claim(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<Job>, QueueError> {
        Ok(self.jobs.claim(worker_id, lock_duration, Utc::now()).await?)
    }

    /// Report success for a claimed job.
    pub async fn complete(
        &self,
        job: &Job,
        keep_completed: Option<usize>,
    ) -> Result<ReportOutcome, QueueError> {
        Ok(self.jobs.complete(job, keep_completed, Utc::now()).await?)
    }

    /// Report a failed attempt for a claimed job.
    pub async fn fail(
        &self,
        job: &Job,
        error: &str,
        keep_failed: Option<usize>,
    ) -> Result<ReportOutcome, QueueError> {
        Ok(self.jobs.fail(job, error, keep_failed, Utc::now()).await?)
    }

    /// Keep a claimed job's lock alive. `false` once the job is no longer ours.
    pub async fn extend_lock(&self, job: &Job, duration: Duration) -> Result<bool, QueueError> {
        Ok(self.jobs.extend_lock(job, duration, Utc::now()).await?)
    }

    /// Hand active jobs with expired locks back to the retry state machine.
    pub async fn recover_stalled(
        &self,
        keep_failed: Option<usize>,
    ) -> Result<Vec<(Job, FailureOutcome)>, QueueError> {
        Ok(self.jobs.recover_stalled(keep_failed, Utc::now()).await?)
    }
}
