//! Job repository: every job mutation as a conditional statement against the store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use queue_core::{FailureOutcome, Job, JobCounts, JobId, JobLock, JobStatus, ReportOutcome};
use serde::Deserialize;
use surrealdb::Response;

use crate::{Broker, DbError};

/// Candidates fetched per claim round.
const CLAIM_BATCH: i64 = 10;
/// Rounds of candidates tried before a slot reports nothing to claim.
const CLAIM_ROUNDS: usize = 3;
/// Attempts for a report that keeps hitting transaction conflicts.
const CONFLICT_RETRIES: u32 = 5;
/// Marker thrown by the guarded purge transaction.
const PURGE_REFUSED: &str = "purge refused: active jobs present";

/// Error detail recorded on jobs recovered from an expired lock.
pub const STALLED_ERROR: &str = "job stalled: lock expired";

const CLAIM_CANDIDATES: &str = r#"
    SELECT * OMIT id FROM job
    WHERE queue = $queue
        AND status = "waiting"
        AND next_run_at <= $now
        AND attempts < max_attempts
    ORDER BY next_run_at ASC, job_id ASC
    LIMIT $limit
"#;

/// Claim wins iff nobody moved the job since it was read as a candidate.
const CLAIM_SWAP: &str = r#"
    UPDATE type::thing("job", $job_id) CONTENT $job
    WHERE status = "waiting" AND attempts = $attempts
    RETURN AFTER
"#;

/// Report wins iff the reporter still holds the lock.
const ACTIVE_SWAP: &str = r#"
    UPDATE type::thing("job", $job_id) CONTENT $job
    WHERE status = "active" AND lock.token = $token
    RETURN AFTER
"#;

const ACTIVE_DELETE: &str = r#"
    DELETE type::thing("job", $job_id)
    WHERE status = "active" AND lock.token = $token
    RETURN BEFORE
"#;

/// An expired lock is never revived; stalled recovery owns the job from then on.
const EXTEND_LOCK: &str = r#"
    UPDATE type::thing("job", $job_id) SET lock.expires_at = $expires_at
    WHERE status = "active" AND lock.token = $token AND lock.expires_at >= $now
    RETURN AFTER
"#;

/// Recovery wins iff the lock is still the one read and is still expired.
const RECOVER_SWAP: &str = r#"
    UPDATE type::thing("job", $job_id) CONTENT $job
    WHERE status = "active"
        AND lock.token = $token
        AND (lock = NONE OR lock.expires_at < $now)
    RETURN AFTER
"#;

const STALLED: &str = r#"
    SELECT * OMIT id FROM job
    WHERE queue = $queue
        AND status = "active"
        AND (lock = NONE OR lock.expires_at < $now)
    ORDER BY job_id ASC
"#;

/// Keep the newest `$keep` jobs of one terminal status, delete the rest.
const PRUNE: &str = r#"
    LET $stale = (
        SELECT job_id, finished_at FROM job
        WHERE queue = $queue AND status = $status
        ORDER BY finished_at DESC, job_id DESC
        START $keep
    ).job_id;
    DELETE job WHERE queue = $queue AND status = $status AND job_id INSIDE $stale RETURN BEFORE;
"#;

const COUNTS: &str = r#"
    SELECT status, count() AS count FROM job
    WHERE queue = $queue AND status INSIDE $statuses
    GROUP BY status
"#;

const LIST: &str = r#"
    SELECT * OMIT id FROM job
    WHERE queue = $queue AND status INSIDE $statuses
    ORDER BY job_id ASC
    LIMIT $limit START $offset
"#;

const GUARDED_PURGE: &str = r#"
    BEGIN TRANSACTION;
    LET $active = array::len((SELECT VALUE job_id FROM job WHERE queue = $queue AND status = "active"));
    IF $active > 0 { THROW "purge refused: active jobs present"; };
    DELETE job WHERE queue = $queue;
    COMMIT TRANSACTION;
"#;

#[derive(Debug, Deserialize)]
struct StatusCount {
    status: JobStatus,
    count: i64,
}

/// Repository for the jobs of one named queue.
#[derive(Debug, Clone)]
pub struct JobRepository {
    broker: Broker,
    queue: String,
}

impl JobRepository {
    pub fn new(broker: Broker, queue: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Persist a new job. Returns once the record is written.
    pub async fn create(&self, job: &Job) -> Result<(), DbError> {
        let db = self.broker.client();
        let result = db
            .query(r#"CREATE type::thing("job", $job_id) CONTENT $job RETURN NONE"#)
            .bind(("job_id", job.id.to_string()))
            .bind(("job", job.clone()))
            .await;
        self.settle(result)?;
        Ok(())
    }

    /// Get a job by ID.
    pub async fn get(&self, id: JobId) -> Result<Option<Job>, DbError> {
        let db = self.broker.client();
        let result = db
            .query(r#"SELECT * OMIT id FROM type::thing("job", $job_id) WHERE queue = $queue"#)
            .bind(("job_id", id.to_string()))
            .bind(("queue", self.queue.clone()))
            .await;
        let jobs: Vec<Job> = self.settle(result)?.take(0)?;
        Ok(jobs.into_iter().next())
    }

    /// Atomically move one due `waiting` job to `active` for `worker_id`.
    ///
    /// Losing a race to another claimant moves on to the next candidate; it
    /// never surfaces as an error.
    pub async fn claim(
        &self,
        worker_id: &str,
        lock_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DbError> {
        for _ in 0..CLAIM_ROUNDS {
            let Some(candidates) = lost_race(self.claim_candidates(now).await)? else {
                tracing::debug!(worker_id, "Candidate read conflicted, retrying");
                continue;
            };
            if candidates.is_empty() {
                return Ok(None);
            }

            for mut job in candidates {
                let seen_attempts = job.attempts;
                let lock = JobLock::new(worker_id, now, lock_duration);
                if job.claim(lock, now).is_err() {
                    continue;
                }

                let swapped = self
                    .swap(CLAIM_SWAP, &job, SwapGuard::Attempts(seen_attempts))
                    .await;
                if lost_race(swapped)? == Some(true) {
                    return Ok(Some(job));
                }
                tracing::debug!(job_id = %job.id, worker_id, "Lost claim race");
            }
        }
        Ok(None)
    }

    /// Report a successful attempt of `job`, as returned by `claim`.
    pub async fn complete(
        &self,
        job: &Job,
        keep_completed: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome, DbError> {
        let Some(token) = job.lock_token() else {
            return Ok(ReportOutcome::Missing);
        };

        if job.remove_on_complete {
            let removed = self
                .with_conflict_retry(|| self.delete_active(job, token))
                .await?;
            return Ok(if removed {
                ReportOutcome::Completed { removed: true }
            } else {
                ReportOutcome::Missing
            });
        }

        let mut next = job.clone();
        next.complete(now)?;
        let guard = SwapGuard::Token(Some(token.to_string()));
        if !self
            .with_conflict_retry(|| self.swap(ACTIVE_SWAP, &next, guard.clone()))
            .await?
        {
            return Ok(ReportOutcome::Missing);
        }

        self.prune(JobStatus::Completed, keep_completed).await?;
        Ok(ReportOutcome::Completed { removed: false })
    }

    /// Report a failed attempt of `job`, as returned by `claim`.
    pub async fn fail(
        &self,
        job: &Job,
        error: &str,
        keep_failed: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome, DbError> {
        let Some(token) = job.lock_token() else {
            return Ok(ReportOutcome::Missing);
        };

        let mut next = job.clone();
        let outcome = next.fail(error, now)?;
        let guard = SwapGuard::Token(Some(token.to_string()));
        if !self
            .with_conflict_retry(|| self.swap(ACTIVE_SWAP, &next, guard.clone()))
            .await?
        {
            return Ok(ReportOutcome::Missing);
        }

        match outcome {
            FailureOutcome::Retry { delay, retry_at } => Ok(ReportOutcome::Retrying {
                attempts: next.attempts,
                delay,
                retry_at,
            }),
            FailureOutcome::Exhausted => {
                self.prune(JobStatus::Failed, keep_failed).await?;
                Ok(ReportOutcome::Failed {
                    attempts: next.attempts,
                })
            }
        }
    }

    /// Push the lock of an in-flight job forward. `false` when the lock was lost.
    pub async fn extend_lock(
        &self,
        job: &Job,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let Some(token) = job.lock_token() else {
            return Ok(false);
        };
        let mut next = job.clone();
        next.renew_lock(token, now, duration)?;
        let expires_at = next
            .lock
            .as_ref()
            .map(|l| l.expires_at.timestamp_millis())
            .unwrap_or_default();

        let db = self.broker.client();
        let result = db
            .query(EXTEND_LOCK)
            .bind(("job_id", job.id.to_string()))
            .bind(("token", token.to_string()))
            .bind(("expires_at", expires_at))
            .bind(("now", now.timestamp_millis()))
            .await;
        let updated: Vec<Job> = self.settle(result)?.take(0)?;
        Ok(!updated.is_empty())
    }

    /// Fail every active job whose lock expired, so its attempt counts and
    /// backoff applies. Returns the recovered jobs with what became of them.
    pub async fn recover_stalled(
        &self,
        keep_failed: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Job, FailureOutcome)>, DbError> {
        let db = self.broker.client();
        let result = db
            .query(STALLED)
            .bind(("queue", self.queue.clone()))
            .bind(("now", now.timestamp_millis()))
            .await;
        let stalled: Vec<Job> = self.settle(result)?.take(0)?;

        let mut results = Vec::with_capacity(stalled.len());
        for job in &stalled {
            results.push(self.recover_one(job, now).await);
        }

        let (recovered, error) = gather_recoveries(results);
        if recovered.iter().any(|(_, outcome)| !outcome.will_retry()) {
            if let Err(e) = self.prune(JobStatus::Failed, keep_failed).await {
                tracing::warn!(queue = %self.queue, "Failed to prune after stalled recovery: {}", e);
            }
        }

        match error {
            Some(e) if recovered.is_empty() => Err(e),
            Some(e) => {
                tracing::warn!(
                    queue = %self.queue,
                    recovered = recovered.len(),
                    "Stalled recovery incomplete: {}",
                    e
                );
                Ok(recovered)
            }
            None => Ok(recovered),
        }
    }

    /// Fail one stalled job. `None` when its slot renewed or reported first.
    async fn recover_one(
        &self,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<Option<(Job, FailureOutcome)>, DbError> {
        let mut next = job.clone();
        let outcome = next.fail(STALLED_ERROR, now)?;
        let guard = SwapGuard::Expired {
            token: job.lock_token().map(str::to_string),
            now: now.timestamp_millis(),
        };
        let swapped = self.swap(RECOVER_SWAP, &next, guard).await;
        Ok(match lost_race(swapped)? {
            Some(true) => Some((next, outcome)),
            _ => None,
        })
    }

    /// Counts for `statuses`, each present and zero when empty.
    pub async fn counts(&self, statuses: &[JobStatus]) -> Result<JobCounts, DbError> {
        let db = self.broker.client();
        let result = db
            .query(COUNTS)
            .bind(("queue", self.queue.clone()))
            .bind(("statuses", statuses.to_vec()))
            .await;
        let rows: Vec<StatusCount> = self.settle(result)?.take(0)?;

        let mut counts = JobCounts::zeroed(statuses);
        for row in rows {
            counts.set(row.status, u64::try_from(row.count).unwrap_or_default());
        }
        Ok(counts)
    }

    /// Jobs in `statuses`, in enqueue order.
    pub async fn list(
        &self,
        statuses: &[JobStatus],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>, DbError> {
        let db = self.broker.client();
        let result = db
            .query(LIST)
            .bind(("queue", self.queue.clone()))
            .bind(("statuses", statuses.to_vec()))
            .bind(("limit", i64::try_from(limit).unwrap_or(i64::MAX)))
            .bind(("offset", i64::try_from(offset).unwrap_or(i64::MAX)))
            .await;
        Ok(self.settle(result)?.take(0)?)
    }

    /// Delete every job of the queue.
    ///
    /// Without `force` the check for active jobs and the delete run in one
    /// transaction, so a claim cannot slip in between.
    pub async fn purge(&self, force: bool) -> Result<(), DbError> {
        let db = self.broker.client();

        if force {
            let result = db
                .query("DELETE job WHERE queue = $queue")
                .bind(("queue", self.queue.clone()))
                .await;
            self.settle(result)?;
            return Ok(());
        }

        let result = db
            .query(GUARDED_PURGE)
            .bind(("queue", self.queue.clone()))
            .await
            .map_err(DbError::from);
        let mut response = self.broker.observe(result)?;
        let errors = response.take_errors();
        if errors
            .values()
            .any(|e| e.to_string().contains(PURGE_REFUSED))
        {
            let active = self.counts(&[JobStatus::Active]).await?;
            return Err(DbError::PurgeRefused(active.get(JobStatus::Active).max(1)));
        }
        if let Some(err) = errors.into_values().next() {
            return Err(err.into());
        }
        Ok(())
    }

    /// Delete the oldest terminal jobs of `status` beyond `keep`.
    async fn prune(&self, status: JobStatus, keep: Option<usize>) -> Result<usize, DbError> {
        let Some(keep) = keep else {
            return Ok(0);
        };
        let db = self.broker.client();
        let result = db
            .query(PRUNE)
            .bind(("queue", self.queue.clone()))
            .bind(("status", status))
            .bind(("keep", i64::try_from(keep).unwrap_or(i64::MAX)))
            .await;
        let removed: Vec<Job> = self.settle(result)?.take(1)?;
        if !removed.is_empty() {
            tracing::debug!(queue = %self.queue, %status, removed = removed.len(), "Pruned retained jobs");
        }
        Ok(removed.len())
    }

    async fn claim_candidates(&self, now: DateTime<Utc>) -> Result<Vec<Job>, DbError> {
        let db = self.broker.client();
        let result = db
            .query(CLAIM_CANDIDATES)
            .bind(("queue", self.queue.clone()))
            .bind(("now", now.timestamp_millis()))
            .bind(("limit", CLAIM_BATCH))
            .await;
        Ok(self.settle(result)?.take(0)?)
    }

    /// Replace the stored job with `next` if `guard` still holds.
    async fn swap(&self, query: &str, next: &Job, guard: SwapGuard) -> Result<bool, DbError> {
        let db = self.broker.client();
        let mut request = db
            .query(query)
            .bind(("job_id", next.id.to_string()))
            .bind(("job", next.clone()));
        request = match guard {
            SwapGuard::Attempts(attempts) => request.bind(("attempts", attempts)),
            SwapGuard::Token(token) => request.bind(("token", token)),
            SwapGuard::Expired { token, now } => {
                request.bind(("token", token)).bind(("now", now))
            }
        };
        let updated: Vec<Job> = self.settle(request.await)?.take(0)?;
        Ok(!updated.is_empty())
    }

    async fn delete_active(&self, job: &Job, token: &str) -> Result<bool, DbError> {
        let db = self.broker.client();
        let result = db
            .query(ACTIVE_DELETE)
            .bind(("job_id", job.id.to_string()))
            .bind(("token", token.to_string()))
            .await;
        let deleted: Vec<Job> = self.settle(result)?.take(0)?;
        Ok(!deleted.is_empty())
    }

    /// Retry a guarded write that lost a transaction conflict. The guard makes
    /// a repeated write safe.
    async fn with_conflict_retry<T, F, Fut>(&self, mut op: F) -> Result<T, DbError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(DbError::Conflict(reason)) if attempt + 1 < CONFLICT_RETRIES => {
                    attempt += 1;
                    tracing::debug!(attempt, "Retrying after conflict: {}", reason);
                    tokio::time::sleep(Duration::from_millis(5 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }

    /// Map transport errors, note outages, and surface statement errors.
    fn settle(&self, result: surrealdb::Result<Response>) -> Result<Response, DbError> {
        let response = self.broker.observe(result.map_err(DbError::from))?;
        response.check().map_err(DbError::from)
    }
}

#[derive(Debug, Clone)]
enum SwapGuard {
    Attempts(u32),
    /// `None` matches a job that lost its lock record entirely.
    Token(Option<String>),
    /// Same lock, and it expired before `now`.
    Expired { token: Option<String>, now: i64 },
}

/// A transaction conflict means another writer got there first.
fn lost_race<T>(result: Result<T, DbError>) -> Result<Option<T>, DbError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(DbError::Conflict(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Keep every recovery that landed, along with the first error.
fn gather_recoveries(
    results: Vec<Result<Option<(Job, FailureOutcome)>, DbError>>,
) -> (Vec<(Job, FailureOutcome)>, Option<DbError>) {
    let mut recovered = Vec::new();
    let mut first_error = None;
    for result in results {
        match result {
            Ok(Some(entry)) => recovered.push(entry),
            Ok(None) => {}
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    (recovered, first_error)
}
