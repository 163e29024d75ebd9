//! Worker actor: one execution slot of a pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use db::Queue;
use queue_core::{Job, JobEvent, ReportOutcome, WorkerOptions};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::handler::{JobHandler, run_handler};
use crate::messages::WorkerMessage;

/// Longest pause after repeated store errors.
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// State for the worker actor.
pub struct WorkerActorState {
    /// Unique worker ID, recorded in job locks.
    pub worker_id: String,
    queue: Queue,
    handler: Arc<dyn JobHandler>,
    options: WorkerOptions,
    event_tx: broadcast::Sender<JobEvent>,
    /// Set by the pool when it stops; no claims after that.
    stopping: Arc<AtomicBool>,
    /// Store errors in a row, for backoff.
    consecutive_errors: u32,
}

impl WorkerActorState {
    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    fn error_backoff(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.consecutive_errors.min(6));
        (self.options.poll_interval() * factor).min(MAX_ERROR_BACKOFF)
    }

    /// Run a claimed job to completion or failure and report the outcome.
    async fn process(&mut self, job: Job) {
        let started = Instant::now();
        tracing::info!(
            worker_id = %self.worker_id,
            job_id = %job.id,
            attempt = job.attempts,
            "Processing job {}",
            job.name
        );
        self.emit(JobEvent::JobStarted {
            job_id: job.id,
            queue: job.queue.clone(),
            name: job.name.clone(),
            worker_id: self.worker_id.clone(),
            attempt: job.attempts,
            timestamp: Utc::now(),
        });

        let renewal = spawn_lock_renewal(self.queue.clone(), job.clone(), &self.options);
        let result = run_handler(self.handler.as_ref(), &job).await;
        renewal.abort();

        match result {
            Ok(()) => self.report_success(&job, started).await,
            Err(err) => self.report_failure(&job, err.message()).await,
        }
    }

    async fn report_success(&self, job: &Job, started: Instant) {
        match self.queue.complete(job, self.options.keep_completed).await {
            Ok(ReportOutcome::Completed { removed }) => {
                let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                tracing::info!(job_id = %job.id, removed, "Job completed in {}ms", duration_ms);
                self.emit(JobEvent::JobCompleted {
                    job_id: job.id,
                    queue: job.queue.clone(),
                    worker_id: self.worker_id.clone(),
                    attempts: job.attempts,
                    duration_ms,
                    timestamp: Utc::now(),
                });
            }
            Ok(ReportOutcome::Missing) => {
                tracing::warn!(job_id = %job.id, "Job was removed or reassigned before completion was recorded");
            }
            Ok(other) => {
                tracing::warn!(job_id = %job.id, "Unexpected completion outcome: {:?}", other);
            }
            Err(e) => {
                // The lock expires and stalled recovery takes the job back.
                tracing::error!(job_id = %job.id, "Failed to record completion: {}", e);
            }
        }
    }

    async fn report_failure(&self, job: &Job, error: &str) {
        let (will_retry, retry_at, attempts) =
            match self.queue.fail(job, error, self.options.keep_failed).await {
                Ok(ReportOutcome::Retrying {
                    attempts,
                    delay,
                    retry_at,
                }) => {
                    tracing::warn!(
                        job_id = %job.id,
                        attempts,
                        "Job failed: {}; retrying in {:?}",
                        error,
                        delay
                    );
                    (true, Some(retry_at), attempts)
                }
                Ok(ReportOutcome::Failed { attempts }) => {
                    tracing::error!(
                        job_id = %job.id,
                        attempts,
                        "Job failed permanently: {}",
                        error
                    );
                    (false, None, attempts)
                }
                Ok(ReportOutcome::Missing) => {
                    tracing::warn!(job_id = %job.id, "Job was removed or reassigned before failure was recorded");
                    return;
                }
                Ok(other) => {
                    tracing::warn!(job_id = %job.id, "Unexpected failure outcome: {:?}", other);
                    return;
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, "Failed to record failure ({}): {}", error, e);
                    return;
                }
            };

        self.emit(JobEvent::JobFailed {
            job_id: job.id,
            queue: job.queue.clone(),
            worker_id: self.worker_id.clone(),
            error: error.to_string(),
            attempts,
            will_retry,
            retry_at,
            timestamp: Utc::now(),
        });
    }
}

/// Keep the lock of `job` alive until aborted.
fn spawn_lock_renewal(queue: Queue, job: Job, options: &WorkerOptions) -> JoinHandle<()> {
    let interval = options.lock_renew_interval();
    let duration = options.lock_duration();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match queue.extend_lock(&job, duration).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(job_id = %job.id, "Lost lock on running job");
                    break;
                }
                Err(e) => tracing::warn!(job_id = %job.id, "Failed to extend lock: {}", e),
            }
        }
    })
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub queue: Queue,
    pub handler: Arc<dyn JobHandler>,
    pub options: WorkerOptions,
    pub event_tx: broadcast::Sender<JobEvent>,
    pub stopping: Arc<AtomicBool>,
}

/// Worker actor that claims and executes jobs one at a time.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!("Starting worker: {}", args.worker_id);

        // Start the claim loop
        myself.send_message(WorkerMessage::Poll)?;

        Ok(WorkerActorState {
            worker_id: args.worker_id,
            queue: args.queue,
            handler: args.handler,
            options: args.options,
            event_tx: args.event_tx,
            stopping: args.stopping,
            consecutive_errors: 0,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Poll => {
                if state.stopping.load(Ordering::Acquire) {
                    return Ok(());
                }

                match state
                    .queue
                    .claim(&state.worker_id, state.options.lock_duration())
                    .await
                {
                    Ok(Some(job)) => {
                        state.consecutive_errors = 0;
                        state.process(job).await;
                        // Look for more work straight away.
                        myself.send_message(WorkerMessage::Poll)?;
                    }
                    Ok(None) => {
                        state.consecutive_errors = 0;
                        myself.send_after(state.options.poll_interval(), || WorkerMessage::Poll);
                    }
                    Err(e) => {
                        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
                        let backoff = state.error_backoff();
                        tracing::warn!(
                            worker_id = %state.worker_id,
                            "Claim failed: {}; polling again in {:?}",
                            e,
                            backoff
                        );
                        myself.send_after(backoff, || WorkerMessage::Poll);
                    }
                }
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::debug!("Worker stopped: {}", state.worker_id);
        Ok(())
    }
}
