//! Pool actor and the `WorkerPool` handle that owns it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use db::Queue;
use queue_core::{JobEvent, WorkerOptions};
use ractor::{Actor, ActorCell, ActorId, ActorProcessingErr, ActorRef, SupervisionEvent};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::handler::JobHandler;
use crate::messages::{PoolError, PoolMessage, WorkerMessage};
use crate::worker_actor::{WorkerActor, WorkerArgs};

/// Capacity of the lifecycle event channel.
const EVENT_CAPACITY: usize = 1024;

struct Slot {
    worker_id: String,
    actor: ActorRef<WorkerMessage>,
    handle: JoinHandle<()>,
}

/// State for the pool actor.
pub struct PoolState {
    queue: Queue,
    handler: Arc<dyn JobHandler>,
    options: WorkerOptions,
    event_tx: broadcast::Sender<JobEvent>,
    stopping: Arc<AtomicBool>,
    slots: HashMap<ActorId, Slot>,
    tick_task: Option<JoinHandle<()>>,
    /// Worker counter for unique IDs.
    worker_counter: u64,
}

impl PoolState {
    /// Generate a unique worker ID.
    fn next_worker_id(&mut self) -> String {
        self.worker_counter += 1;
        format!("{}-worker-{}", self.queue.name(), self.worker_counter)
    }
}

async fn spawn_slot(
    myself: &ActorRef<PoolMessage>,
    state: &mut PoolState,
    worker_id: String,
) -> Result<(), ActorProcessingErr> {
    let args = WorkerArgs {
        worker_id: worker_id.clone(),
        queue: state.queue.clone(),
        handler: state.handler.clone(),
        options: state.options.clone(),
        event_tx: state.event_tx.clone(),
        stopping: state.stopping.clone(),
    };

    let (actor, handle) = Actor::spawn_linked(None, WorkerActor, args, myself.get_cell())
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn worker: {}", e)))?;

    state.slots.insert(
        actor.get_id(),
        Slot {
            worker_id,
            actor,
            handle,
        },
    );
    Ok(())
}

/// Pool actor arguments.
pub struct PoolArgs {
    pub queue: Queue,
    pub handler: Arc<dyn JobHandler>,
    pub options: WorkerOptions,
    pub event_tx: broadcast::Sender<JobEvent>,
}

/// Pool actor: supervises the worker slots and runs stalled-job recovery.
pub struct PoolActor;

impl Actor for PoolActor {
    type Msg = PoolMessage;
    type State = PoolState;
    type Arguments = PoolArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Starting worker pool on '{}' with concurrency {}",
            args.queue.name(),
            args.options.concurrency
        );

        let mut state = PoolState {
            queue: args.queue,
            handler: args.handler,
            options: args.options,
            event_tx: args.event_tx,
            stopping: Arc::new(AtomicBool::new(false)),
            slots: HashMap::new(),
            tick_task: None,
            worker_counter: 0,
        };

        for _ in 0..state.options.concurrency {
            let worker_id = state.next_worker_id();
            spawn_slot(&myself, &mut state, worker_id).await?;
        }

        // Start periodic stalled-job check
        let myself_clone = myself.clone();
        let period = state.options.stalled_interval();
        state.tick_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if myself_clone.send_message(PoolMessage::Tick).is_err() {
                    break;
                }
            }
        }));

        let _ = state.event_tx.send(JobEvent::WorkerReady {
            queue: state.queue.name().to_string(),
            concurrency: state.options.concurrency,
            timestamp: Utc::now(),
        });

        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            PoolMessage::Tick => {
                if state.stopping.load(Ordering::Acquire) {
                    return Ok(());
                }
                match state.queue.recover_stalled(state.options.keep_failed).await {
                    Ok(recovered) => {
                        for (job, outcome) in recovered {
                            tracing::warn!(
                                job_id = %job.id,
                                attempts = job.attempts,
                                "Recovered stalled job (will retry: {})",
                                outcome.will_retry()
                            );
                            let _ = state.event_tx.send(JobEvent::JobStalled {
                                job_id: job.id,
                                queue: job.queue.clone(),
                                will_retry: outcome.will_retry(),
                                timestamp: Utc::now(),
                            });
                        }
                    }
                    Err(e) => tracing::warn!("Stalled job check failed: {}", e),
                }
            }

            PoolMessage::Stop { reply } => {
                tracing::info!("Stopping worker pool on '{}'", state.queue.name());
                state.stopping.store(true, Ordering::Release);
                if let Some(task) = state.tick_task.take() {
                    task.abort();
                }

                // Each slot finishes its current job before it handles the stop.
                for (_, slot) in state.slots.drain() {
                    slot.actor.stop(None);
                    if let Err(e) = slot.handle.await {
                        tracing::warn!("Worker {} did not shut down cleanly: {}", slot.worker_id, e);
                    }
                }

                let _ = state.event_tx.send(JobEvent::WorkerStopped {
                    queue: state.queue.name().to_string(),
                    timestamp: Utc::now(),
                });
                let _ = reply.send(());
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let (cell, reason): (ActorCell, String) = match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                (cell, reason.unwrap_or_else(|| "no reason".to_string()))
            }
            SupervisionEvent::ActorFailed(cell, err) => (cell, err.to_string()),
            _ => return Ok(()),
        };

        if state.stopping.load(Ordering::Acquire) {
            return Ok(());
        }

        // Replace the slot under the same worker id.
        if let Some(slot) = state.slots.remove(&cell.get_id()) {
            tracing::warn!("Worker {} exited ({}), restarting", slot.worker_id, reason);
            spawn_slot(&myself, state, slot.worker_id).await?;
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(task) = state.tick_task.take() {
            task.abort();
        }
        Ok(())
    }
}

/// A pool of execution slots consuming one queue with one handler.
///
/// Independent of any producer: it shares nothing with them but the store.
/// Subscribe before `start` to see the `WorkerReady` event.
pub struct WorkerPool {
    queue: Queue,
    handler: Arc<dyn JobHandler>,
    options: WorkerOptions,
    event_tx: broadcast::Sender<JobEvent>,
    running: Option<(ActorRef<PoolMessage>, JoinHandle<()>)>,
}

impl WorkerPool {
    pub fn new(queue: Queue, handler: impl JobHandler, options: WorkerOptions) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            queue,
            handler: Arc::new(handler),
            options,
            event_tx,
            running: None,
        }
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Spawn the slots and start claiming.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.running.is_some() {
            return Err(PoolError::AlreadyRunning);
        }
        if self.options.concurrency == 0 {
            return Err(PoolError::InvalidConcurrency);
        }

        let args = PoolArgs {
            queue: self.queue.clone(),
            handler: self.handler.clone(),
            options: self.options.clone(),
            event_tx: self.event_tx.clone(),
        };
        let running = Actor::spawn(None, PoolActor, args)
            .await
            .map_err(|e| PoolError::Spawn(e.to_string()))?;
        self.running = Some(running);
        Ok(())
    }

    /// Stop claiming and wait for in-flight jobs to finish.
    ///
    /// Running handlers are never cancelled.
    pub async fn stop(&mut self) -> Result<(), PoolError> {
        let (actor, handle) = self.running.take().ok_or(PoolError::NotRunning)?;

        let result = ractor::rpc::call(&actor, |reply| PoolMessage::Stop { reply }, None)
            .await
            .map_err(|e| PoolError::Actor(e.to_string()))?;
        if !matches!(result, ractor::rpc::CallResult::Success(())) {
            return Err(PoolError::Actor("pool did not acknowledge stop".into()));
        }

        handle.await.map_err(|e| PoolError::Actor(e.to_string()))
    }
}
