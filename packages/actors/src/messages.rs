//! Message types for actor communication.

use ractor::RpcReplyPort;

/// Messages for the PoolActor.
#[derive(Debug)]
pub enum PoolMessage {
    /// Periodic tick: recover jobs whose lock expired.
    Tick,

    /// Stop claiming, wait for in-flight jobs, then shut down.
    Stop { reply: RpcReplyPort<()> },
}

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Try to claim and run one job.
    Poll,
}

/// Error type for worker pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker pool is already running")]
    AlreadyRunning,

    #[error("Worker pool is not running")]
    NotRunning,

    #[error("Concurrency must be at least 1")]
    InvalidConcurrency,

    #[error("Failed to spawn actor: {0}")]
    Spawn(String),

    #[error("Actor error: {0}")]
    Actor(String),
}
