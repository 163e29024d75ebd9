//! Worker pool for the job queue.
//!
//! A [`WorkerPool`] runs a fixed number of execution slots against one queue.
//! Each slot is a [`WorkerActor`] that claims a job, runs the queue's single
//! [`JobHandler`] and reports the outcome back to the store. The slots are
//! supervised by a [`PoolActor`], which also recovers jobs whose lock expired.
//!
//! # Usage
//!
//! ```ignore
//! use actors::{FnHandler, HandlerFuture, WorkerPool};
//!
//! let handler = FnHandler::new(|job| -> HandlerFuture {
//!     let name = job.name.clone();
//!     Box::pin(async move {
//!         tracing::info!("handling {}", name);
//!         Ok(())
//!     })
//! });
//!
//! let mut pool = WorkerPool::new(queue, handler, WorkerOptions::default());
//! let mut events = pool.subscribe();
//! pool.start().await?;
//! // ...
//! pool.stop().await?;
//! ```

mod handler;
mod messages;
mod pool;
mod worker_actor;

pub use handler::{FnHandler, HandlerError, HandlerFuture, HandlerResult, JobHandler};
pub use messages::{PoolError, PoolMessage, WorkerMessage};
pub use pool::{PoolActor, PoolArgs, WorkerPool};
pub use worker_actor::{WorkerActor, WorkerArgs};
