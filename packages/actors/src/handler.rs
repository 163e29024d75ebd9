//! Job handler trait.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use futures_util::FutureExt;
use queue_core::Job;
use thiserror::Error;

/// A handler invocation that failed or panicked. Recovered by the retry
/// state machine; the message becomes the job's `error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }

    fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Self(format!("handler panicked: {}", detail))
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// Result type for job handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Future type for async job handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Trait for job handlers.
///
/// A queue has exactly one handler, supplied when the worker pool is built.
pub trait JobHandler: Send + Sync + 'static {
    /// Process a job. Errors and panics count as a failed attempt.
    fn handle(&self, job: &Job) -> HandlerFuture;
}

/// A simple function-based job handler.
pub struct FnHandler<F>
where
    F: Fn(&Job) -> HandlerFuture + Send + Sync + 'static,
{
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Job) -> HandlerFuture + Send + Sync + 'static,
{
    /// Create a new function-based handler.
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&Job) -> HandlerFuture + Send + Sync + 'static,
{
    fn handle(&self, job: &Job) -> HandlerFuture {
        (self.handler)(job)
    }
}

/// Run `handler` on `job`, turning a panic anywhere in it into a `HandlerError`.
pub(crate) async fn run_handler(handler: &dyn JobHandler, job: &Job) -> HandlerResult {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(job))) {
        Ok(future) => future,
        Err(panic) => return Err(HandlerError::from_panic(panic)),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::from_panic(panic)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use queue_core::{JobOptions, Payload};

    fn job() -> Job {
        Job::new("email", "email-notification", Payload::new(), &JobOptions::default(), Utc::now())
    }

    #[tokio::test]
    async fn passes_through_handler_errors() {
        let handler = FnHandler::new(|_job: &Job| -> HandlerFuture {
            Box::pin(async { Err(HandlerError::new("smtp down")) })
        });
        let err = run_handler(&handler, &job()).await.unwrap_err();
        assert_eq!(err.message(), "smtp down");
    }

    #[tokio::test]
    async fn converts_panics_into_failures() {
        let handler = FnHandler::new(|job: &Job| -> HandlerFuture {
            let missing = job.payload.get("template").is_none();
            Box::pin(async move {
                if missing {
                    panic!("template missing");
                }
                Ok(())
            })
        });
        let err = run_handler(&handler, &job()).await.unwrap_err();
        assert_eq!(err.message(), "handler panicked: template missing");
    }

    #[tokio::test]
    async fn converts_synchronous_panics_into_failures() {
        let handler = FnHandler::new(|job: &Job| -> HandlerFuture {
            panic!("bad payload for {}", job.name);
        });
        let err = run_handler(&handler, &job()).await.unwrap_err();
        assert_eq!(err.message(), "handler panicked: bad payload for email-notification");
    }
}
