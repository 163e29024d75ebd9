use chrono::Utc;
use db::Queue;
use queue_core::{JobId, JobOptions, QueueError};
use thiserror::Error;

use crate::email::{EMAIL_JOB, EmailMessage};
use crate::task::TaskRecord;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Failed to encode email payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Enqueues an email job whenever a task changes state.
///
/// Enqueue failures are returned to the caller as-is; the producer never
/// retries on its own.
#[derive(Clone)]
pub struct NotificationProducer {
    queue: Queue,
    options: JobOptions,
}

impl NotificationProducer {
    pub fn new(queue: Queue) -> Self {
        Self {
            queue,
            options: JobOptions::default()
                .with_max_attempts(3)
                .with_backoff_base_ms(1000)
                .with_remove_on_complete(true),
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    /// Queue the notification for `task` to `owner_email`.
    pub async fn notify(&self, task: &TaskRecord, owner_email: &str) -> Result<JobId, NotificationError> {
        let message = EmailMessage::for_task(task, owner_email, Utc::now());
        let payload = message.to_payload()?;

        let id = self.queue.enqueue(EMAIL_JOB, payload, &self.options).await?;
        tracing::info!(
            job_id = %id,
            task_id = task.id,
            "Email queued for {} regarding task \"{}\"",
            owner_email,
            task.title
        );
        Ok(id)
    }
}
