//! Email payloads, the delivery seam and the job handler that drives it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use actors::{HandlerError, HandlerFuture, JobHandler};
use chrono::{DateTime, Utc};
use queue_core::{Job, Payload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::task::TaskRecord;
use crate::templates::template_for;

/// Job name used for email notifications.
pub const EMAIL_JOB: &str = "email-notification";

/// Payload of an `email-notification` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub task_id: i64,
    pub timestamp: DateTime<Utc>,
}

impl EmailMessage {
    /// Build the notification for `task`, addressed to its owner.
    pub fn for_task(task: &TaskRecord, owner_email: &str, now: DateTime<Utc>) -> Self {
        let template = template_for(task.status);
        Self {
            to: owner_email.to_string(),
            subject: template.subject.to_string(),
            body: template.render_body(&task.title),
            task_id: task.id,
            timestamp: now,
        }
    }

    pub fn to_payload(&self) -> Result<Payload, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(serde::ser::Error::custom(format!(
                "email message serialized to {} instead of an object",
                other
            ))),
        }
    }

    pub fn from_payload(payload: &Payload) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(payload.clone()))
    }
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Something that can deliver an email.
pub trait EmailSender: Send + Sync + 'static {
    fn send(&self, message: &EmailMessage) -> impl Future<Output = Result<(), MailError>> + Send;
}

/// Sender that simulates network latency and writes the message to the log.
#[derive(Debug, Clone)]
pub struct LogMailer {
    delay: Duration,
}

impl LogMailer {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(500),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Default for LogMailer {
    fn default() -> Self {
        Self::new()
    }
}

impl EmailSender for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        tokio::time::sleep(self.delay).await;
        tracing::info!(
            to = %message.to,
            task_id = message.task_id,
            subject = %message.subject,
            "Sending email: {}",
            message.body
        );
        Ok(())
    }
}

/// Job handler for `email-notification` jobs.
pub struct EmailJobHandler<S> {
    sender: Arc<S>,
}

impl<S: EmailSender> EmailJobHandler<S> {
    pub fn new(sender: S) -> Self {
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }
}

impl<S: EmailSender> JobHandler for EmailJobHandler<S> {
    fn handle(&self, job: &Job) -> HandlerFuture {
        let decoded = EmailMessage::from_payload(&job.payload);
        let sender = self.sender.clone();
        let job_id = job.id;

        Box::pin(async move {
            let message = decoded
                .map_err(|e| HandlerError::new(format!("Invalid email payload: {}", e)))?;
            tracing::debug!(%job_id, to = %message.to, "Delivering email");
            sender
                .send(&message)
                .await
                .map_err(|e| HandlerError::new(e.to_string()))
        })
    }
}
