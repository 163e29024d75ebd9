//! Email notifications for task state changes.
//!
//! The producer side turns a task record into an `email-notification` job;
//! the consumer side is an [`actors::JobHandler`] that decodes the job and
//! hands it to an [`EmailSender`].

mod email;
mod producer;
mod task;
mod templates;

pub use email::{EMAIL_JOB, EmailJobHandler, EmailMessage, EmailSender, LogMailer, MailError};
pub use producer::{NotificationError, NotificationProducer};
pub use task::{TaskRecord, TaskStatus};
pub use templates::{Template, template_for};
