use std::error::Error;
use std::sync::{Arc, Mutex};

use db::{DbConfig, Queue};
use notifications::{EmailMessage, EmailSender, MailError};

pub async fn setup_queue(name: &str) -> Result<Queue, Box<dyn Error>> {
    let broker = db::init(DbConfig::memory()).await?;
    Ok(Queue::new(broker, name))
}

/// Sender that records deliveries and fails the first `failures` of them.
#[derive(Clone, Default)]
pub struct RecordingMailer {
    sent: Arc<Mutex<Vec<EmailMessage>>>,
    attempts: Arc<Mutex<usize>>,
    failures: usize,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

impl EmailSender for RecordingMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            *attempts += 1;
            *attempts
        };
        if attempt <= self.failures {
            return Err(MailError::Delivery(format!("smtp refused attempt {}", attempt)));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}
