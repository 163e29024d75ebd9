use std::error::Error;
use std::time::Duration;

use db::{DbConfig, Queue};
use queue_core::{JobEvent, Payload, WorkerOptions};
use serde_json::Value;
use tokio::sync::broadcast;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn setup_queue(name: &str) -> Result<Queue, Box<dyn Error>> {
    let broker = db::init(DbConfig::memory()).await?;
    Ok(Queue::new(broker, name))
}

/// Options that keep tests fast: short polls, default locks.
pub fn fast_options(concurrency: usize) -> WorkerOptions {
    WorkerOptions::default()
        .with_concurrency(concurrency)
        .with_poll_interval_ms(20)
}

pub fn payload(to: &str) -> Payload {
    let mut map = Payload::new();
    map.insert("to".to_string(), Value::String(to.to_string()));
    map
}

/// Wait for the next event matching `pred`, skipping the rest.
pub async fn next_event(
    rx: &mut broadcast::Receiver<JobEvent>,
    pred: impl Fn(&JobEvent) -> bool,
) -> Result<JobEvent, Box<dyn Error>> {
    let wait = async {
        loop {
            let event = rx.recv().await?;
            if pred(&event) {
                return Ok::<_, broadcast::error::RecvError>(event);
            }
        }
    };
    Ok(tokio::time::timeout(EVENT_TIMEOUT, wait).await??)
}
