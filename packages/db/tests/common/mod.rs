use db::{Broker, DbConfig, DbError, Queue};
use queue_core::Payload;
use serde_json::Value;

/// A fresh in-memory store per test, so tests can run in parallel.
pub async fn setup_queue(name: &str) -> Result<Queue, DbError> {
    let broker: Broker = db::init(DbConfig::memory()).await?;
    Ok(Queue::new(broker, name))
}

pub fn payload_with_message(message: &str) -> Payload {
    let mut map = Payload::new();
    map.insert("msg".to_string(), Value::String(message.to_string()));
    map
}
