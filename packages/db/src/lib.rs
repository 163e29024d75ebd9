//! SurrealDB-backed durable job queue.
//!
//! This crate provides the broker connection, the job schema, the job
//! repository, and the [`Queue`] that producers, operators, and workers use.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod queue;
mod schema;
pub mod repositories;

pub use connection::{Broker, Database, DbConfig, DbError};
pub use queue::Queue;
pub use schema::init_schema;

/// Connect to the store and make sure the schema exists.
///
/// This should be called once at startup.
pub async fn init(config: DbConfig) -> Result<Broker, DbError> {
    let broker = Broker::connect(config).await?;
    init_schema(&broker).await?;
    Ok(broker)
}
