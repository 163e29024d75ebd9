//! Database schema definitions using SurrealQL.

use crate::{Broker, DbError};

/// Initialize the database schema.
///
/// This creates the job table, its fields, and indexes. Safe to run on every
/// start.
pub async fn init_schema(broker: &Broker) -> Result<(), DbError> {
    let db = broker.client();

    tracing::info!("Initializing database schema...");

    let result = db.query(JOB_SCHEMA).await.map_err(DbError::from);
    broker.observe(result)?.check().map_err(DbError::from)?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job table schema. Timestamps are epoch milliseconds.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS job_id ON job TYPE string;
DEFINE FIELD IF NOT EXISTS queue ON job TYPE string;
DEFINE FIELD IF NOT EXISTS name ON job TYPE string;
DEFINE FIELD IF NOT EXISTS payload ON job FLEXIBLE TYPE object;
DEFINE FIELD IF NOT EXISTS status ON job TYPE string
    ASSERT $value INSIDE ["waiting", "active", "completed", "failed"];
DEFINE FIELD IF NOT EXISTS attempts ON job TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS max_attempts ON job TYPE int DEFAULT 3;
DEFINE FIELD IF NOT EXISTS backoff_base_ms ON job TYPE int DEFAULT 1000;
DEFINE FIELD IF NOT EXISTS remove_on_complete ON job TYPE bool DEFAULT true;
DEFINE FIELD IF NOT EXISTS next_run_at ON job TYPE int;
DEFINE FIELD IF NOT EXISTS created_at ON job TYPE int;
DEFINE FIELD IF NOT EXISTS processed_at ON job TYPE option<int>;
DEFINE FIELD IF NOT EXISTS finished_at ON job TYPE option<int>;
DEFINE FIELD IF NOT EXISTS error ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS lock ON job FLEXIBLE TYPE option<object>;

DEFINE INDEX IF NOT EXISTS job_id ON job FIELDS job_id UNIQUE;
DEFINE INDEX IF NOT EXISTS job_queue_status ON job FIELDS queue, status;

-- Claim polling: waiting jobs by eligibility time
DEFINE INDEX IF NOT EXISTS job_queue_due ON job FIELDS queue, status, next_run_at;
"#;
