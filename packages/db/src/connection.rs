//! Broker connection: a shared, reconnecting handle to the SurrealDB store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};
use surrealdb::error::Api;
use surrealdb::opt::auth::Root;
use thiserror::Error;

/// Database connection wrapper.
pub type Database = Surreal<Any>;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Endpoint URL: "mem://", "rocksdb://path", or "ws://host:port" for a shared server.
    pub endpoint: String,
    /// Namespace to use
    pub namespace: String,
    /// Database name to use
    pub database: String,
    /// Optional root credentials for authentication
    pub credentials: Option<(String, String)>,
    /// First delay between reconnect attempts.
    pub reconnect_initial_delay: Duration,
    /// Upper bound for the reconnect delay.
    pub reconnect_max_delay: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "notifications".to_string(),
            database: "queue".to_string(),
            credentials: None,
            reconnect_initial_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(5),
        }
    }
}

impl DbConfig {
    /// Create a config for in-memory testing.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Create a config for a network-reachable server, e.g. `ws://localhost:8000`.
    pub fn remote(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Create a config for RocksDB persistence (requires rocksdb feature).
    pub fn rocksdb(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("rocksdb://{}", path.into()),
            ..Default::default()
        }
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database name.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set root credentials for authentication.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Set the reconnect backoff bounds.
    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial_delay = initial;
        self.reconnect_max_delay = max.max(initial);
        self
    }

    /// Whether the endpoint is a network server that can drop and come back.
    ///
    /// In-process engines are never reopened: a fresh `mem://` instance
    /// would silently lose every durable job.
    pub fn is_remote(&self) -> bool {
        ["ws://", "wss://", "http://", "https://"]
            .iter()
            .any(|scheme| self.endpoint.starts_with(scheme))
    }
}

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Transaction conflict: {0}")]
    Conflict(String),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Purge refused: {0} job(s) active")]
    PurgeRefused(u64),
    #[error(transparent)]
    Transition(#[from] queue_core::TransitionError),
}

impl From<surrealdb::Error> for DbError {
    fn from(err: surrealdb::Error) -> Self {
        let message = err.to_string();
        if is_retryable_conflict(&message) {
            DbError::Conflict(message)
        } else if is_connection_failure(&err) {
            DbError::Unavailable(message)
        } else {
            DbError::Query(message)
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

/// Transaction conflicts only surface as text, locally and over the wire.
fn is_retryable_conflict(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("can be retried") || lower.contains("conflict")
}

/// The transport failed, as opposed to the statement.
fn is_connection_failure(err: &surrealdb::Error) -> bool {
    matches!(
        err,
        surrealdb::Error::Api(Api::Ws(_) | Api::Http(_) | Api::ConnectionUninitialised)
    )
}

struct BrokerInner {
    config: DbConfig,
    client: RwLock<Database>,
    reconnecting: AtomicBool,
}

/// Shared handle to the durable store.
///
/// Cloning is cheap. When a query reports the store unreachable, a single
/// background task reopens the connection with exponential backoff while
/// callers keep receiving `DbError::Unavailable`.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("endpoint", &self.inner.config.endpoint)
            .field("reconnecting", &self.is_reconnecting())
            .finish()
    }
}

impl Broker {
    /// Open the connection described by `config`.
    pub async fn connect(config: DbConfig) -> Result<Self, DbError> {
        let client = open(&config).await?;
        Ok(Self {
            inner: Arc::new(BrokerInner {
                config,
                client: RwLock::new(client),
                reconnecting: AtomicBool::new(false),
            }),
        })
    }

    /// Current client. Cheap to clone.
    pub fn client(&self) -> Database {
        self.inner
            .client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn config(&self) -> &DbConfig {
        &self.inner.config
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::Acquire)
    }

    /// Round-trip to the store.
    pub async fn health(&self) -> Result<(), DbError> {
        let result = self.client().health().await.map_err(DbError::from);
        self.observe(result)
    }

    /// Pass `result` through, scheduling a reconnect if it says the store is gone.
    pub(crate) fn observe<T>(&self, result: Result<T, DbError>) -> Result<T, DbError> {
        if let Err(DbError::Unavailable(reason)) = &result {
            self.schedule_reconnect(reason);
        }
        result
    }

    fn schedule_reconnect(&self, reason: &str) {
        if !self.inner.config.is_remote() {
            return;
        }
        if self.inner.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::warn!(
            endpoint = %self.inner.config.endpoint,
            "Store unavailable ({}), reconnecting in background",
            reason
        );
        tokio::spawn(reconnect_loop(Arc::downgrade(&self.inner)));
    }
}

async fn reconnect_loop(inner: Weak<BrokerInner>) {
    let Some(initial) = inner.upgrade().map(|i| i.config.reconnect_initial_delay) else {
        return;
    };
    let mut delay = initial;

    loop {
        tokio::time::sleep(delay).await;

        // Every handle was dropped while we were away.
        let Some(inner) = inner.upgrade() else {
            return;
        };

        match open(&inner.config).await {
            Ok(client) => {
                *inner.client.write().unwrap_or_else(PoisonError::into_inner) = client;
                inner.reconnecting.store(false, Ordering::Release);
                tracing::info!(endpoint = %inner.config.endpoint, "Reconnected to store");
                return;
            }
            Err(e) => {
                delay = (delay * 2).min(inner.config.reconnect_max_delay);
                tracing::warn!(
                    endpoint = %inner.config.endpoint,
                    "Reconnect failed: {}; next attempt in {:?}",
                    e,
                    delay
                );
            }
        }
    }
}

async fn open(config: &DbConfig) -> Result<Database, DbError> {
    tracing::info!("Connecting to database: {}", config.endpoint);

    let db = connect(&config.endpoint).await?;

    // Authenticate if credentials provided
    if let Some((username, password)) = &config.credentials {
        db.signin(Root { username, password }).await?;
    }

    // Select namespace and database
    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await?;

    tracing::info!(
        "Connected to database: {}/{}",
        config.namespace,
        config.database
    );

    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_endpoints_reconnect() {
        assert!(DbConfig::remote("ws://localhost:8000").is_remote());
        assert!(DbConfig::remote("https://db.example.com").is_remote());
        assert!(!DbConfig::memory().is_remote());
        assert!(!DbConfig::rocksdb("/tmp/queue").is_remote());
    }

    #[test]
    fn reconnect_max_never_below_initial() {
        let config = DbConfig::memory()
            .with_reconnect_backoff(Duration::from_secs(2), Duration::from_millis(10));
        assert_eq!(config.reconnect_max_delay, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn memory_broker_is_healthy() -> Result<(), DbError> {
        let broker = Broker::connect(DbConfig::memory()).await?;
        broker.health().await?;
        assert!(!broker.is_reconnecting());
        Ok(())
    }

    #[test]
    fn transport_errors_map_to_unavailable() {
        let errors = [
            Api::Ws("broken pipe".into()),
            Api::Http("error sending request".into()),
            Api::ConnectionUninitialised,
        ];
        for api in errors {
            let err = DbError::from(surrealdb::Error::Api(api));
            assert!(matches!(err, DbError::Unavailable(_)), "got {:?}", err);
        }
    }

    #[test]
    fn retryable_conflicts_map_to_conflict() {
        let api = Api::Query(
            "Failed to commit transaction due to a read or write conflict. \
             This transaction can be retried"
                .into(),
        );
        assert!(matches!(
            DbError::from(surrealdb::Error::Api(api)),
            DbError::Conflict(_)
        ));
    }

    #[test]
    fn statement_errors_map_to_query() {
        let api = Api::Query("Found 'x' for field `attempts`, but expected an int".into());
        assert!(matches!(
            DbError::from(surrealdb::Error::Api(api)),
            DbError::Query(_)
        ));
    }

    #[tokio::test]
    async fn parse_errors_from_the_store_map_to_query() -> Result<(), DbError> {
        let broker = Broker::connect(DbConfig::memory()).await?;
        let err = broker
            .client()
            .query("SELEC * FROM job")
            .await
            .and_then(|response| response.check())
            .map(|_| ())
            .map_err(DbError::from);
        assert!(matches!(err, Err(DbError::Query(_))), "got {:?}", err);
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_memory_store_is_never_reopened() -> Result<(), DbError> {
        let broker = Broker::connect(DbConfig::memory()).await?;
        let result: Result<(), DbError> =
            broker.observe(Err(DbError::Unavailable("gone".into())));
        assert!(result.is_err());
        assert!(!broker.is_reconnecting());
        Ok(())
    }
}
