use anyhow::{Context, Result, bail};
use db::DbConfig;
use dotenvy::dotenv;
use queue_core::WorkerOptions;
use std::env;
use std::time::Duration;

/// Worker process configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub store_url: String,
    pub namespace: String,
    pub database: String,
    pub store_user: Option<String>,
    pub store_pass: Option<String>,
    pub queue_name: String,
    pub concurrency: usize,
    pub status_interval_secs: u64,
    pub purge_on_start: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Self {
            store_url: var("QUEUE_STORE_URL", "ws://localhost:8000"),
            namespace: var("QUEUE_NAMESPACE", "notifications"),
            database: var("QUEUE_DATABASE", "queue"),
            store_user: lookup("QUEUE_STORE_USER"),
            store_pass: lookup("QUEUE_STORE_PASS"),
            queue_name: var("QUEUE_NAME", "email"),
            concurrency: var("WORKER_CONCURRENCY", "5")
                .parse()
                .context("WORKER_CONCURRENCY must be a valid number")?,
            status_interval_secs: var("STATUS_INTERVAL_SECS", "5")
                .parse()
                .context("STATUS_INTERVAL_SECS must be a valid number")?,
            purge_on_start: parse_flag(&var("PURGE_ON_START", "false"))
                .context("PURGE_ON_START must be true or false")?,
        };

        if config.concurrency == 0 {
            bail!("WORKER_CONCURRENCY must be at least 1");
        }
        if config.status_interval_secs == 0 {
            bail!("STATUS_INTERVAL_SECS must be at least 1");
        }
        if config.store_user.is_some() != config.store_pass.is_some() {
            bail!("QUEUE_STORE_USER and QUEUE_STORE_PASS must be set together");
        }
        Ok(config)
    }

    pub fn db_config(&self) -> DbConfig {
        let config = DbConfig::remote(&self.store_url)
            .with_namespace(&self.namespace)
            .with_database(&self.database);
        match (&self.store_user, &self.store_pass) {
            (Some(user), Some(pass)) => config.with_credentials(user, pass),
            _ => config,
        }
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions::default().with_concurrency(self.concurrency)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("unrecognised flag value '{}'", other),
    }
}
