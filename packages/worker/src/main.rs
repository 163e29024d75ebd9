//! Email worker process.
//!
//! Consumes `email-notification` jobs from the configured queue until Ctrl-C.

mod config;

use std::time::Duration;

use actors::WorkerPool;
use anyhow::{Context, Result};
use db::Queue;
use notifications::{EmailJobHandler, LogMailer};
use queue_core::{JobEvent, JobStatus};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;

/// Waiting jobs listed per status report.
const STATUS_SAMPLE: usize = 10;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Connecting to queue store at {}", config.store_url);
    let broker = db::init(config.db_config())
        .await
        .context("Failed to connect to queue store")?;
    tracing::info!("Connected to queue store");

    let queue = Queue::new(broker, config.queue_name.clone());
    if config.purge_on_start {
        queue
            .purge(true)
            .await
            .context("Failed to purge queue at startup")?;
        tracing::info!("Queue '{}' purged", queue.name());
    }

    let handler = EmailJobHandler::new(LogMailer::new());
    let mut pool = WorkerPool::new(queue.clone(), handler, config.worker_options());
    let events = tokio::spawn(log_events(pool.subscribe()));

    pool.start().await.context("Failed to start worker pool")?;
    let status = tokio::spawn(report_status(queue.clone(), config.status_interval()));
    tracing::info!("Email worker is running and waiting for jobs");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, waiting for running jobs to finish");

    status.abort();
    pool.stop().await.context("Failed to stop worker pool")?;
    events.abort();

    tracing::info!("Email worker stopped");
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<JobEvent>) {
    loop {
        match events.recv().await {
            Ok(event @ JobEvent::JobFailed { will_retry: false, .. }) => {
                tracing::error!("{}", event.description());
            }
            Ok(event @ (JobEvent::JobFailed { .. } | JobEvent::JobStalled { .. })) => {
                tracing::warn!("{}", event.description());
            }
            Ok(event) => tracing::info!("{}", event.description()),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Event log fell behind, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn report_status(queue: Queue, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;

        match queue.get_counts(&JobStatus::ALL).await {
            Ok(counts) => tracing::info!("Queue status: {}", counts),
            Err(e) => {
                tracing::warn!("Error checking queue status: {}", e);
                continue;
            }
        }

        match queue.list_jobs(&[JobStatus::Waiting], 0, STATUS_SAMPLE).await {
            Ok(waiting) if !waiting.is_empty() => {
                tracing::info!("Found {} waiting jobs:", waiting.len());
                for job in waiting {
                    tracing::info!(
                        "- Job {}, name: {}, data: {}",
                        job.id,
                        job.name,
                        serde_json::Value::Object(job.payload)
                    );
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Error listing waiting jobs: {}", e),
        }
    }
}
