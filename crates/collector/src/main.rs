use std::sync::Arc;

use anyhow::{Context, Result};
use pulse_collector::{Collector, CollectorConfig, FilePolicyStore};
use pulse_core::telemetry::{init_telemetry, TelemetryConfig};
use pulse_storage::{EventStore, InMemoryEventStore, PostgresEventStore};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "info")
    // - PULSE_LOG_FORMAT: json or pretty
    let telemetry_config = TelemetryConfig::from_env();
    init_telemetry(&telemetry_config).context("Failed to initialize telemetry")?;

    tracing::info!(service = %telemetry_config.service_name, "pulse-collector starting...");

    let config = CollectorConfig::from_env();

    let store: Arc<dyn EventStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresEventStore::connect(url)
                .await
                .context("Failed to connect to database")?;
            store.migrate().await.context("Failed to run migrations")?;
            tracing::info!("Using PostgreSQL event store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory event store");
            Arc::new(InMemoryEventStore::new())
        }
    };

    let policies = Arc::new(FilePolicyStore::load(
        &config.policy.config_path,
        config.policy.default_template,
    ));

    tracing::info!(
        policy_path = %config.policy.config_path.display(),
        default_template = %config.policy.default_template,
        "Loaded site policies"
    );

    let collector = Collector::new(config, store, policies);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let jobs = collector.spawn_jobs(shutdown_rx);

    tracing::info!(jobs = jobs.len(), "Collector ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    shutdown_tx.send(true).ok();
    for job in jobs {
        if let Err(e) = job.await {
            tracing::error!(error = %e, "Job task failed");
        }
    }

    tracing::info!("Collector shutdown complete");
    Ok(())
}
