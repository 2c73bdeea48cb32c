//! Demo entry point.

use demo::{Config, DemoError};
use event_store::{InMemoryEventStore, PostgresEventStore};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<(), DemoError> {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // 3. Pick the event store and run
    let report = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
            let store = PostgresEventStore::new(pool);
            store.run_migrations().await?;
            tracing::info!("Using PostgreSQL event store");
            demo::run(store, &config).await?
        }
        None => {
            tracing::info!("Using in-memory event store");
            demo::run(InMemoryEventStore::new(), &config).await?
        }
    };

    tracing::info!(
        pets = report.pets,
        events_replayed = report.events_replayed,
        commands_rejected = report.commands_rejected,
        handler_failures = report.handler_failures,
        "Walkthrough complete"
    );

    // 4. Metrics snapshot
    println!("{}", metrics_handle.render());
    Ok(())
}
