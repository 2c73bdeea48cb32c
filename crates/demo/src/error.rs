//! Demo error type.

use domain::DomainError;
use event_bus::BusError;
use event_store::EventStoreError;
use projections::ProjectionError;
use thiserror::Error;

/// Anything that can stop the walkthrough.
#[derive(Debug, Error)]
pub enum DemoError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Metrics recorder setup failed: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    /// A read model disagrees with the store after catch-up.
    #[error("Read model mismatch: {0}")]
    Mismatch(String),
}

pub type Result<T> = std::result::Result<T, DemoError>;
