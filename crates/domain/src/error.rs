//! Domain error types.

use common::AggregateId;
use event_store::EventStoreError;
use thiserror::Error;

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// A command was rejected before any event was raised.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Aggregate not found.
    #[error("Aggregate not found: {aggregate_type} with id {aggregate_id}")]
    NotFound {
        aggregate_type: &'static str,
        aggregate_id: AggregateId,
    },

    /// A stored event could not be mapped onto the aggregate's event enum.
    ///
    /// Signals that the running code and the stored history disagree.
    #[error("Unrecognized event '{event_type}': {reason}")]
    Schema { event_type: String, reason: String },

    /// An operation was called in the wrong unit-of-work state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, DomainError::EventStore(e) if e.is_concurrency_conflict())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DomainError::NotFound { .. }
                | DomainError::EventStore(EventStoreError::AggregateNotFound(_))
        )
    }

    /// Whether reloading and re-running the command can succeed.
    pub fn is_retryable(&self) -> bool {
        self.is_concurrency_conflict()
    }
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
