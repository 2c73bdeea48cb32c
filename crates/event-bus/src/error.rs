//! Event bus error types.

use common::AggregateId;
use event_store::{EventEnvelope, Version};
use thiserror::Error;

/// Error returned by a subscriber.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    /// Creates a handler error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a handler error wrapping an underlying cause.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A handler failure together with the event it failed on.
#[derive(Debug, Error)]
#[error(
    "Handler '{handler}' failed on {event_type} (aggregate {aggregate_id}, version {version}): {error}"
)]
pub struct HandlerFailure {
    pub handler: String,
    pub event_type: String,
    pub aggregate_id: AggregateId,
    pub version: Version,
    #[source]
    pub error: HandlerError,
}

impl HandlerFailure {
    pub fn new(handler: impl Into<String>, event: &EventEnvelope, error: HandlerError) -> Self {
        Self {
            handler: handler.into(),
            event_type: event.event_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            version: event.version,
            error,
        }
    }
}

/// Errors returned to publishers.
#[derive(Debug, Error)]
pub enum BusError {
    /// A subscriber failed and later subscribers were skipped.
    #[error(transparent)]
    Handler(#[from] HandlerFailure),

    /// One or more subscribers failed; every subscriber was still invoked.
    #[error("{} handler(s) failed", .0.len())]
    Handlers(Vec<HandlerFailure>),

    /// The bus no longer accepts events.
    #[error("Event bus is stopped")]
    Stopped,

    /// Publication was cancelled before completing.
    #[error("Publication cancelled")]
    Cancelled,
}

impl BusError {
    /// Returns every handler failure carried by this error.
    pub fn failures(&self) -> Vec<&HandlerFailure> {
        match self {
            BusError::Handler(failure) => vec![failure],
            BusError::Handlers(failures) => failures.iter().collect(),
            BusError::Stopped | BusError::Cancelled => Vec::new(),
        }
    }
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
