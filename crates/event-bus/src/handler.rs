use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use event_store::EventEnvelope;

use crate::HandlerError;

/// A subscriber to committed events.
///
/// Handlers receive envelopes that are already durable. A handler that
/// needs to survive re-delivery after a crash must be idempotent on
/// `event_id`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Returns the handler's name, used in logs and failure reports.
    fn name(&self) -> &str;

    /// Handles a single event.
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        (self.f)(event.clone()).await
    }
}

/// Wraps an async closure as a named handler.
///
/// ```ignore
/// let audit = handler_fn("audit", |event| async move {
///     tracing::info!(event_type = %event.event_type, "audited");
///     Ok(())
/// });
/// bus.subscribe("PetCreated", audit).await;
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<FnHandler<F>>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}
