use std::sync::Arc;

use event_store::EventEnvelope;
use tokio_util::sync::CancellationToken;

use crate::{BusError, EventHandler, HandlerFailure, Result, SubscriptionTable};

/// What the synchronous bus does when a handler fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop at the first failing handler and return its error. Later
    /// handlers for the same event are not invoked.
    #[default]
    ShortCircuit,
    /// Invoke every handler and return all failures together.
    CollectAll,
}

/// Dispatches each event to its subscribers on the publisher's task.
///
/// `publish` returns once every subscribed handler has run (or the first
/// one failed, under [`FailurePolicy::ShortCircuit`]).
#[derive(Clone, Default)]
pub struct SyncEventBus {
    subscriptions: Arc<SubscriptionTable>,
    policy: FailurePolicy,
}

impl SyncEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: FailurePolicy) -> Self {
        Self {
            subscriptions: Arc::new(SubscriptionTable::new()),
            policy,
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub async fn subscribe(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.subscriptions.subscribe(event_type, handler).await;
    }

    pub async fn subscribe_all(&self, handler: Arc<dyn EventHandler>) {
        self.subscriptions.subscribe_all(handler).await;
    }

    /// Invokes the handlers subscribed to this event, in subscription order.
    pub async fn publish(&self, event: &EventEnvelope) -> Result<()> {
        self.dispatch(event, None).await
    }

    /// Like [`publish`](Self::publish), but stops before the next handler
    /// once `cancel` fires. A handler that has started runs to completion.
    pub async fn publish_with_cancel(
        &self,
        event: &EventEnvelope,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.dispatch(event, Some(cancel)).await
    }

    /// Publishes events in order.
    ///
    /// Under `ShortCircuit` the first failure stops the whole batch. Under
    /// `CollectAll` every event is delivered and failures are merged.
    pub async fn publish_batch(
        &self,
        events: &[EventEnvelope],
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let mut failures = Vec::new();
        for event in events {
            match self.dispatch(event, cancel).await {
                Ok(()) => {}
                Err(BusError::Handlers(mut collected)) => failures.append(&mut collected),
                Err(other) => return Err(other),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(BusError::Handlers(failures))
        }
    }

    #[tracing::instrument(
        skip(self, event, cancel),
        fields(event_type = %event.event_type, aggregate_id = %event.aggregate_id, version = %event.version)
    )]
    async fn dispatch(&self, event: &EventEnvelope, cancel: Option<&CancellationToken>) -> Result<()> {
        metrics::counter!("event_bus_events_published_total", "mode" => "sync").increment(1);

        let handlers = self.subscriptions.handlers_for(&event.event_type).await;
        let mut failures = Vec::new();

        for handler in handlers {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                tracing::debug!("Publication cancelled");
                return Err(BusError::Cancelled);
            }

            metrics::counter!("event_bus_handler_invocations_total").increment(1);
            if let Err(error) = handler.handle(event).await {
                metrics::counter!("event_bus_handler_failures_total").increment(1);
                let failure = HandlerFailure::new(handler.name(), event, error);
                tracing::warn!(handler = handler.name(), error = %failure.error, "Handler failed");

                match self.policy {
                    FailurePolicy::ShortCircuit => return Err(BusError::Handler(failure)),
                    FailurePolicy::CollectAll => failures.push(failure),
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BusError::Handlers(failures))
        }
    }
}
