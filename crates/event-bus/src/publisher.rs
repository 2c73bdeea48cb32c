use std::sync::Arc;

use async_trait::async_trait;
use event_store::EventEnvelope;
use tokio_util::sync::CancellationToken;

use crate::{AsyncEventBus, Result, SyncEventBus};

/// Hands committed events to a bus.
///
/// This is the seam the unit of work publishes through, so it does not
/// need to know which bus flavour it was given.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_committed(
        &self,
        events: &[EventEnvelope],
        cancel: Option<&CancellationToken>,
    ) -> Result<()>;
}

#[async_trait]
impl EventPublisher for SyncEventBus {
    async fn publish_committed(
        &self,
        events: &[EventEnvelope],
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        self.publish_batch(events, cancel).await
    }
}

#[async_trait]
impl EventPublisher for AsyncEventBus {
    async fn publish_committed(
        &self,
        events: &[EventEnvelope],
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        self.publish_batch(events.iter().cloned(), cancel).await
    }
}

#[async_trait]
impl<T: EventPublisher + ?Sized> EventPublisher for Arc<T> {
    async fn publish_committed(
        &self,
        events: &[EventEnvelope],
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        (**self).publish_committed(events, cancel).await
    }
}
