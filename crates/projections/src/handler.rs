//! Bus delivery for projections.

use std::sync::Arc;

use async_trait::async_trait;
use event_bus::{EventHandler, HandlerError};
use event_store::EventEnvelope;

use crate::projection::Projection;

/// Subscribes a [`Projection`] to an event bus.
pub struct ProjectionHandler {
    projection: Arc<dyn Projection>,
}

impl ProjectionHandler {
    pub fn new(projection: Arc<dyn Projection>) -> Arc<Self> {
        Arc::new(Self { projection })
    }
}

#[async_trait]
impl EventHandler for ProjectionHandler {
    fn name(&self) -> &str {
        self.projection.name()
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        self.projection.handle(event).await.map_err(|err| {
            HandlerError::with_source(
                format!("projection {} failed", self.projection.name()),
                err,
            )
        })?;
        metrics::counter!("projections_events_processed", "source" => "bus").increment(1);
        Ok(())
    }
}
