//! Projection processor for feeding events to projections.

use std::sync::Arc;

use event_store::{EventEnvelope, EventStore};
use futures_util::StreamExt;

use crate::Result;
use crate::projection::Projection;

/// Processes events from an event store and delivers them to projections.
///
/// The processor supports:
/// - Catch-up: replays the global feed to bring projections up to date
/// - Single event delivery: hands one new event to every projection
/// - Rebuild: resets all projections and replays from scratch
///
/// Catch-up is also how events are republished after a crash between commit
/// and publish.
pub struct ProjectionProcessor<S: EventStore> {
    store: S,
    projections: Vec<Arc<dyn Projection>>,
}

impl<S: EventStore> ProjectionProcessor<S> {
    /// Creates a new processor with the given event store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            projections: Vec::new(),
        }
    }

    /// Registers a projection with this processor.
    pub fn register(&mut self, projection: Arc<dyn Projection>) {
        tracing::debug!(projection = projection.name(), "Projection registered");
        self.projections.push(projection);
    }

    /// Returns the number of registered projections.
    pub fn projection_count(&self) -> usize {
        self.projections.len()
    }

    /// Streams all events from the store and delivers each one to every
    /// projection that has not applied it yet.
    ///
    /// Positions are read once up front. Returns the number of events in the
    /// feed.
    #[tracing::instrument(skip(self))]
    pub async fn run_catch_up(&self) -> Result<u64> {
        let mut positions = Vec::with_capacity(self.projections.len());
        for projection in &self.projections {
            positions.push(projection.position().await);
        }

        let mut stream = self.store.stream_all_events().await?;
        let mut feed_len: u64 = 0;

        while let Some(result) = stream.next().await {
            let event = result?;
            feed_len += 1;

            for (projection, position) in self.projections.iter().zip(&positions) {
                if !position.covers(&event) {
                    projection.handle(&event).await?;
                    metrics::counter!("projections_events_processed", "source" => "catch_up")
                        .increment(1);
                }
            }
        }

        tracing::info!(events = feed_len, "Catch-up complete");
        Ok(feed_len)
    }

    /// Delivers a single event to all registered projections.
    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type))]
    pub async fn process_event(&self, event: &EventEnvelope) -> Result<()> {
        for projection in &self.projections {
            projection.handle(event).await?;
        }
        Ok(())
    }

    /// Resets all projections and replays all events from the store.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild_all(&self) -> Result<u64> {
        for projection in &self.projections {
            projection.reset().await?;
        }
        self.run_catch_up().await
    }
}
