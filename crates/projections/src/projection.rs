//! The projection contract.

use std::collections::HashMap;

use async_trait::async_trait;
use common::AggregateId;
use event_store::{EventEnvelope, Version};

use crate::Result;

/// What a projection should do with an offered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The next event of its stream. Apply it.
    Next,
    /// Already applied. Skip it.
    Duplicate,
    /// Earlier events of the stream have not been applied yet. Skip it;
    /// catch-up delivers the stream in order.
    Gap { expected: Version },
}

/// Per-stream high-water marks of the events a projection has applied.
///
/// Streams only advance one contiguous version at a time, so a redelivered
/// or early event never moves the position past something that was not
/// applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectionPosition {
    streams: HashMap<AggregateId, Version>,
}

impl ProjectionPosition {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Last applied version of a stream, `Version::initial()` if none.
    pub fn version_of(&self, aggregate_id: &AggregateId) -> Version {
        self.streams
            .get(aggregate_id)
            .copied()
            .unwrap_or_else(Version::initial)
    }

    pub fn check(&self, event: &EventEnvelope) -> Delivery {
        let applied = self.version_of(&event.aggregate_id);
        if event.version <= applied {
            Delivery::Duplicate
        } else if event.version == applied.next() {
            Delivery::Next
        } else {
            Delivery::Gap {
                expected: applied.next(),
            }
        }
    }

    /// Whether `event` was already applied.
    pub fn covers(&self, event: &EventEnvelope) -> bool {
        event.version <= self.version_of(&event.aggregate_id)
    }

    /// Advances the event's stream when `event` is its next one.
    pub fn record(&mut self, event: &EventEnvelope) -> Delivery {
        let delivery = self.check(event);
        if delivery == Delivery::Next {
            self.streams.insert(event.aggregate_id.clone(), event.version);
        }
        delivery
    }

    /// Number of events applied across all streams.
    pub fn events_processed(&self) -> u64 {
        self.streams
            .values()
            .map(|version| version.as_i64().max(0) as u64)
            .sum()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

impl std::fmt::Display for ProjectionPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "position({} events in {} streams)",
            self.events_processed(),
            self.stream_count()
        )
    }
}

/// Consumes committed events to maintain a read-optimized view.
///
/// Delivery is at-least-once: after a crash between commit and publish the
/// same envelope can arrive again, from the bus or from a catch-up replay,
/// and a multi-worker bus may hand over a stream's events out of order.
/// Implementations keep a [`ProjectionPosition`] and change their state only
/// when [`ProjectionPosition::record`] returns [`Delivery::Next`]. Events of
/// types a projection does not care about are recorded all the same.
#[async_trait]
pub trait Projection: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &EventEnvelope) -> Result<()>;

    async fn position(&self) -> ProjectionPosition;

    /// Drops all derived state and rewinds to [`ProjectionPosition::zero`].
    async fn reset(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_store::NewEvent;

    fn event(id: &str, version: i64) -> EventEnvelope {
        NewEvent::new("Pet", "PetWeighed", serde_json::json!({}))
            .into_envelope(AggregateId::from(id), Version::new(version))
    }

    #[test]
    fn fresh_position_covers_nothing() {
        let pos = ProjectionPosition::zero();
        assert!(!pos.covers(&event("pet-1", 1)));
        assert_eq!(pos.check(&event("pet-1", 1)), Delivery::Next);
    }

    #[test]
    fn records_streams_independently() {
        let mut pos = ProjectionPosition::zero();
        assert_eq!(pos.record(&event("pet-1", 1)), Delivery::Next);
        assert_eq!(pos.record(&event("pet-1", 2)), Delivery::Next);
        assert_eq!(pos.record(&event("pet-2", 1)), Delivery::Next);

        assert!(pos.covers(&event("pet-1", 2)));
        assert!(!pos.covers(&event("pet-2", 2)));
        assert_eq!(pos.version_of(&AggregateId::from("pet-1")), Version::new(2));
        assert_eq!(pos.events_processed(), 3);
        assert_eq!(pos.stream_count(), 2);
    }

    #[test]
    fn redelivery_does_not_advance() {
        let mut pos = ProjectionPosition::zero();
        pos.record(&event("pet-1", 1));
        pos.record(&event("pet-1", 2));

        assert_eq!(pos.record(&event("pet-1", 2)), Delivery::Duplicate);
        assert_eq!(pos.record(&event("pet-1", 1)), Delivery::Duplicate);
        assert_eq!(pos.events_processed(), 2);
    }

    #[test]
    fn early_event_is_a_gap() {
        let mut pos = ProjectionPosition::zero();
        pos.record(&event("pet-1", 1));

        assert_eq!(
            pos.record(&event("pet-1", 3)),
            Delivery::Gap {
                expected: Version::new(2)
            }
        );
        assert!(!pos.covers(&event("pet-1", 2)));
        assert_eq!(pos.events_processed(), 1);
    }

    #[test]
    fn renders_totals() {
        let mut pos = ProjectionPosition::zero();
        pos.record(&event("pet-1", 1));
        assert_eq!(pos.to_string(), "position(1 events in 1 streams)");
    }
}
