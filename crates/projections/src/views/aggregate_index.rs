//! Aggregate index read model: one row per aggregate with its latest version.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::AggregateId;
use event_store::{EventEnvelope, Version};
use tokio::sync::RwLock;

use crate::Result;
use crate::projection::{Delivery, Projection, ProjectionPosition};
use crate::read_model::ReadModel;

/// Latest known state of one aggregate stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSummary {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub version: Version,
    pub last_event_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Indexes every aggregate seen on the event feed, regardless of type.
///
/// Each stream is indexed in version order. Redelivered envelopes are
/// ignored, and an envelope that arrives ahead of its predecessors waits for
/// catch-up.
#[derive(Clone)]
pub struct AggregateIndexView {
    entries: Arc<RwLock<HashMap<AggregateId, AggregateSummary>>>,
    position: Arc<RwLock<ProjectionPosition>>,
}

impl AggregateIndexView {
    /// Creates a new empty index.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            position: Arc::new(RwLock::new(ProjectionPosition::zero())),
        }
    }

    /// Gets the summary of one aggregate.
    pub async fn get(&self, aggregate_id: &AggregateId) -> Option<AggregateSummary> {
        self.entries.read().await.get(aggregate_id).cloned()
    }

    /// Gets all aggregates of a given type, ordered by id.
    pub async fn by_type(&self, aggregate_type: &str) -> Vec<AggregateSummary> {
        let mut found: Vec<_> = self
            .entries
            .read()
            .await
            .values()
            .filter(|s| s.aggregate_type == aggregate_type)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.aggregate_id.as_str().cmp(b.aggregate_id.as_str()));
        found
    }

    /// Gets every indexed aggregate, ordered by id.
    pub async fn all(&self) -> Vec<AggregateSummary> {
        let mut found: Vec<_> = self.entries.read().await.values().cloned().collect();
        found.sort_by(|a, b| a.aggregate_id.as_str().cmp(b.aggregate_id.as_str()));
        found
    }
}

impl Default for AggregateIndexView {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Projection for AggregateIndexView {
    fn name(&self) -> &'static str {
        "AggregateIndexView"
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<()> {
        let mut position = self.position.write().await;
        match position.record(event) {
            Delivery::Next => {}
            Delivery::Duplicate => {
                tracing::trace!(
                    aggregate_id = %event.aggregate_id,
                    version = %event.version,
                    "Skipping redelivered event"
                );
                return Ok(());
            }
            Delivery::Gap { expected } => {
                tracing::debug!(
                    aggregate_id = %event.aggregate_id,
                    version = %event.version,
                    %expected,
                    "Event arrived ahead of its stream, left for catch-up"
                );
                return Ok(());
            }
        }

        let mut entries = self.entries.write().await;
        entries
            .entry(event.aggregate_id.clone())
            .and_modify(|summary| {
                summary.version = event.version;
                summary.last_event_type = event.event_type.clone();
                summary.updated_at = event.occurred_at;
            })
            .or_insert_with(|| AggregateSummary {
                aggregate_id: event.aggregate_id.clone(),
                aggregate_type: event.aggregate_type.clone(),
                version: event.version,
                last_event_type: event.event_type.clone(),
                created_at: event.occurred_at,
                updated_at: event.occurred_at,
            });
        Ok(())
    }

    async fn position(&self) -> ProjectionPosition {
        self.position.read().await.clone()
    }

    async fn reset(&self) -> Result<()> {
        let mut position = self.position.write().await;
        self.entries.write().await.clear();
        *position = ProjectionPosition::zero();
        Ok(())
    }
}

impl ReadModel for AggregateIndexView {
    fn name(&self) -> &'static str {
        "AggregateIndexView"
    }

    fn count(&self) -> usize {
        self.entries.try_read().map(|e| e.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_store::NewEvent;

    fn envelope(id: &AggregateId, aggregate_type: &str, event_type: &str, version: i64) -> EventEnvelope {
        NewEvent::new(aggregate_type, event_type, serde_json::json!({}))
            .into_envelope(id.clone(), Version::new(version))
    }

    #[tokio::test]
    async fn first_event_creates_entry() {
        let view = AggregateIndexView::new();
        let id = AggregateId::from("pet-1");

        view.handle(&envelope(&id, "Pet", "PetRegistered", 1))
            .await
            .unwrap();

        let summary = view.get(&id).await.unwrap();
        assert_eq!(summary.aggregate_type, "Pet");
        assert_eq!(summary.version, Version::first());
        assert_eq!(summary.last_event_type, "PetRegistered");
        assert_eq!(summary.created_at, summary.updated_at);
    }

    #[tokio::test]
    async fn later_events_advance_version() {
        let view = AggregateIndexView::new();
        let id = AggregateId::from("pet-1");

        view.handle(&envelope(&id, "Pet", "PetRegistered", 1))
            .await
            .unwrap();
        view.handle(&envelope(&id, "Pet", "PetRenamed", 2))
            .await
            .unwrap();

        let summary = view.get(&id).await.unwrap();
        assert_eq!(summary.version, Version::new(2));
        assert_eq!(summary.last_event_type, "PetRenamed");
    }

    #[tokio::test]
    async fn redelivery_is_ignored() {
        let view = AggregateIndexView::new();
        let id = AggregateId::from("pet-1");
        let first = envelope(&id, "Pet", "PetRegistered", 1);
        let second = envelope(&id, "Pet", "PetRenamed", 2);

        view.handle(&first).await.unwrap();
        view.handle(&second).await.unwrap();
        view.handle(&first).await.unwrap();
        view.handle(&second).await.unwrap();

        let summary = view.get(&id).await.unwrap();
        assert_eq!(summary.version, Version::new(2));
        assert_eq!(summary.last_event_type, "PetRenamed");
        assert_eq!(ReadModel::count(&view), 1);
        assert_eq!(view.position().await.events_processed(), 2);
    }

    #[tokio::test]
    async fn filter_by_type() {
        let view = AggregateIndexView::new();
        let pet = AggregateId::from("a");
        let payment = AggregateId::from("b");

        view.handle(&envelope(&pet, "Pet", "PetRegistered", 1))
            .await
            .unwrap();
        view.handle(&envelope(&payment, "Payment", "PaymentRequested", 1))
            .await
            .unwrap();

        let pets = view.by_type("Pet").await;
        assert_eq!(pets.len(), 1);
        assert_eq!(pets[0].aggregate_id, pet);
        assert_eq!(view.all().await.len(), 2);
        assert!(view.by_type("Order").await.is_empty());
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let view = AggregateIndexView::new();
        let id = AggregateId::from("pet-1");

        view.handle(&envelope(&id, "Pet", "PetRegistered", 1))
            .await
            .unwrap();
        view.reset().await.unwrap();

        assert!(view.get(&id).await.is_none());
        assert_eq!(view.position().await, ProjectionPosition::zero());
        assert_eq!(ReadModel::count(&view), 0);
    }

    #[tokio::test]
    async fn early_event_leaves_row_at_last_contiguous_version() {
        let view = AggregateIndexView::new();
        let id = AggregateId::from("pet-1");

        view.handle(&envelope(&id, "Pet", "PetRegistered", 1))
            .await
            .unwrap();
        view.handle(&envelope(&id, "Pet", "PetArchived", 3))
            .await
            .unwrap();
        assert_eq!(view.get(&id).await.unwrap().version, Version::first());

        view.handle(&envelope(&id, "Pet", "PetRenamed", 2))
            .await
            .unwrap();
        view.handle(&envelope(&id, "Pet", "PetArchived", 3))
            .await
            .unwrap();
        let summary = view.get(&id).await.unwrap();
        assert_eq!(summary.version, Version::new(3));
        assert_eq!(summary.last_event_type, "PetArchived");
    }
}
