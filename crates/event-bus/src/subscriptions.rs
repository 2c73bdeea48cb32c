use std::sync::Arc;

use tokio::sync::RwLock;

use crate::EventHandler;

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// Events whose `event_type` equals the given name.
    EventType(String),
    /// Every event.
    All,
}

impl Topic {
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Topic::EventType(name) => name == event_type,
            Topic::All => true,
        }
    }
}

struct Subscription {
    topic: Topic,
    handler: Arc<dyn EventHandler>,
}

/// Ordered registry of subscriptions.
///
/// Handlers for one event are returned in subscription order. Subscribing
/// the same handler twice yields two invocations.
#[derive(Default)]
pub struct SubscriptionTable {
    entries: RwLock<Vec<Subscription>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.add(Topic::EventType(event_type.into()), handler).await;
    }

    pub async fn subscribe_all(&self, handler: Arc<dyn EventHandler>) {
        self.add(Topic::All, handler).await;
    }

    async fn add(&self, topic: Topic, handler: Arc<dyn EventHandler>) {
        tracing::debug!(handler = handler.name(), ?topic, "Handler subscribed");
        self.entries.write().await.push(Subscription { topic, handler });
    }

    /// Snapshot of the handlers interested in `event_type`.
    pub async fn handlers_for(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|s| s.topic.matches(event_type))
            .map(|s| Arc::clone(&s.handler))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
