use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AggregateId;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version number for an aggregate, used for optimistic concurrency control.
///
/// A stream's version is the number of events it holds. The first event of a
/// stream carries version 1 and each subsequent event increments it by one,
/// so an aggregate that has never been written is at version 0.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) for a new aggregate.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the first version (1) for the first event.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns this version advanced by `count` events.
    pub fn advance(&self, count: usize) -> Self {
        Self(self.0 + count as i64)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// A persisted event: the record every boundary of the runtime exchanges.
///
/// Envelopes are produced by the event store when a commit is accepted and
/// are never mutated afterwards. The `event_type` and `payload` pair is a
/// durability contract: renaming a type tag or restructuring a payload
/// without a migration breaks replay of aggregates already on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// The type tag of the event (e.g., "PetRegistered", "PaymentCaptured").
    pub event_type: String,

    /// The aggregate this event belongs to.
    pub aggregate_id: AggregateId,

    /// The type of aggregate (e.g., "Pet", "Payment").
    pub aggregate_type: String,

    /// Position of this event in its aggregate's stream, starting at 1.
    pub version: Version,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// The event payload as JSON.
    pub payload: serde_json::Value,

    /// Additional metadata about the event (correlation ids, actor, ...).
    pub metadata: HashMap<String, serde_json::Value>,
}

/// An event that has been raised but not yet persisted.
///
/// It carries everything except the stream position; the event store assigns
/// versions when the commit is accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_type: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl NewEvent {
    /// Creates a new event with a fresh id, stamped with the current time.
    pub fn new(
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            occurred_at: Utc::now(),
            payload,
            metadata: HashMap::new(),
        }
    }

    /// Overrides the occurrence timestamp.
    pub fn occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Adds a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Seals the event at its assigned stream position.
    pub fn into_envelope(self, aggregate_id: AggregateId, version: Version) -> EventEnvelope {
        EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type,
            aggregate_id,
            aggregate_type: self.aggregate_type,
            version,
            occurred_at: self.occurred_at,
            payload: self.payload,
            metadata: self.metadata,
        }
    }
}
