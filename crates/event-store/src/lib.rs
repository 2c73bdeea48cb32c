//! Append-only event storage with optimistic concurrency control.
//!
//! - [`EventStore`] trait: per-aggregate streams, version-checked appends,
//!   atomic multi-stream commits
//! - [`InMemoryEventStore`] for tests and single-process deployments
//! - [`PostgresEventStore`] backed by sqlx

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod stream;

pub use common::AggregateId;
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventId, NewEvent, Version};
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use store::{AppendOptions, CommitBatch, EventFeed, EventStore, StreamCommit};
pub use stream::EventStream;
pub use tokio_util::sync::CancellationToken;
