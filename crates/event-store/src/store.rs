use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;
use tokio_util::sync::CancellationToken;

use crate::{AggregateId, EventEnvelope, EventStoreError, EventStream, NewEvent, Result, Version};

/// Options for appending events to a single stream.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Version the caller last observed. The append is rejected unless the
    /// stream is still at exactly this version.
    pub expected_version: Version,

    /// Checked before the write starts. A write that has started always
    /// runs to completion.
    pub cancellation: Option<CancellationToken>,
}

impl AppendOptions {
    /// Creates options expecting the aggregate to be at a specific version.
    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: version,
            cancellation: None,
        }
    }

    /// Creates options expecting the aggregate to not exist (new aggregate).
    pub fn expect_new() -> Self {
        Self::expect_version(Version::initial())
    }

    /// Attaches a cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// New events for one stream, guarded by the version the writer observed.
#[derive(Debug, Clone)]
pub struct StreamCommit {
    pub aggregate_id: AggregateId,
    pub expected_version: Version,
    pub events: Vec<NewEvent>,
}

impl StreamCommit {
    pub fn new(aggregate_id: AggregateId, expected_version: Version, events: Vec<NewEvent>) -> Self {
        Self {
            aggregate_id,
            expected_version,
            events,
        }
    }
}

/// A set of stream commits that must be accepted or rejected as a whole.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub commits: Vec<StreamCommit>,
    pub cancellation: Option<CancellationToken>,
}

impl CommitBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a stream commit to the batch.
    pub fn push(&mut self, commit: StreamCommit) {
        self.commits.push(commit);
    }

    /// Attaches a cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Total number of events across all streams.
    pub fn event_count(&self) -> usize {
        self.commits.iter().map(|c| c.events.len()).sum()
    }

    /// Fails with `Cancelled` if the attached token has fired.
    pub fn ensure_not_cancelled(&self) -> Result<()> {
        match &self.cancellation {
            Some(token) if token.is_cancelled() => Err(EventStoreError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Validates the batch before any store work happens.
    ///
    /// Every commit must carry at least one event, expected versions cannot be
    /// negative, and a stream may appear at most once per batch.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.commits.len());
        for commit in &self.commits {
            if commit.events.is_empty() {
                return Err(EventStoreError::InvalidAppend(format!(
                    "Cannot append empty event list to {}",
                    commit.aggregate_id
                )));
            }
            if commit.expected_version < Version::initial() {
                return Err(EventStoreError::InvalidAppend(format!(
                    "Negative expected version {} for {}",
                    commit.expected_version, commit.aggregate_id
                )));
            }
            if !seen.insert(&commit.aggregate_id) {
                return Err(EventStoreError::InvalidAppend(format!(
                    "Aggregate {} appears more than once in one batch",
                    commit.aggregate_id
                )));
            }
        }
        Ok(())
    }
}

/// A feed of events across all aggregates.
///
/// Each stream's events appear in version order. Across streams the order is
/// the store's insertion sequence, which need not match the order in which
/// concurrent commits became visible.
pub type EventFeed = Pin<Box<dyn Stream<Item = Result<EventEnvelope>> + Send>>;

/// Core trait for event store implementations.
///
/// An event store is an append-only log per aggregate. The backing
/// technology is injected by choosing an implementation; aggregates,
/// repositories and buses only see this trait.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically appends every commit of the batch.
    ///
    /// Each stream's current version must equal its commit's
    /// `expected_version`, otherwise the whole batch fails with
    /// `ConcurrencyConflict` and nothing is written. Accepted events receive
    /// versions `expected+1 ..= expected+n` in the given order.
    ///
    /// Returns the sealed envelopes in batch order.
    async fn commit(&self, batch: CommitBatch) -> Result<Vec<EventEnvelope>>;

    /// Retrieves the full history of an aggregate.
    ///
    /// Fails with `AggregateNotFound` if no stream exists.
    async fn load(&self, aggregate_id: &AggregateId) -> Result<EventStream>;

    /// Retrieves the events strictly after `version`.
    ///
    /// Returns an empty stream if the aggregate has nothing newer, including
    /// when it does not exist at all.
    async fn load_since(&self, aggregate_id: &AggregateId, version: Version)
    -> Result<EventStream>;

    /// Gets the current version of an aggregate, `Version::initial()` when absent.
    async fn current_version(&self, aggregate_id: &AggregateId) -> Result<Version>;

    /// Retrieves events by type across all aggregates, in feed order.
    async fn get_events_by_type(&self, event_type: &str) -> Result<Vec<EventEnvelope>>;

    /// Streams every event in the store. See [`EventFeed`] for the ordering.
    async fn stream_all_events(&self) -> Result<EventFeed>;

    /// Appends events to a single stream under an optimistic version check.
    async fn append(
        &self,
        aggregate_id: &AggregateId,
        events: Vec<NewEvent>,
        options: AppendOptions,
    ) -> Result<Vec<EventEnvelope>> {
        let mut batch = CommitBatch {
            commits: Vec::with_capacity(1),
            cancellation: options.cancellation,
        };
        batch.push(StreamCommit::new(
            aggregate_id.clone(),
            options.expected_version,
            events,
        ));
        self.commit(batch).await
    }

    /// Checks if an aggregate exists (has any events).
    async fn aggregate_exists(&self, aggregate_id: &AggregateId) -> Result<bool> {
        Ok(self.current_version(aggregate_id).await? > Version::initial())
    }
}

#[async_trait]
impl<T: EventStore + ?Sized> EventStore for Arc<T> {
    async fn commit(&self, batch: CommitBatch) -> Result<Vec<EventEnvelope>> {
        (**self).commit(batch).await
    }

    async fn load(&self, aggregate_id: &AggregateId) -> Result<EventStream> {
        (**self).load(aggregate_id).await
    }

    async fn load_since(
        &self,
        aggregate_id: &AggregateId,
        version: Version,
    ) -> Result<EventStream> {
        (**self).load_since(aggregate_id, version).await
    }

    async fn current_version(&self, aggregate_id: &AggregateId) -> Result<Version> {
        (**self).current_version(aggregate_id).await
    }

    async fn get_events_by_type(&self, event_type: &str) -> Result<Vec<EventEnvelope>> {
        (**self).get_events_by_type(event_type).await
    }

    async fn stream_all_events(&self) -> Result<EventFeed> {
        (**self).stream_all_events().await
    }
}
