use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::{
    AggregateId, EventEnvelope, EventStoreError, EventStream, Result, Version,
    store::{CommitBatch, EventFeed, EventStore, StreamCommit},
};

type StreamHandle = Arc<Mutex<Vec<EventEnvelope>>>;

/// In-memory event store implementation.
///
/// Each aggregate stream sits behind its own mutex, so appends to different
/// aggregates never contend; the outer map lock is held only long enough to
/// look up or create a stream. A global log keeps commit order for feeds.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    streams: Arc<RwLock<HashMap<AggregateId, StreamHandle>>>,
    log: Arc<RwLock<Vec<EventEnvelope>>>,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.log.read().await.len()
    }

    /// Clears all streams.
    pub async fn clear(&self) {
        let mut streams = self.streams.write().await;
        let mut log = self.log.write().await;
        streams.clear();
        log.clear();
    }

    async fn existing_stream(&self, aggregate_id: &AggregateId) -> Option<StreamHandle> {
        self.streams.read().await.get(aggregate_id).cloned()
    }

    /// Drops streams a rejected batch created but never wrote to.
    ///
    /// A stream still referenced outside the map belongs to an in-flight
    /// commit and is kept.
    async fn prune_empty(&self, commits: &[StreamCommit]) {
        let mut streams = self.streams.write().await;
        for commit in commits {
            let unused = streams.get(&commit.aggregate_id).is_some_and(|handle| {
                Arc::strong_count(handle) == 1
                    && handle.try_lock().is_ok_and(|events| events.is_empty())
            });
            if unused {
                streams.remove(&commit.aggregate_id);
            }
        }
    }

    async fn stream_for_write(&self, aggregate_id: &AggregateId) -> StreamHandle {
        if let Some(handle) = self.existing_stream(aggregate_id).await {
            return handle;
        }
        self.streams
            .write()
            .await
            .entry(aggregate_id.clone())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[tracing::instrument(skip(self, batch), fields(streams = batch.commits.len()))]
    async fn commit(&self, batch: CommitBatch) -> Result<Vec<EventEnvelope>> {
        batch.validate()?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        batch.ensure_not_cancelled()?;

        let commits = batch.commits;

        let mut handles = Vec::with_capacity(commits.len());
        for commit in &commits {
            handles.push(self.stream_for_write(&commit.aggregate_id).await);
        }

        // Streams are locked in id order so concurrent batches touching the
        // same aggregates cannot deadlock.
        let mut lock_order: Vec<usize> = (0..commits.len()).collect();
        lock_order.sort_by(|&a, &b| commits[a].aggregate_id.cmp(&commits[b].aggregate_id));

        let mut guards: Vec<(usize, MutexGuard<'_, Vec<EventEnvelope>>)> =
            Vec::with_capacity(commits.len());
        for index in lock_order {
            guards.push((index, handles[index].lock().await));
        }
        guards.sort_by_key(|(index, _)| *index);

        let conflict = commits
            .iter()
            .zip(guards.iter())
            .find_map(|(commit, (_, stream))| {
                let actual = Version::initial().advance(stream.len());
                if actual == commit.expected_version {
                    return None;
                }
                Some(EventStoreError::ConcurrencyConflict {
                    aggregate_id: commit.aggregate_id.clone(),
                    expected: commit.expected_version,
                    actual,
                })
            });
        if let Some(err) = conflict {
            drop(guards);
            drop(handles);
            metrics::counter!("event_store_conflicts_total").increment(1);
            tracing::debug!(error = %err, "append rejected");
            self.prune_empty(&commits).await;
            return Err(err);
        }

        let mut sealed = Vec::new();
        for (commit, (_, stream)) in commits.into_iter().zip(guards.iter_mut()) {
            let mut version = commit.expected_version;
            for event in commit.events {
                version = version.next();
                let envelope = event.into_envelope(commit.aggregate_id.clone(), version);
                stream.push(envelope.clone());
                sealed.push(envelope);
            }
        }

        self.log.write().await.extend(sealed.iter().cloned());
        drop(guards);

        metrics::counter!("event_store_events_appended_total").increment(sealed.len() as u64);
        Ok(sealed)
    }

    async fn load(&self, aggregate_id: &AggregateId) -> Result<EventStream> {
        let Some(handle) = self.existing_stream(aggregate_id).await else {
            return Err(EventStoreError::AggregateNotFound(aggregate_id.clone()));
        };
        let events = handle.lock().await.clone();
        if events.is_empty() {
            return Err(EventStoreError::AggregateNotFound(aggregate_id.clone()));
        }
        Ok(EventStream::new(aggregate_id.clone(), events))
    }

    async fn load_since(
        &self,
        aggregate_id: &AggregateId,
        version: Version,
    ) -> Result<EventStream> {
        let events = match self.existing_stream(aggregate_id).await {
            Some(handle) => handle
                .lock()
                .await
                .iter()
                .filter(|e| e.version > version)
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        Ok(EventStream::new(aggregate_id.clone(), events))
    }

    async fn current_version(&self, aggregate_id: &AggregateId) -> Result<Version> {
        let version = match self.existing_stream(aggregate_id).await {
            Some(handle) => Version::initial().advance(handle.lock().await.len()),
            None => Version::initial(),
        };
        Ok(version)
    }

    async fn get_events_by_type(&self, event_type: &str) -> Result<Vec<EventEnvelope>> {
        let log = self.log.read().await;
        Ok(log
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect())
    }

    async fn stream_all_events(&self) -> Result<EventFeed> {
        use futures_util::stream;

        let events = self.log.read().await.clone();
        let stream = stream::iter(events.into_iter().map(Ok));
        Ok(Box::pin(stream))
    }
}
