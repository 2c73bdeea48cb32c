//! Generic event-sourced repository with an identity map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use common::AggregateId;
use event_store::{
    AppendOptions, EventEnvelope, EventStore, EventStoreError, NewEvent, StreamCommit,
};
use tokio::sync::Mutex;

use crate::aggregate::{Aggregate, AggregateState};
use crate::codec::{EventCodec, JsonCodec};
use crate::error::{DomainError, Result};

/// Shared handle to an aggregate tracked by a repository.
///
/// Every `get_by_id` for the same id on the same repository returns a handle
/// to the same instance.
pub struct AggregateHandle<S: AggregateState> {
    id: AggregateId,
    inner: Arc<Mutex<Aggregate<S>>>,
}

impl<S: AggregateState> Clone for AggregateHandle<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: AggregateState> AggregateHandle<S> {
    fn new(aggregate: Aggregate<S>) -> Self {
        Self {
            id: aggregate.id().clone(),
            inner: Arc::new(Mutex::new(aggregate)),
        }
    }

    pub fn id(&self) -> &AggregateId {
        &self.id
    }

    /// Locks the aggregate for reading or mutation.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Aggregate<S>> {
        self.inner.lock().await
    }

    /// Clones the aggregate as it currently is.
    pub async fn snapshot(&self) -> Aggregate<S> {
        self.inner.lock().await.clone()
    }

    /// Whether both handles point at the same tracked instance.
    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<S: AggregateState> std::fmt::Debug for AggregateHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateHandle")
            .field("aggregate_type", &S::aggregate_type())
            .field("id", &self.id)
            .finish()
    }
}

/// What `save` did with an aggregate.
#[derive(Debug)]
pub enum SaveOutcome {
    /// Nothing was buffered.
    Unchanged,
    /// Buffered events were staged in the open unit-of-work scope.
    Staged { pending: usize },
    /// Buffered events were appended; the sealed envelopes are returned.
    Committed(Vec<EventEnvelope>),
}

impl SaveOutcome {
    pub fn committed_events(&self) -> &[EventEnvelope] {
        match self {
            SaveOutcome::Committed(events) => events,
            SaveOutcome::Unchanged | SaveOutcome::Staged { .. } => &[],
        }
    }
}

/// Open/closed flag shared by a unit of work and the repositories it hands out.
#[derive(Debug, Default)]
pub(crate) struct Scope {
    open: AtomicBool,
}

impl Scope {
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Opens the scope, returning false if it was already open.
    pub(crate) fn open(&self) -> bool {
        !self.open.swap(true, Ordering::AcqRel)
    }

    /// Closes the scope, returning whether it was open.
    pub(crate) fn close(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }
}

struct Tracked<S: AggregateState> {
    identity_map: HashMap<AggregateId, AggregateHandle<S>>,
    staged: Vec<AggregateId>,
}

impl<S: AggregateState> Default for Tracked<S> {
    fn default() -> Self {
        Self {
            identity_map: HashMap::new(),
            staged: Vec::new(),
        }
    }
}

/// Loads and saves one aggregate type through an [`EventStore`].
///
/// Outside a unit of work, `save` appends immediately at the aggregate's
/// committed version. Inside one, `save` only stages the aggregate; the unit
/// of work appends every staged aggregate in a single batch on commit.
pub struct Repository<S: AggregateState, Store, C = JsonCodec> {
    store: Store,
    codec: C,
    scope: Option<Arc<Scope>>,
    tracked: StdMutex<Tracked<S>>,
}

impl<S, Store> Repository<S, Store, JsonCodec>
where
    S: AggregateState,
    Store: EventStore,
{
    /// Creates a standalone repository using the JSON codec.
    pub fn new(store: Store) -> Self {
        Self::with_codec(store, JsonCodec)
    }
}

impl<S, Store, C> Repository<S, Store, C>
where
    S: AggregateState,
    Store: EventStore,
    C: EventCodec<S::Event>,
{
    /// Creates a standalone repository with a custom codec.
    pub fn with_codec(store: Store, codec: C) -> Self {
        Self {
            store,
            codec,
            scope: None,
            tracked: StdMutex::new(Tracked::default()),
        }
    }

    pub(crate) fn scoped(store: Store, codec: C, scope: Arc<Scope>) -> Self {
        Self {
            scope: Some(scope),
            ..Self::with_codec(store, codec)
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Whether saves are currently staged in an open unit-of-work scope.
    pub fn is_bound(&self) -> bool {
        self.scope.as_ref().is_some_and(|scope| scope.is_open())
    }

    fn tracked(&self) -> MutexGuard<'_, Tracked<S>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the tracked aggregate, replaying it from the store on first
    /// access.
    ///
    /// Fails with `NotFound` when the aggregate has no stream.
    #[tracing::instrument(skip(self), fields(aggregate_type = S::aggregate_type()))]
    pub async fn get_by_id(&self, aggregate_id: &AggregateId) -> Result<AggregateHandle<S>> {
        if let Some(handle) = self.tracked().identity_map.get(aggregate_id) {
            return Ok(handle.clone());
        }

        let aggregate = self.load(aggregate_id).await?;

        // Another task may have loaded the same aggregate meanwhile.
        let handle = self
            .tracked()
            .identity_map
            .entry(aggregate_id.clone())
            .or_insert_with(|| AggregateHandle::new(aggregate))
            .clone();
        Ok(handle)
    }

    /// Starts tracking a newly created aggregate.
    ///
    /// Fails with `InvalidState` if an aggregate with the same id is already
    /// tracked.
    pub fn track(&self, aggregate: Aggregate<S>) -> Result<AggregateHandle<S>> {
        let handle = AggregateHandle::new(aggregate);
        self.register(&handle)?;
        Ok(handle)
    }

    /// Persists the aggregate's buffered events.
    ///
    /// A save with an empty buffer is a no-op. On a concurrency conflict the
    /// aggregate is evicted from the identity map so the next `get_by_id`
    /// replays fresh history.
    #[tracing::instrument(
        skip(self, handle),
        fields(aggregate_type = S::aggregate_type(), aggregate_id = %handle.id())
    )]
    pub async fn save(&self, handle: &AggregateHandle<S>) -> Result<SaveOutcome> {
        let mut aggregate = handle.inner.lock().await;
        if !aggregate.has_uncommitted_events() {
            return Ok(SaveOutcome::Unchanged);
        }
        self.register(handle)?;

        let pending = aggregate.uncommitted_events().len();
        if self.is_bound() {
            let mut tracked = self.tracked();
            if !tracked.staged.contains(handle.id()) {
                tracked.staged.push(handle.id().clone());
            }
            tracing::debug!(pending, "Aggregate staged");
            return Ok(SaveOutcome::Staged { pending });
        }

        let events = self.encode(&aggregate)?;
        let options = AppendOptions::expect_version(aggregate.committed_version());
        match self.store.append(handle.id(), events, options).await {
            Ok(sealed) => {
                aggregate.mark_committed();
                tracing::debug!(version = %aggregate.version(), "Aggregate saved");
                Ok(SaveOutcome::Committed(sealed))
            }
            Err(err) => {
                if err.is_concurrency_conflict() {
                    self.evict(handle.id());
                }
                Err(err.into())
            }
        }
    }

    /// Stops tracking an aggregate.
    pub fn evict(&self, aggregate_id: &AggregateId) {
        let mut tracked = self.tracked();
        tracked.identity_map.remove(aggregate_id);
        tracked.staged.retain(|id| id != aggregate_id);
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked().identity_map.len()
    }

    pub fn staged_count(&self) -> usize {
        self.tracked().staged.len()
    }

    fn register(&self, handle: &AggregateHandle<S>) -> Result<()> {
        let mut tracked = self.tracked();
        match tracked.identity_map.get(handle.id()) {
            Some(existing) if existing.same_instance(handle) => Ok(()),
            Some(_) => Err(DomainError::InvalidState(format!(
                "another instance of {} {} is already tracked",
                S::aggregate_type(),
                handle.id()
            ))),
            None => {
                tracked
                    .identity_map
                    .insert(handle.id().clone(), handle.clone());
                Ok(())
            }
        }
    }

    async fn load(&self, aggregate_id: &AggregateId) -> Result<Aggregate<S>> {
        let stream = self.store.load(aggregate_id).await.map_err(|err| match err {
            EventStoreError::AggregateNotFound(id) => DomainError::NotFound {
                aggregate_type: S::aggregate_type(),
                aggregate_id: id,
            },
            other => DomainError::EventStore(other),
        })?;

        let events = stream
            .events()
            .iter()
            .map(|envelope| self.codec.decode(&envelope.event_type, &envelope.payload))
            .collect::<Result<Vec<_>>>()?;

        Aggregate::reconstruct(aggregate_id.clone(), events)
    }

    fn encode(&self, aggregate: &Aggregate<S>) -> Result<Vec<NewEvent>> {
        aggregate
            .uncommitted_events()
            .iter()
            .map(|event| {
                let (event_type, payload) = self.codec.encode(event)?;
                Ok(NewEvent::new(S::aggregate_type(), event_type, payload))
            })
            .collect()
    }
}

/// Staged writes of one repository, ready for a batch commit.
pub(crate) struct PreparedWrites {
    pub(crate) commits: Vec<StreamCommit>,
    finalize: Box<dyn FnOnce() + Send>,
}

impl PreparedWrites {
    /// Marks every prepared aggregate committed and releases it.
    pub(crate) fn finalize(self) {
        (self.finalize)();
    }
}

/// Type-erased view of a scoped repository, used by the unit of work.
#[async_trait]
pub(crate) trait ScopedRepository: Send + Sync {
    fn aggregate_type(&self) -> &'static str;

    /// Encodes staged aggregates and holds their locks until the returned
    /// writes are finalized or dropped.
    async fn prepare(&self) -> Result<PreparedWrites>;

    /// Forgets staged ids after a successful commit.
    fn clear_staged(&self);

    /// Restores staged aggregates to their committed state and forgets every
    /// tracked aggregate. Returns how many staged aggregates were discarded.
    fn discard_staged(&self) -> usize;
}

#[async_trait]
impl<S, Store, C> ScopedRepository for Repository<S, Store, C>
where
    S: AggregateState,
    Store: EventStore + 'static,
    C: EventCodec<S::Event>,
{
    fn aggregate_type(&self) -> &'static str {
        S::aggregate_type()
    }

    async fn prepare(&self) -> Result<PreparedWrites> {
        let handles: Vec<AggregateHandle<S>> = {
            let tracked = self.tracked();
            tracked
                .staged
                .iter()
                .filter_map(|id| tracked.identity_map.get(id).cloned())
                .collect()
        };

        let mut commits = Vec::with_capacity(handles.len());
        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            let aggregate = Arc::clone(&handle.inner).lock_owned().await;
            if !aggregate.has_uncommitted_events() {
                continue;
            }
            commits.push(StreamCommit::new(
                handle.id.clone(),
                aggregate.committed_version(),
                self.encode(&aggregate)?,
            ));
            guards.push(aggregate);
        }

        Ok(PreparedWrites {
            commits,
            finalize: Box::new(move || {
                for mut aggregate in guards {
                    aggregate.mark_committed();
                }
            }),
        })
    }

    fn clear_staged(&self) {
        self.tracked().staged.clear();
    }

    fn discard_staged(&self) -> usize {
        let mut tracked = self.tracked();
        let staged = std::mem::take(&mut tracked.staged);

        for id in &staged {
            let Some(handle) = tracked.identity_map.get(id) else {
                continue;
            };
            match handle.inner.try_lock() {
                Ok(mut aggregate) => aggregate.discard_uncommitted(),
                Err(_) => tracing::warn!(
                    aggregate_type = S::aggregate_type(),
                    aggregate_id = %id,
                    "Aggregate locked during rollback, dropping without restoring"
                ),
            }
        }

        // Anything loaded in the scope may be behind the store now; the next
        // scope replays it.
        let forgotten = tracked.identity_map.len();
        tracked.identity_map.clear();
        tracing::trace!(
            aggregate_type = S::aggregate_type(),
            staged = staged.len(),
            forgotten,
            "Identity map cleared"
        );
        staged.len()
    }
}
