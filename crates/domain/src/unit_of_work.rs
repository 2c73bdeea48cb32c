//! Transactional scope over one or more repositories.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use event_bus::{BusError, EventPublisher};
use event_store::{CancellationToken, CommitBatch, EventEnvelope, EventStore};

use crate::aggregate::AggregateState;
use crate::codec::{EventCodec, JsonCodec};
use crate::error::{DomainError, Result};
use crate::repository::{Repository, Scope, ScopedRepository};

struct Registered {
    key: TypeId,
    any: Arc<dyn Any + Send + Sync>,
    scoped: Arc<dyn ScopedRepository>,
}

/// Result of a successful commit.
#[derive(Debug)]
pub struct CommitReceipt {
    /// Sealed envelopes in commit order.
    pub events: Vec<EventEnvelope>,
    /// Set when handing the events to the bus failed. The events are
    /// durable regardless.
    pub publish_error: Option<BusError>,
}

impl CommitReceipt {
    pub fn is_fully_published(&self) -> bool {
        self.publish_error.is_none()
    }
}

/// Coordinates one command's writes across repositories.
///
/// ```ignore
/// let uow = UnitOfWork::new(store.clone()).with_publisher(bus.clone());
/// uow.begin()?;
/// let pets = uow.repository::<Pet>()?;
/// let pet = pets.get_by_id(&pet_id).await?;
/// pet.lock().await.handle(|state| state.rename("Rex"))?;
/// pets.save(&pet).await?;
/// let receipt = uow.commit(None).await?;
/// ```
///
/// While a scope is open, every repository handed out by this unit of work
/// stages its saves. `commit` appends all staged events as one atomic batch
/// and only then publishes them. Dropping a unit of work with an open scope
/// rolls it back.
pub struct UnitOfWork<Store> {
    store: Store,
    publisher: Option<Arc<dyn EventPublisher>>,
    scope: Arc<Scope>,
    repositories: StdMutex<Vec<Registered>>,
    closed: AtomicBool,
}

impl<Store> UnitOfWork<Store>
where
    Store: EventStore + Clone + 'static,
{
    pub fn new(store: Store) -> Self {
        Self {
            store,
            publisher: None,
            scope: Arc::new(Scope::default()),
            repositories: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Publishes committed events through `publisher`.
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    fn registry(&self) -> MutexGuard<'_, Vec<Registered>> {
        self.repositories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_not_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DomainError::InvalidState(
                "unit of work is closed".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.scope.is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Opens the transactional scope.
    ///
    /// Fails with `InvalidState` if a scope is already open or the unit of
    /// work is closed.
    pub fn begin(&self) -> Result<()> {
        self.ensure_not_closed()?;
        if !self.scope.open() {
            return Err(DomainError::InvalidState(
                "a scope is already open".to_string(),
            ));
        }
        tracing::debug!("Unit of work scope opened");
        Ok(())
    }

    /// Returns this unit of work's repository for `S`, creating it on first
    /// use.
    pub fn repository<S: AggregateState>(&self) -> Result<Arc<Repository<S, Store>>> {
        self.repository_with_codec::<S, JsonCodec>(JsonCodec)
    }

    /// Like [`repository`](Self::repository) with a custom codec.
    ///
    /// The codec is only used when the repository is created. Asking for
    /// the same aggregate type with a different codec type fails with
    /// `InvalidState`.
    pub fn repository_with_codec<S, C>(&self, codec: C) -> Result<Arc<Repository<S, Store, C>>>
    where
        S: AggregateState,
        C: EventCodec<S::Event>,
    {
        self.ensure_not_closed()?;
        let key = TypeId::of::<S>();
        let mut registry = self.registry();

        if let Some(entry) = registry.iter().find(|entry| entry.key == key) {
            return Arc::clone(&entry.any)
                .downcast::<Repository<S, Store, C>>()
                .map_err(|_| {
                    DomainError::InvalidState(format!(
                        "{} repository already uses a different codec",
                        S::aggregate_type()
                    ))
                });
        }

        let repository = Arc::new(Repository::scoped(
            self.store.clone(),
            codec,
            Arc::clone(&self.scope),
        ));
        registry.push(Registered {
            key,
            any: repository.clone(),
            scoped: repository.clone(),
        });
        tracing::trace!(aggregate_type = S::aggregate_type(), "Repository created");
        Ok(repository)
    }

    fn scoped_repositories(&self) -> Vec<Arc<dyn ScopedRepository>> {
        self.registry()
            .iter()
            .map(|entry| Arc::clone(&entry.scoped))
            .collect()
    }

    /// Appends every staged aggregate as one batch, then publishes.
    ///
    /// If the append fails, buffers stay untouched and the scope stays open;
    /// the caller should roll back and retry the command from scratch. The
    /// rollback empties every identity map, so the retry replays current
    /// history.
    /// Publication failures do not undo the commit and are reported in the
    /// receipt.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn commit(&self, cancel: Option<&CancellationToken>) -> Result<CommitReceipt> {
        if !self.scope.is_open() {
            return Err(DomainError::InvalidState(
                "commit called without an open scope".to_string(),
            ));
        }

        let repositories = self.scoped_repositories();
        let mut prepared = Vec::with_capacity(repositories.len());
        for repository in &repositories {
            prepared.push(repository.prepare().await?);
        }

        let mut batch = CommitBatch::new();
        for writes in &mut prepared {
            for commit in writes.commits.drain(..) {
                batch.push(commit);
            }
        }
        if let Some(token) = cancel {
            batch = batch.with_cancellation(token.clone());
        }

        let sealed = if batch.is_empty() {
            Vec::new()
        } else {
            let streams = batch.commits.len();
            match self.store.commit(batch).await {
                Ok(sealed) => sealed,
                Err(err) => {
                    metrics::counter!("unit_of_work_commit_failures_total").increment(1);
                    tracing::warn!(streams, error = %err, "Unit of work commit failed");
                    return Err(err.into());
                }
            }
        };

        for writes in prepared {
            writes.finalize();
        }
        for repository in &repositories {
            repository.clear_staged();
        }
        self.scope.close();

        metrics::counter!("unit_of_work_commits_total").increment(1);
        tracing::debug!(events = sealed.len(), "Unit of work committed");

        let publish_error = match &self.publisher {
            Some(publisher) if !sealed.is_empty() => {
                publisher.publish_committed(&sealed, cancel).await.err()
            }
            _ => None,
        };
        if let Some(err) = &publish_error {
            metrics::counter!("unit_of_work_publish_failures_total").increment(1);
            tracing::warn!(error = %err, "Committed events were not fully published");
        }

        Ok(CommitReceipt {
            events: sealed,
            publish_error,
        })
    }

    /// Discards every staged write and closes the scope.
    ///
    /// Staged aggregates return to their last committed state. Nothing is
    /// published.
    pub fn rollback(&self) -> Result<()> {
        if !self.scope.close() {
            return Err(DomainError::InvalidState(
                "rollback called without an open scope".to_string(),
            ));
        }
        self.discard();
        Ok(())
    }

    fn discard(&self) {
        let discarded: usize = self
            .scoped_repositories()
            .iter()
            .map(|repository| repository.discard_staged())
            .sum();
        metrics::counter!("unit_of_work_rollbacks_total").increment(1);
        tracing::debug!(discarded, "Unit of work rolled back");
    }

    /// Closes the unit of work, rolling back an open scope. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.scope.close() {
            self.discard();
        }
    }
}

impl<Store> Drop for UnitOfWork<Store> {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.scope.close() {
            let repositories = self
                .repositories
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner);
            for entry in repositories.iter() {
                entry.scoped.discard_staged();
            }
            tracing::debug!("Unit of work dropped with an open scope, rolled back");
        }
    }
}
