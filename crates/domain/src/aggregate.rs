//! Core aggregate and domain event traits.

use common::AggregateId;
use event_store::Version;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::DomainError;

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and should be named in past tense. Each aggregate
/// declares its events as one closed enum.
pub trait DomainEvent:
    Serialize + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync + 'static
{
    /// Returns the event type name.
    ///
    /// This is the `event_type` persisted with every record, so renaming a
    /// variant's type breaks replay of stored history.
    fn event_type(&self) -> &'static str;
}

/// State of an event-sourced aggregate.
///
/// `apply` must be pure and deterministic: given the same state and event
/// it always produces the same new state, has no side effects and cannot
/// fail (events represent facts that have already happened). Matching
/// exhaustively on `Self::Event` lets the compiler catch a forgotten
/// event kind.
pub trait AggregateState: Default + Clone + Send + Sync + 'static {
    /// The closed set of events this aggregate produces and consumes.
    type Event: DomainEvent;

    /// Returns the aggregate type name.
    fn aggregate_type() -> &'static str;

    /// Applies an event to the state.
    fn apply(&mut self, event: &Self::Event);
}

/// An aggregate root: identity, version and state derived from events.
///
/// The only way to change state is to [`raise`](Self::raise) an event. Raised
/// events sit in an uncommitted buffer until persistence reports a verified
/// append through [`mark_committed`](Self::mark_committed).
#[derive(Debug, Clone)]
pub struct Aggregate<S: AggregateState> {
    id: AggregateId,
    committed_version: Version,
    committed_state: S,
    state: S,
    uncommitted: Vec<S::Event>,
}

impl<S: AggregateState> Aggregate<S> {
    fn empty(id: AggregateId) -> Self {
        Self {
            id,
            committed_version: Version::initial(),
            committed_state: S::default(),
            state: S::default(),
            uncommitted: Vec::new(),
        }
    }

    /// Creates a new aggregate from its creation event.
    ///
    /// The result has version 1 and the creation event buffered.
    pub fn create(id: AggregateId, event: S::Event) -> Self {
        let mut aggregate = Self::empty(id);
        aggregate.raise(event);
        aggregate
    }

    /// Rebuilds an aggregate by folding its full history.
    ///
    /// Fails with `NotFound` when `events` is empty.
    pub fn reconstruct(
        id: AggregateId,
        events: impl IntoIterator<Item = S::Event>,
    ) -> Result<Self, DomainError> {
        let mut aggregate = Self::empty(id);
        let mut count = 0usize;
        for event in events {
            aggregate.state.apply(&event);
            count += 1;
        }

        if count == 0 {
            return Err(DomainError::NotFound {
                aggregate_type: S::aggregate_type(),
                aggregate_id: aggregate.id,
            });
        }

        aggregate.committed_version = Version::initial().advance(count);
        aggregate.committed_state = aggregate.state.clone();
        Ok(aggregate)
    }

    /// Applies a new event and buffers it for persistence.
    pub fn raise(&mut self, event: S::Event) {
        tracing::trace!(
            aggregate_type = S::aggregate_type(),
            aggregate_id = %self.id,
            event_type = event.event_type(),
            "Event raised"
        );
        self.state.apply(&event);
        self.uncommitted.push(event);
    }

    /// Runs a command decision against the current state and raises the
    /// events it returns.
    ///
    /// A rejected command raises nothing and leaves the aggregate unchanged.
    /// Returns the number of events raised.
    pub fn handle<F, E>(&mut self, decide: F) -> Result<usize, E>
    where
        F: FnOnce(&S) -> Result<Vec<S::Event>, E>,
    {
        let events = decide(&self.state)?;
        let raised = events.len();
        for event in events {
            self.raise(event);
        }
        Ok(raised)
    }

    pub fn id(&self) -> &AggregateId {
        &self.id
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    /// Count of every event applied, committed or not.
    pub fn version(&self) -> Version {
        self.committed_version.advance(self.uncommitted.len())
    }

    /// Version of the last durably stored event.
    ///
    /// This is the expected version for the next append.
    pub fn committed_version(&self) -> Version {
        self.committed_version
    }

    pub fn uncommitted_events(&self) -> &[S::Event] {
        &self.uncommitted
    }

    pub fn has_uncommitted_events(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Clears the buffer after a verified append.
    pub fn mark_committed(&mut self) {
        self.committed_version = self.version();
        self.committed_state = self.state.clone();
        self.uncommitted.clear();
    }

    /// Drops buffered events and restores the last committed state.
    pub fn discard_uncommitted(&mut self) {
        if self.uncommitted.is_empty() {
            return;
        }
        self.state = self.committed_state.clone();
        self.uncommitted.clear();
    }
}
