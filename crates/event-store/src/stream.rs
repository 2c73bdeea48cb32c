use crate::{AggregateId, EventEnvelope, Version};

/// The ordered events of a single aggregate.
///
/// Events are sorted by version. A full stream satisfies
/// `events[i].version == i + 1`; a suffix returned by `load_since` starts
/// right after the requested version.
#[derive(Debug, Clone, PartialEq)]
pub struct EventStream {
    aggregate_id: AggregateId,
    events: Vec<EventEnvelope>,
}

impl EventStream {
    /// Wraps already ordered events of one aggregate.
    pub fn new(aggregate_id: AggregateId, events: Vec<EventEnvelope>) -> Self {
        Self {
            aggregate_id,
            events,
        }
    }

    /// Returns the aggregate this stream belongs to.
    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    /// Returns the events in version order.
    pub fn events(&self) -> &[EventEnvelope] {
        &self.events
    }

    /// Returns the version of the last event, or `Version::initial()` when empty.
    pub fn version(&self) -> Version {
        self.events
            .last()
            .map(|e| e.version)
            .unwrap_or(Version::initial())
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns true if versions run `first, first+1, ...` without gaps.
    pub fn is_contiguous(&self) -> bool {
        self.events
            .windows(2)
            .all(|pair| pair[1].version == pair[0].version.next())
    }
}

impl IntoIterator for EventStream {
    type Item = EventEnvelope;
    type IntoIter = std::vec::IntoIter<EventEnvelope>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

impl<'a> IntoIterator for &'a EventStream {
    type Item = &'a EventEnvelope;
    type IntoIter = std::slice::Iter<'a, EventEnvelope>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}
