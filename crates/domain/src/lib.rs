//! Domain layer for the event-sourcing runtime.
//!
//! This crate provides the core domain abstractions including:
//! - [`Aggregate`] root generic over an [`AggregateState`] with a closed event enum
//! - [`EventCodec`] adapters mapping events to stored records
//! - [`Repository`] with an identity map, built from an event store and a codec
//! - [`UnitOfWork`] binding repositories into one atomic commit followed by
//!   event publication

pub mod aggregate;
pub mod codec;
pub mod error;
pub mod repository;
pub mod unit_of_work;

pub use aggregate::{Aggregate, AggregateState, DomainEvent};
pub use codec::{EventCodec, JsonCodec};
pub use error::{DomainError, Result};
pub use repository::{AggregateHandle, Repository, SaveOutcome};
pub use unit_of_work::{CommitReceipt, UnitOfWork};
