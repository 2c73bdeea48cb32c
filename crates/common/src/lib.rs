//! Shared types for the event-sourced aggregate runtime.

mod types;

pub use types::AggregateId;
