//! Read model views built from committed events.

pub mod aggregate_index;

pub use aggregate_index::{AggregateIndexView, AggregateSummary};
