//! Read models and projections fed by committed events.
//!
//! - [`Projection`] trait for processing events into read models
//! - [`ReadModel`] trait for query access to denormalized data
//! - [`ProjectionHandler`] to subscribe a projection to an event bus
//! - [`ProjectionProcessor`] for catch-up and rebuild from the event store
//! - [`AggregateIndexView`], a generic index of every aggregate seen

pub mod error;
pub mod handler;
pub mod processor;
pub mod projection;
pub mod read_model;
pub mod views;

pub use error::{ProjectionError, Result};
pub use handler::ProjectionHandler;
pub use processor::ProjectionProcessor;
pub use projection::{Delivery, Projection, ProjectionPosition};
pub use read_model::ReadModel;
pub use views::{AggregateIndexView, AggregateSummary};
