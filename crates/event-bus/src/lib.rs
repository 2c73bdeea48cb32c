//! In-process publish/subscribe for committed events.
//!
//! Two delivery modes share one [`EventHandler`] contract:
//!
//! - [`SyncEventBus`] runs handlers on the publisher's task, in
//!   subscription order, and reports failures to the publisher.
//! - [`AsyncEventBus`] queues events for a worker pool and reports
//!   failures on an error channel.
//!
//! Buses only ever see events that are already durable.

pub mod async_bus;
pub mod config;
pub mod error;
pub mod handler;
pub mod publisher;
pub mod subscriptions;
pub mod sync_bus;

pub use async_bus::AsyncEventBus;
pub use config::BusConfig;
pub use error::{BusError, HandlerError, HandlerFailure, Result};
pub use handler::{EventHandler, FnHandler, handler_fn};
pub use publisher::EventPublisher;
pub use subscriptions::{SubscriptionTable, Topic};
pub use sync_bus::{FailurePolicy, SyncEventBus};
