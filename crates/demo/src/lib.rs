//! End-to-end walkthrough of the event-sourcing runtime.
//!
//! Wires a [`Pet`](pet::Pet) aggregate to an event store, an async event
//! bus, a projection and units of work, with structured logging (tracing)
//! and Prometheus metrics.

pub mod config;
pub mod error;
pub mod pet;
pub mod scenario;
pub mod service;

pub use config::Config;
pub use error::{DemoError, Result};
pub use pet::{Pet, PetError, PetEvent};
pub use scenario::{Report, run};
pub use service::PetService;
