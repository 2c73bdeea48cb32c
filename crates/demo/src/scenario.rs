//! The walkthrough itself: commands, contention, projections and catch-up.

use std::sync::Arc;

use common::AggregateId;
use event_bus::{AsyncEventBus, HandlerError, handler_fn};
use event_store::EventStore;
use futures_util::future::join_all;
use projections::{AggregateIndexView, ProjectionHandler, ProjectionProcessor, ReadModel};

use crate::config::Config;
use crate::error::{DemoError, Result};
use crate::service::PetService;

/// What a walkthrough did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Pets registered in this run.
    pub pets: usize,
    /// Events seen by catch-up, including any from earlier runs.
    pub events_replayed: u64,
    /// Commands refused by business rules.
    pub commands_rejected: usize,
    /// Failures reported by async handlers.
    pub handler_failures: usize,
}

/// Runs the walkthrough against `store`.
///
/// Pet ids are fresh on every run so the same database can be reused.
#[tracing::instrument(skip_all, fields(workers = config.bus.workers))]
pub async fn run<S>(store: S, config: &Config) -> Result<Report>
where
    S: EventStore + Clone + 'static,
{
    let bus = Arc::new(AsyncEventBus::new(config.bus.clone()));
    let live = AggregateIndexView::new();
    bus.subscribe_all(ProjectionHandler::new(Arc::new(live.clone())))
        .await;
    bus.subscribe(
        "PetArchived",
        handler_fn("archive-notifier", |event| async move {
            tracing::info!(pet_id = %event.aggregate_id, "Owner notified of archived pet");
            Ok::<_, HandlerError>(())
        }),
    )
    .await;

    let service =
        PetService::new(store.clone(), config.max_retries).with_publisher(bus.clone());

    let rex = AggregateId::new();
    let bella = AggregateId::new();
    let milo = AggregateId::new();
    service.register(&rex, "owner-1", "Rex", "dog").await?;
    service.register(&bella, "owner-1", "Bella", "cat").await?;
    service.register(&milo, "owner-2", "Milo", "rabbit").await?;
    tracing::info!("Registered three pets");

    // Concurrent weigh-ins on one pet race on the same expected version.
    let weigh_ins = join_all((1..=5u32).map(|i| service.weigh(&rex, 3000 + i * 10))).await;
    for outcome in weigh_ins {
        outcome?;
    }
    let rex_state = service.get(&rex).await?;
    tracing::info!(weighings = rex_state.weighings, "Concurrent weigh-ins settled");

    service.rename(&bella, "Luna").await?;
    service.archive(&milo).await?;

    let mut commands_rejected = 0;
    for outcome in [
        service.rename(&bella, "  ").await,
        service.weigh(&milo, 900).await,
    ] {
        if let Err(err) = outcome {
            tracing::info!(error = %err, "Command rejected");
            commands_rejected += 1;
        }
    }

    bus.wait().await?;
    let failures = bus.drain_errors().await;
    for failure in &failures {
        tracing::warn!(%failure, "Handler failure");
    }
    tracing::info!(indexed = ReadModel::count(&live), "Live projection drained");

    // Workers may hand over a stream's events out of order; the live view
    // left those for catch-up.
    let mut live_catch_up = ProjectionProcessor::new(store.clone());
    live_catch_up.register(Arc::new(live.clone()));
    live_catch_up.run_catch_up().await?;

    // A read model rebuilt from the store must match the live one.
    let rebuilt = AggregateIndexView::new();
    let mut processor = ProjectionProcessor::new(store);
    processor.register(Arc::new(rebuilt.clone()));
    let events_replayed = processor.run_catch_up().await?;

    for id in [&rex, &bella, &milo] {
        let live_version = live.get(id).await.map(|s| s.version);
        let rebuilt_version = rebuilt.get(id).await.map(|s| s.version);
        if live_version != rebuilt_version {
            return Err(DemoError::Mismatch(format!(
                "{id}: live {live_version:?}, rebuilt {rebuilt_version:?}"
            )));
        }
    }

    bus.shutdown().await?;

    Ok(Report {
        pets: live.by_type("Pet").await.len(),
        events_replayed,
        commands_rejected,
        handler_failures: failures.len(),
    })
}
