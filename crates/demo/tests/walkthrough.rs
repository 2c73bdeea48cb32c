//! Runs the full walkthrough against the in-memory store.

use demo::{Config, PetService, Report, run};
use event_bus::BusConfig;
use event_store::{EventStore, InMemoryEventStore};

#[tokio::test]
async fn walkthrough_completes_in_memory() {
    let store = InMemoryEventStore::new();
    let report = run(store.clone(), &Config::default()).await.unwrap();

    assert_eq!(
        report,
        Report {
            pets: 3,
            events_replayed: 10,
            commands_rejected: 2,
            handler_failures: 0,
        }
    );
    assert_eq!(store.event_count().await, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn walkthrough_with_single_worker_bus() {
    let config = Config {
        bus: BusConfig::default().with_workers(1).with_queue_capacity(2),
        ..Config::default()
    };
    let report = run(InMemoryEventStore::new(), &config).await.unwrap();
    assert_eq!(report.pets, 3);
    assert_eq!(report.handler_failures, 0);
}

#[tokio::test]
async fn repeated_runs_share_a_store() {
    let store = InMemoryEventStore::new();
    run(store.clone(), &Config::default()).await.unwrap();
    let second = run(store.clone(), &Config::default()).await.unwrap();

    // Catch-up sees both runs; the live index only this one.
    assert_eq!(second.events_replayed, 20);
    assert_eq!(second.pets, 3);

    let renamed = store.get_events_by_type("PetRenamed").await.unwrap();
    assert_eq!(renamed.len(), 2);

    let pets = PetService::new(store, 0);
    let luna = pets.get(&renamed[0].aggregate_id).await.unwrap();
    assert_eq!(luna.name, "Luna");
}
