//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p event-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use event_store::{
    AggregateId, AppendOptions, CommitBatch, EventStore, EventStoreError, NewEvent,
    PostgresEventStore, StreamCommit, Version,
};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            PostgresEventStore::new(temp_pool.clone())
                .run_migrations()
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresEventStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE events")
        .execute(&pool)
        .await
        .unwrap();

    PostgresEventStore::new(pool)
}

fn create_test_event(event_type: &str) -> NewEvent {
    NewEvent::new("TestAggregate", event_type, serde_json::json!({"test": true}))
}

#[tokio::test]
async fn append_and_load_events() {
    let store = get_test_store().await;
    let aggregate_id = AggregateId::new();

    let sealed = store
        .append(
            &aggregate_id,
            vec![create_test_event("TestEvent")],
            AppendOptions::expect_new(),
        )
        .await
        .unwrap();
    assert_eq!(sealed[0].version, Version::first());

    let stream = store.load(&aggregate_id).await.unwrap();
    assert_eq!(stream.len(), 1);
    assert_eq!(stream.events()[0].event_type, "TestEvent");
    assert_eq!(stream.events()[0].version, Version::first());
}

#[tokio::test]
async fn append_multiple_events_atomically() {
    let store = get_test_store().await;
    let aggregate_id = AggregateId::new();

    store
        .append(
            &aggregate_id,
            vec![
                create_test_event("Event1"),
                create_test_event("Event2"),
                create_test_event("Event3"),
            ],
            AppendOptions::expect_new(),
        )
        .await
        .unwrap();

    let stream = store.load(&aggregate_id).await.unwrap();
    assert_eq!(stream.len(), 3);
    assert!(stream.is_contiguous());
    assert_eq!(stream.version(), Version::new(3));
}

#[tokio::test]
async fn optimistic_concurrency_conflict() {
    let store = get_test_store().await;
    let aggregate_id = AggregateId::new();

    store
        .append(
            &aggregate_id,
            vec![create_test_event("Event1")],
            AppendOptions::expect_new(),
        )
        .await
        .unwrap();

    let result = store
        .append(
            &aggregate_id,
            vec![create_test_event("Event2")],
            AppendOptions::expect_new(),
        )
        .await;

    assert!(matches!(
        result,
        Err(EventStoreError::ConcurrencyConflict { .. })
    ));
    assert_eq!(
        store.current_version(&aggregate_id).await.unwrap(),
        Version::first()
    );
}

#[tokio::test]
async fn load_missing_aggregate_is_not_found() {
    let store = get_test_store().await;
    let result = store.load(&AggregateId::from("missing")).await;
    assert!(matches!(result, Err(EventStoreError::AggregateNotFound(_))));
}

#[tokio::test]
async fn load_since_returns_suffix() {
    let store = get_test_store().await;
    let aggregate_id = AggregateId::new();

    store
        .append(
            &aggregate_id,
            vec![
                create_test_event("Event1"),
                create_test_event("Event2"),
                create_test_event("Event3"),
            ],
            AppendOptions::expect_new(),
        )
        .await
        .unwrap();

    let suffix = store
        .load_since(&aggregate_id, Version::first())
        .await
        .unwrap();
    assert_eq!(suffix.len(), 2);
    assert_eq!(suffix.events()[0].version, Version::new(2));
}

#[tokio::test]
async fn batch_commit_rolls_back_on_conflict() {
    let store = get_test_store().await;
    let a = AggregateId::new();
    let b = AggregateId::new();

    store
        .append(&b, vec![create_test_event("Created")], AppendOptions::expect_new())
        .await
        .unwrap();

    let mut batch = CommitBatch::new();
    batch.push(StreamCommit::new(
        a.clone(),
        Version::initial(),
        vec![create_test_event("Created")],
    ));
    batch.push(StreamCommit::new(
        b.clone(),
        Version::initial(),
        vec![create_test_event("Created")],
    ));

    assert!(store.commit(batch).await.is_err());
    assert_eq!(store.current_version(&a).await.unwrap(), Version::initial());
    assert_eq!(store.current_version(&b).await.unwrap(), Version::first());
}

#[tokio::test]
async fn concurrent_appends_have_single_winner() {
    let store = get_test_store().await;
    let aggregate_id = AggregateId::new();

    store
        .append(
            &aggregate_id,
            vec![create_test_event("Created")],
            AppendOptions::expect_new(),
        )
        .await
        .unwrap();

    let (left, right) = tokio::join!(
        store.append(
            &aggregate_id,
            vec![create_test_event("Updated")],
            AppendOptions::expect_version(Version::first()),
        ),
        store.append(
            &aggregate_id,
            vec![create_test_event("Updated")],
            AppendOptions::expect_version(Version::first()),
        ),
    );

    let outcomes = [left.is_ok(), right.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    assert_eq!(
        store.current_version(&aggregate_id).await.unwrap(),
        Version::new(2)
    );
}

#[tokio::test]
async fn get_events_by_type() {
    let store = get_test_store().await;
    let id1 = AggregateId::new();
    let id2 = AggregateId::new();

    store
        .append(&id1, vec![create_test_event("Created")], AppendOptions::expect_new())
        .await
        .unwrap();
    store
        .append(&id2, vec![create_test_event("Shipped")], AppendOptions::expect_new())
        .await
        .unwrap();

    assert_eq!(store.get_events_by_type("Created").await.unwrap().len(), 1);
    assert_eq!(store.get_events_by_type("Shipped").await.unwrap().len(), 1);
}

#[tokio::test]
async fn stream_all_events_in_commit_order() {
    use futures_util::StreamExt;

    let store = get_test_store().await;
    let id1 = AggregateId::new();
    let id2 = AggregateId::new();

    store
        .append(&id1, vec![create_test_event("Event1")], AppendOptions::expect_new())
        .await
        .unwrap();
    store
        .append(&id2, vec![create_test_event("Event2")], AppendOptions::expect_new())
        .await
        .unwrap();

    let feed = store.stream_all_events().await.unwrap();
    let events: Vec<_> = feed.collect().await;
    let types: Vec<_> = events
        .into_iter()
        .map(|e| e.unwrap().event_type)
        .collect();
    assert_eq!(types, vec!["Event1", "Event2"]);
}

#[tokio::test]
async fn event_metadata_preserved() {
    let store = get_test_store().await;
    let aggregate_id = AggregateId::new();

    let event = create_test_event("TestEvent")
        .metadata("correlation_id", serde_json::json!("corr-123"))
        .metadata("user_id", serde_json::json!("user-456"));

    store
        .append(&aggregate_id, vec![event], AppendOptions::expect_new())
        .await
        .unwrap();

    let stream = store.load(&aggregate_id).await.unwrap();
    let stored = &stream.events()[0];
    assert_eq!(
        stored.metadata.get("correlation_id"),
        Some(&serde_json::json!("corr-123"))
    );
    assert_eq!(
        stored.metadata.get("user_id"),
        Some(&serde_json::json!("user-456"))
    );
}
