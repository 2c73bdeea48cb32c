use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, EventEnvelope, EventId, EventStoreError, EventStream, Result, Version,
    store::{CommitBatch, EventFeed, EventStore},
};

const SELECT_COLUMNS: &str =
    "id, event_type, aggregate_id, aggregate_type, version, occurred_at, payload, metadata";

/// PostgreSQL-backed event store implementation.
///
/// Every batch runs in one transaction. The explicit version check catches
/// stale writers early; the `unique_aggregate_version` constraint catches
/// writers that raced past the check concurrently.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL event store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_event(row: PgRow) -> Result<EventEnvelope> {
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata_json)?;

        Ok(EventEnvelope {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            event_type: row.try_get("event_type")?,
            aggregate_id: AggregateId::from(row.try_get::<String, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            version: Version::new(row.try_get("version")?),
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
            metadata,
        })
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[tracing::instrument(skip(self, batch), fields(streams = batch.commits.len()))]
    async fn commit(&self, batch: CommitBatch) -> Result<Vec<EventEnvelope>> {
        batch.validate()?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        batch.ensure_not_cancelled()?;

        let mut tx = self.pool.begin().await?;
        let mut sealed = Vec::with_capacity(batch.event_count());

        for commit in batch.commits {
            let aggregate_id = commit.aggregate_id;
            let expected = commit.expected_version;

            let current: Option<i64> =
                sqlx::query_scalar("SELECT MAX(version) FROM events WHERE aggregate_id = $1")
                    .bind(aggregate_id.as_str())
                    .fetch_one(&mut *tx)
                    .await?;
            let actual = Version::new(current.unwrap_or(0));

            if actual != expected {
                metrics::counter!("event_store_conflicts_total").increment(1);
                return Err(EventStoreError::ConcurrencyConflict {
                    aggregate_id,
                    expected,
                    actual,
                });
            }

            let mut version = expected;
            for event in commit.events {
                version = version.next();
                let envelope = event.into_envelope(aggregate_id.clone(), version);
                let metadata_json = serde_json::to_value(&envelope.metadata)?;

                sqlx::query(
                    r#"
                    INSERT INTO events (id, event_type, aggregate_id, aggregate_type, version, occurred_at, payload, metadata)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(envelope.event_id.as_uuid())
                .bind(&envelope.event_type)
                .bind(envelope.aggregate_id.as_str())
                .bind(&envelope.aggregate_type)
                .bind(envelope.version.as_i64())
                .bind(envelope.occurred_at)
                .bind(&envelope.payload)
                .bind(metadata_json)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    // A concurrent writer claimed this version between our check and insert.
                    if let sqlx::Error::Database(ref db_err) = e
                        && db_err.constraint() == Some("unique_aggregate_version")
                    {
                        metrics::counter!("event_store_conflicts_total").increment(1);
                        return EventStoreError::ConcurrencyConflict {
                            aggregate_id: aggregate_id.clone(),
                            expected,
                            actual: version,
                        };
                    }
                    EventStoreError::Database(e)
                })?;

                sealed.push(envelope);
            }
        }

        tx.commit().await?;

        metrics::counter!("event_store_events_appended_total").increment(sealed.len() as u64);
        Ok(sealed)
    }

    async fn load(&self, aggregate_id: &AggregateId) -> Result<EventStream> {
        let stream = self.load_since(aggregate_id, Version::initial()).await?;
        if stream.is_empty() {
            return Err(EventStoreError::AggregateNotFound(aggregate_id.clone()));
        }
        Ok(stream)
    }

    async fn load_since(
        &self,
        aggregate_id: &AggregateId,
        version: Version,
    ) -> Result<EventStream> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM events WHERE aggregate_id = $1 AND version > $2 ORDER BY version ASC"
        ))
        .bind(aggregate_id.as_str())
        .bind(version.as_i64())
        .fetch_all(&self.pool)
        .await?;

        let events = rows
            .into_iter()
            .map(Self::row_to_event)
            .collect::<Result<Vec<_>>>()?;
        Ok(EventStream::new(aggregate_id.clone(), events))
    }

    async fn current_version(&self, aggregate_id: &AggregateId) -> Result<Version> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE aggregate_id = $1")
                .bind(aggregate_id.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(Version::new(version.unwrap_or(0)))
    }

    async fn get_events_by_type(&self, event_type: &str) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM events WHERE event_type = $1 ORDER BY sequence ASC"
        ))
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn stream_all_events(&self) -> Result<EventFeed> {
        use futures_util::stream;

        // Materialized up front so the feed does not borrow the pool.
        // `sequence` is taken at insert time, so a transaction that commits
        // late can surface below events that were already visible. Per stream
        // it still follows version order.
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM events ORDER BY sequence ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        let stream = stream::iter(rows.into_iter().map(Self::row_to_event));
        Ok(Box::pin(stream))
    }
}
