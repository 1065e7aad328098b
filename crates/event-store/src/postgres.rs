use std::collections::HashMap;
use std::ops::Bound;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::CommandId;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, DomainEvent, DomainEventStream, EventId, EventStoreError, LoadRange, Result,
    Snapshot, SnapshotStore, Version,
    store::{
        DEFAULT_PAGE_SIZE, DomainEventStreams, EventStore, empty_streams, paginate,
        validate_stream_for_append,
    },
};

const STREAM_COLUMNS: &str = "context_name, aggregate_name, tenant_id, aggregate_id, version, \
     stream_id, command_id, event_time, header, events";

/// PostgreSQL-backed event store implementation.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    page_size: usize,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL event store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Sets how many rows a lazy load fetches per query.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_stream(row: PgRow) -> Result<DomainEventStream> {
        let header: HashMap<String, String> =
            serde_json::from_value(row.try_get::<serde_json::Value, _>("header")?)?;
        let events: Vec<DomainEvent> =
            serde_json::from_value(row.try_get::<serde_json::Value, _>("events")?)?;

        Ok(DomainEventStream {
            stream_id: EventId::from_uuid(row.try_get::<Uuid, _>("stream_id")?),
            command_id: CommandId::from_uuid(row.try_get::<Uuid, _>("command_id")?),
            aggregate_id: AggregateId {
                context_name: row.try_get("context_name")?,
                aggregate_name: row.try_get("aggregate_name")?,
                tenant_id: row.try_get("tenant_id")?,
                id: row.try_get("aggregate_id")?,
            },
            version: Version::new(row.try_get("version")?),
            event_time: row.try_get("event_time")?,
            header,
            events,
        })
    }

    async fn fetch_page(
        pool: &PgPool,
        aggregate_id: &AggregateId,
        range: LoadRange,
        after: Version,
        page_size: usize,
    ) -> Result<Vec<DomainEventStream>> {
        let base = format!(
            "SELECT {STREAM_COLUMNS} FROM event_stream \
             WHERE context_name = $1 AND aggregate_name = $2 AND tenant_id = $3 \
             AND aggregate_id = $4 AND version > $5"
        );

        let rows = match range {
            LoadRange::Versions { head, tail } => {
                let sql = format!(
                    "{base} AND version >= $6 AND version <= $7 ORDER BY version ASC LIMIT $8"
                );
                sqlx::query(&sql)
                    .bind(&aggregate_id.context_name)
                    .bind(&aggregate_id.aggregate_name)
                    .bind(&aggregate_id.tenant_id)
                    .bind(&aggregate_id.id)
                    .bind(after.as_i64())
                    .bind(head.as_i64())
                    .bind(tail.as_i64())
                    .bind(page_size as i64)
                    .fetch_all(pool)
                    .await?
            }
            LoadRange::EventTimes { head, tail } => {
                let (head_time, head_inclusive) = match head {
                    Bound::Included(time) => (Some(time), true),
                    Bound::Excluded(time) => (Some(time), false),
                    Bound::Unbounded => (None, false),
                };
                let sql = format!(
                    "{base} AND ($6::timestamptz IS NULL OR event_time > $6 \
                     OR ($7 AND event_time = $6)) AND event_time <= $8 \
                     ORDER BY version ASC LIMIT $9"
                );
                sqlx::query(&sql)
                    .bind(&aggregate_id.context_name)
                    .bind(&aggregate_id.aggregate_name)
                    .bind(&aggregate_id.tenant_id)
                    .bind(&aggregate_id.id)
                    .bind(after.as_i64())
                    .bind(head_time)
                    .bind(head_inclusive)
                    .bind(tail)
                    .bind(page_size as i64)
                    .fetch_all(pool)
                    .await?
            }
        };

        rows.into_iter().map(Self::row_to_stream).collect()
    }

    fn load_range(&self, aggregate_id: &AggregateId, range: LoadRange) -> DomainEventStreams {
        if range.is_empty() {
            return empty_streams();
        }

        let pool = self.pool.clone();
        let aggregate_id = aggregate_id.clone();
        let page_size = self.page_size;

        paginate(page_size, move |cursor| {
            let pool = pool.clone();
            let aggregate_id = aggregate_id.clone();
            async move {
                let after = cursor.unwrap_or(range.min_version().previous());
                Self::fetch_page(&pool, &aggregate_id, range, after, page_size).await
            }
        })
    }

    fn map_constraint_violation(
        error: sqlx::Error,
        expected_version: Version,
        stream: &DomainEventStream,
    ) -> EventStoreError {
        if let sqlx::Error::Database(ref db_err) = error {
            match db_err.constraint() {
                Some("unique_aggregate_version") => {
                    return EventStoreError::VersionConflict {
                        aggregate_id: stream.aggregate_id.clone(),
                        expected: expected_version,
                        actual: stream.version,
                    };
                }
                Some("unique_aggregate_command") => {
                    return EventStoreError::DuplicateCommand {
                        aggregate_id: stream.aggregate_id.clone(),
                        command_id: stream.command_id,
                    };
                }
                _ => {}
            }
        }
        error.into()
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[tracing::instrument(
        skip(self, stream),
        fields(aggregate_id = %stream.aggregate_id, version = %stream.version)
    )]
    async fn append(&self, expected_version: Version, stream: DomainEventStream) -> Result<()> {
        validate_stream_for_append(expected_version, &stream)?;

        let header = serde_json::to_value(&stream.header)?;
        let events = serde_json::to_value(&stream.events)?;

        // Version check and insert in one statement, so there is no window
        // between them. Racing writers trip the unique constraint instead.
        let result = sqlx::query(
            r#"
            INSERT INTO event_stream (context_name, aggregate_name, tenant_id, aggregate_id,
                                      version, stream_id, command_id, event_time, header, events)
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
            WHERE COALESCE(
                (SELECT MAX(version) FROM event_stream
                 WHERE context_name = $1 AND aggregate_name = $2
                   AND tenant_id = $3 AND aggregate_id = $4),
                0) = $11
            "#,
        )
        .bind(&stream.aggregate_id.context_name)
        .bind(&stream.aggregate_id.aggregate_name)
        .bind(&stream.aggregate_id.tenant_id)
        .bind(&stream.aggregate_id.id)
        .bind(stream.version.as_i64())
        .bind(stream.stream_id.as_uuid())
        .bind(stream.command_id.as_uuid())
        .bind(stream.event_time)
        .bind(header)
        .bind(events)
        .bind(expected_version.as_i64())
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_constraint_violation(e, expected_version, &stream))?;

        if result.rows_affected() == 0 {
            let actual = self.last_version(&stream.aggregate_id).await?;
            metrics::counter!("event_store_version_conflicts_total").increment(1);
            return Err(EventStoreError::VersionConflict {
                aggregate_id: stream.aggregate_id,
                expected: expected_version,
                actual,
            });
        }

        metrics::counter!("event_store_streams_appended_total").increment(1);
        Ok(())
    }

    fn load(
        &self,
        aggregate_id: &AggregateId,
        head_version: Version,
        tail_version: Version,
    ) -> DomainEventStreams {
        self.load_range(aggregate_id, LoadRange::versions(head_version, tail_version))
    }

    fn load_by_event_time(
        &self,
        aggregate_id: &AggregateId,
        head: Bound<DateTime<Utc>>,
        tail: DateTime<Utc>,
    ) -> DomainEventStreams {
        self.load_range(aggregate_id, LoadRange::event_times(head, tail))
    }

    async fn last_version(&self, aggregate_id: &AggregateId) -> Result<Version> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(version) FROM event_stream
            WHERE context_name = $1 AND aggregate_name = $2
              AND tenant_id = $3 AND aggregate_id = $4
            "#,
        )
        .bind(&aggregate_id.context_name)
        .bind(&aggregate_id.aggregate_name)
        .bind(&aggregate_id.tenant_id)
        .bind(&aggregate_id.id)
        .fetch_one(&self.pool)
        .await?;

        Ok(version.map(Version::new).unwrap_or(Version::initial()))
    }

    async fn find_by_command(
        &self,
        aggregate_id: &AggregateId,
        command_id: CommandId,
    ) -> Result<Option<DomainEventStream>> {
        let sql = format!(
            "SELECT {STREAM_COLUMNS} FROM event_stream \
             WHERE context_name = $1 AND aggregate_name = $2 AND tenant_id = $3 \
             AND aggregate_id = $4 AND command_id = $5"
        );
        let row: Option<PgRow> = sqlx::query(&sql)
            .bind(&aggregate_id.context_name)
            .bind(&aggregate_id.aggregate_name)
            .bind(&aggregate_id.tenant_id)
            .bind(&aggregate_id.id)
            .bind(command_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_stream).transpose()
    }
}

/// PostgreSQL-backed snapshot store holding the newest snapshot per aggregate.
#[derive(Clone)]
pub struct PostgresSnapshotStore {
    pool: PgPool,
}

impl PostgresSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for PostgresSnapshotStore {
    async fn load(&self, aggregate_id: &AggregateId) -> Result<Option<Snapshot>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT version, event_time, snapshot_time, state
            FROM snapshot
            WHERE context_name = $1 AND aggregate_name = $2
              AND tenant_id = $3 AND aggregate_id = $4
            "#,
        )
        .bind(&aggregate_id.context_name)
        .bind(&aggregate_id.aggregate_name)
        .bind(&aggregate_id.tenant_id)
        .bind(&aggregate_id.id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Snapshot {
                aggregate_id: aggregate_id.clone(),
                version: Version::new(row.try_get("version")?),
                event_time: row.try_get("event_time")?,
                snapshot_time: row.try_get("snapshot_time")?,
                state: row.try_get("state")?,
            })),
            None => Ok(None),
        }
    }

    #[tracing::instrument(
        skip(self, snapshot),
        fields(aggregate_id = %snapshot.aggregate_id, version = %snapshot.version)
    )]
    async fn save(&self, snapshot: Snapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshot (context_name, aggregate_name, tenant_id, aggregate_id,
                                  version, event_time, snapshot_time, state)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (context_name, aggregate_name, tenant_id, aggregate_id) DO UPDATE SET
                version = EXCLUDED.version,
                event_time = EXCLUDED.event_time,
                snapshot_time = EXCLUDED.snapshot_time,
                state = EXCLUDED.state
            WHERE snapshot.version < EXCLUDED.version
            "#,
        )
        .bind(&snapshot.aggregate_id.context_name)
        .bind(&snapshot.aggregate_id.aggregate_name)
        .bind(&snapshot.aggregate_id.tenant_id)
        .bind(&snapshot.aggregate_id.id)
        .bind(snapshot.version.as_i64())
        .bind(snapshot.event_time)
        .bind(snapshot.snapshot_time)
        .bind(&snapshot.state)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
