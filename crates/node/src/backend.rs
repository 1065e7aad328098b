//! Storage backends selected at startup.

use std::ops::Bound;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AggregateId, CommandId};
use event_store::{
    DomainEventStream, DomainEventStreams, EventStore, InMemoryEventStore, InMemorySnapshotStore,
    NoOpSnapshotStore, PostgresEventStore, PostgresSnapshotStore, Result, Snapshot, SnapshotStore,
    Version,
};

/// The configured event store.
#[derive(Clone)]
pub enum EventStoreBackend {
    Memory(InMemoryEventStore),
    Postgres(PostgresEventStore),
}

impl EventStoreBackend {
    pub fn name(&self) -> &'static str {
        match self {
            EventStoreBackend::Memory(_) => "memory",
            EventStoreBackend::Postgres(_) => "postgres",
        }
    }
}

#[async_trait]
impl EventStore for EventStoreBackend {
    async fn append(&self, expected_version: Version, stream: DomainEventStream) -> Result<()> {
        match self {
            EventStoreBackend::Memory(store) => store.append(expected_version, stream).await,
            EventStoreBackend::Postgres(store) => store.append(expected_version, stream).await,
        }
    }

    fn load(
        &self,
        aggregate_id: &AggregateId,
        head_version: Version,
        tail_version: Version,
    ) -> DomainEventStreams {
        match self {
            EventStoreBackend::Memory(store) => {
                store.load(aggregate_id, head_version, tail_version)
            }
            EventStoreBackend::Postgres(store) => {
                store.load(aggregate_id, head_version, tail_version)
            }
        }
    }

    fn load_by_event_time(
        &self,
        aggregate_id: &AggregateId,
        head: Bound<DateTime<Utc>>,
        tail: DateTime<Utc>,
    ) -> DomainEventStreams {
        match self {
            EventStoreBackend::Memory(store) => store.load_by_event_time(aggregate_id, head, tail),
            EventStoreBackend::Postgres(store) => {
                store.load_by_event_time(aggregate_id, head, tail)
            }
        }
    }

    async fn last_version(&self, aggregate_id: &AggregateId) -> Result<Version> {
        match self {
            EventStoreBackend::Memory(store) => store.last_version(aggregate_id).await,
            EventStoreBackend::Postgres(store) => store.last_version(aggregate_id).await,
        }
    }

    async fn find_by_command(
        &self,
        aggregate_id: &AggregateId,
        command_id: CommandId,
    ) -> Result<Option<DomainEventStream>> {
        match self {
            EventStoreBackend::Memory(store) => {
                store.find_by_command(aggregate_id, command_id).await
            }
            EventStoreBackend::Postgres(store) => {
                store.find_by_command(aggregate_id, command_id).await
            }
        }
    }
}

/// The configured snapshot sink.
#[derive(Clone)]
pub enum SnapshotBackend {
    None(NoOpSnapshotStore),
    Memory(InMemorySnapshotStore),
    Postgres(PostgresSnapshotStore),
}

impl SnapshotBackend {
    pub fn name(&self) -> &'static str {
        match self {
            SnapshotBackend::None(_) => "none",
            SnapshotBackend::Memory(_) => "memory",
            SnapshotBackend::Postgres(_) => "postgres",
        }
    }
}

#[async_trait]
impl SnapshotStore for SnapshotBackend {
    async fn load(&self, aggregate_id: &AggregateId) -> Result<Option<Snapshot>> {
        match self {
            SnapshotBackend::None(store) => store.load(aggregate_id).await,
            SnapshotBackend::Memory(store) => store.load(aggregate_id).await,
            SnapshotBackend::Postgres(store) => store.load(aggregate_id).await,
        }
    }

    async fn save(&self, snapshot: Snapshot) -> Result<()> {
        match self {
            SnapshotBackend::None(store) => store.save(snapshot).await,
            SnapshotBackend::Memory(store) => store.save(snapshot).await,
            SnapshotBackend::Postgres(store) => store.save(snapshot).await,
        }
    }
}
