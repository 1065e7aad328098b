use std::collections::HashMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    AggregateId, CommandId, DomainEventStream, EventStoreError, LoadRange, Result, Version,
    store::{
        DEFAULT_PAGE_SIZE, DomainEventStreams, EventStore, empty_streams, paginate,
        validate_stream_for_append,
    },
};

type Partitions = HashMap<AggregateId, Vec<DomainEventStream>>;

/// In-memory event store.
///
/// Each aggregate owns its own partition, kept in version order. Appends
/// take the write lock for the whole compare-and-append, so there is no
/// window between the version check and the write.
#[derive(Clone)]
pub struct InMemoryEventStore {
    partitions: Arc<RwLock<Partitions>>,
    page_size: usize,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self {
            partitions: Arc::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how many streams a lazy load reads per page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Returns the total number of streams stored.
    pub async fn stream_count(&self) -> usize {
        self.partitions.read().await.values().map(Vec::len).sum()
    }

    /// Clears all streams.
    pub async fn clear(&self) {
        self.partitions.write().await.clear();
    }

    fn load_range(&self, aggregate_id: &AggregateId, range: LoadRange) -> DomainEventStreams {
        if range.is_empty() {
            return empty_streams();
        }

        let partitions = Arc::clone(&self.partitions);
        let aggregate_id = aggregate_id.clone();
        let page_size = self.page_size;

        paginate(page_size, move |cursor| {
            let partitions = Arc::clone(&partitions);
            let aggregate_id = aggregate_id.clone();
            async move {
                let after = cursor.unwrap_or(range.min_version().previous());
                let partitions = partitions.read().await;
                let page = partitions
                    .get(&aggregate_id)
                    .map(|streams| {
                        streams
                            .iter()
                            .filter(|stream| stream.version > after && range.contains(stream))
                            .take(page_size)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(page)
            }
        })
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[tracing::instrument(
        skip(self, stream),
        fields(aggregate_id = %stream.aggregate_id, version = %stream.version)
    )]
    async fn append(&self, expected_version: Version, stream: DomainEventStream) -> Result<()> {
        validate_stream_for_append(expected_version, &stream)?;

        let mut partitions = self.partitions.write().await;
        let partition = partitions.entry(stream.aggregate_id.clone()).or_default();

        let current_version = partition
            .last()
            .map(|s| s.version)
            .unwrap_or(Version::initial());

        if current_version != expected_version {
            metrics::counter!("event_store_version_conflicts_total").increment(1);
            return Err(EventStoreError::VersionConflict {
                aggregate_id: stream.aggregate_id,
                expected: expected_version,
                actual: current_version,
            });
        }

        if partition.iter().any(|s| s.command_id == stream.command_id) {
            return Err(EventStoreError::DuplicateCommand {
                aggregate_id: stream.aggregate_id,
                command_id: stream.command_id,
            });
        }

        metrics::counter!("event_store_streams_appended_total").increment(1);
        partition.push(stream);
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
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(aggregate_id)
            .and_then(|streams| streams.last())
            .map(|s| s.version)
            .unwrap_or(Version::initial()))
    }

    async fn find_by_command(
        &self,
        aggregate_id: &AggregateId,
        command_id: CommandId,
    ) -> Result<Option<DomainEventStream>> {
        let partitions = self.partitions.read().await;
        Ok(partitions.get(aggregate_id).and_then(|streams| {
            streams
                .iter()
                .find(|stream| stream.command_id == command_id)
                .cloned()
        }))
    }
}
