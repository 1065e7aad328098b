use std::future::Future;
use std::ops::Bound;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use futures_util::{TryStreamExt, stream};

use crate::{AggregateId, CommandId, DomainEventStream, EventStoreError, Result, Version};

/// Streams fetched per page when a store reads lazily.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// A lazy, ordered sequence of event streams for one aggregate.
pub type DomainEventStreams = Pin<Box<dyn Stream<Item = Result<DomainEventStream>> + Send>>;

/// Core trait for event store implementations.
///
/// The log is partitioned per aggregate. All implementations must be
/// thread-safe (Send + Sync).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends a stream if and only if the aggregate is currently at
    /// `expected_version` and the stream advances it to the next version.
    ///
    /// This is a single compare-and-append: on conflict nothing is written and
    /// `VersionConflict` is returned.
    async fn append(&self, expected_version: Version, stream: DomainEventStream) -> Result<()>;

    /// Lazily loads the streams with `head_version <= version <= tail_version`
    /// in ascending version order. `Version::MAX` means no upper bound.
    fn load(
        &self,
        aggregate_id: &AggregateId,
        head_version: Version,
        tail_version: Version,
    ) -> DomainEventStreams;

    /// Lazily loads the streams whose event time falls within `head..=tail`,
    /// in ascending version order.
    ///
    /// The result is not guaranteed to be contiguous from version 1.
    fn load_by_event_time(
        &self,
        aggregate_id: &AggregateId,
        head: Bound<DateTime<Utc>>,
        tail: DateTime<Utc>,
    ) -> DomainEventStreams;

    /// Gets the latest persisted version, `Version::initial()` if none.
    async fn last_version(&self, aggregate_id: &AggregateId) -> Result<Version>;

    /// Gets the stream `command_id` persisted on this aggregate, if any.
    async fn find_by_command(
        &self,
        aggregate_id: &AggregateId,
        command_id: CommandId,
    ) -> Result<Option<DomainEventStream>>;
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Loads the whole history of an aggregate.
    fn load_all(&self, aggregate_id: &AggregateId) -> DomainEventStreams {
        self.load(aggregate_id, Version::first(), Version::MAX)
    }

    /// Collects a whole history into memory. Meant for tests and tooling.
    async fn collect_all(&self, aggregate_id: &AggregateId) -> Result<Vec<DomainEventStream>> {
        self.load_all(aggregate_id).try_collect().await
    }

    /// Checks if an aggregate exists (has any streams).
    async fn aggregate_exists(&self, aggregate_id: &AggregateId) -> Result<bool> {
        Ok(!self.last_version(aggregate_id).await?.is_initial())
    }
}

// Blanket implementation for all EventStore implementations
impl<T: EventStore + ?Sized> EventStoreExt for T {}

#[async_trait]
impl<T: EventStore + ?Sized> EventStore for std::sync::Arc<T> {
    async fn append(&self, expected_version: Version, stream: DomainEventStream) -> Result<()> {
        (**self).append(expected_version, stream).await
    }

    fn load(
        &self,
        aggregate_id: &AggregateId,
        head_version: Version,
        tail_version: Version,
    ) -> DomainEventStreams {
        (**self).load(aggregate_id, head_version, tail_version)
    }

    fn load_by_event_time(
        &self,
        aggregate_id: &AggregateId,
        head: Bound<DateTime<Utc>>,
        tail: DateTime<Utc>,
    ) -> DomainEventStreams {
        (**self).load_by_event_time(aggregate_id, head, tail)
    }

    async fn last_version(&self, aggregate_id: &AggregateId) -> Result<Version> {
        (**self).last_version(aggregate_id).await
    }

    async fn find_by_command(
        &self,
        aggregate_id: &AggregateId,
        command_id: CommandId,
    ) -> Result<Option<DomainEventStream>> {
        (**self).find_by_command(aggregate_id, command_id).await
    }
}

/// Builds a lazy stream that fetches pages on demand.
///
/// `fetch` receives the version of the last stream already yielded (or
/// `None` for the first page) and must return at most `page_size` streams with
/// greater versions, ascending. Paging stops at the first short page.
pub fn paginate<F, Fut>(page_size: usize, fetch: F) -> DomainEventStreams
where
    F: Fn(Option<Version>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<DomainEventStream>>> + Send + 'static,
{
    let page_size = page_size.max(1);
    let pages = stream::try_unfold(
        (fetch, None::<Version>, false),
        move |(fetch, cursor, exhausted)| async move {
            if exhausted {
                return Ok::<_, EventStoreError>(None);
            }
            let page = fetch(cursor).await?;
            if page.is_empty() {
                return Ok(None);
            }
            let exhausted = page.len() < page_size;
            let cursor = page.last().map(|stream| stream.version);
            Ok(Some((page, (fetch, cursor, exhausted))))
        },
    );

    Box::pin(
        pages
            .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, EventStoreError>)))
            .try_flatten(),
    )
}

/// Returns an empty lazy stream.
pub fn empty_streams() -> DomainEventStreams {
    Box::pin(stream::empty())
}

/// Validates a stream before appending it at `expected_version`.
pub fn validate_stream_for_append(
    expected_version: Version,
    stream: &DomainEventStream,
) -> Result<()> {
    if stream.is_empty() {
        return Err(EventStoreError::InvalidStream(
            "Cannot append a stream without events".to_string(),
        ));
    }

    if stream.version != expected_version.next() {
        return Err(EventStoreError::InvalidStream(format!(
            "Stream version must follow the expected version. Expected {}, got {}",
            expected_version.next(),
            stream.version
        )));
    }

    for (index, event) in stream.events.iter().enumerate() {
        let expected_sequence = index as u32 + 1;
        if event.sequence != expected_sequence {
            return Err(EventStoreError::InvalidStream(format!(
                "Event sequences must be contiguous. Expected {}, got {}",
                expected_sequence, event.sequence
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stream_at(version: i64) -> DomainEventStream {
        DomainEventStream::builder()
            .aggregate_id(AggregateId::new("sales", "order", "o-1"))
            .version(Version::new(version))
            .event("Touched", serde_json::json!({ "version": version }))
            .build()
    }

    #[test]
    fn validate_rejects_empty_stream() {
        let stream = DomainEventStream::builder()
            .aggregate_id(AggregateId::new("sales", "order", "o-1"))
            .version(Version::first())
            .build();
        assert!(matches!(
            validate_stream_for_append(Version::initial(), &stream),
            Err(EventStoreError::InvalidStream(_))
        ));
    }

    #[test]
    fn validate_rejects_version_gap() {
        let stream = stream_at(3);
        assert!(validate_stream_for_append(Version::new(1), &stream).is_err());
        assert!(validate_stream_for_append(Version::new(2), &stream).is_ok());
    }

    #[test]
    fn validate_rejects_sequence_gap() {
        let mut stream = stream_at(1);
        stream.events[0].sequence = 2;
        assert!(validate_stream_for_append(Version::initial(), &stream).is_err());
    }

    #[tokio::test]
    async fn paginate_fetches_pages_on_demand() {
        let log: Arc<Vec<DomainEventStream>> = Arc::new((1..=5).map(stream_at).collect());
        let fetches = Arc::new(AtomicUsize::new(0));

        let source = Arc::clone(&log);
        let counter = Arc::clone(&fetches);
        let mut streams = paginate(2, move |cursor| {
            let source = Arc::clone(&source);
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                let after = cursor.unwrap_or(Version::initial());
                Ok(source
                    .iter()
                    .filter(|s| s.version > after)
                    .take(2)
                    .cloned()
                    .collect())
            }
        });

        let first = streams.next().await.unwrap().unwrap();
        assert_eq!(first.version, Version::new(1));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        let rest: Vec<_> = streams.try_collect().await.unwrap();
        let versions: Vec<i64> = rest.iter().map(|s| s.version.as_i64()).collect();
        assert_eq!(versions, vec![2, 3, 4, 5]);
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn paginate_surfaces_fetch_errors() {
        let streams = paginate(10, |_| async {
            Err::<Vec<DomainEventStream>, _>(EventStoreError::Unavailable("down".into()))
        });
        let result: Result<Vec<_>> = streams.try_collect().await;
        assert!(matches!(result, Err(EventStoreError::Unavailable(_))));
    }
}
