//! Reconstruction of aggregates from their event history.

use std::ops::Bound;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::AggregateId;
use event_store::{EventStore, Version};
use futures_util::{TryStreamExt, future};

use crate::aggregate::AggregateState;
use crate::error::Result;
use crate::factory::StateAggregateFactory;
use crate::state::StateAggregate;

/// Read-only access to reconstructed aggregates.
///
/// An aggregate with no history loads as version 0 with the default state;
/// that is not an error.
#[async_trait]
pub trait StateAggregateRepository: Send + Sync {
    /// Loads the aggregate as of `tail_version`. `Version::MAX` loads the latest.
    async fn load<S: AggregateState>(
        &self,
        aggregate_id: &AggregateId,
        tail_version: Version,
    ) -> Result<StateAggregate<S>>;

    /// Loads the aggregate as of `tail_event_time`, inclusive.
    async fn load_at<S: AggregateState>(
        &self,
        aggregate_id: &AggregateId,
        tail_event_time: DateTime<Utc>,
    ) -> Result<StateAggregate<S>>;

    /// Loads the latest state.
    async fn load_latest<S: AggregateState>(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<StateAggregate<S>> {
        self.load(aggregate_id, Version::MAX).await
    }
}

/// Repository replaying streams from an [`EventStore`] onto the shell a
/// [`StateAggregateFactory`] creates.
#[derive(Debug, Clone)]
pub struct EventStoreStateAggregateRepository<F, E> {
    factory: F,
    store: E,
}

impl<F, E> EventStoreStateAggregateRepository<F, E>
where
    F: StateAggregateFactory,
    E: EventStore,
{
    pub fn new(factory: F, store: E) -> Self {
        Self { factory, store }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn store(&self) -> &E {
        &self.store
    }
}

#[async_trait]
impl<F, E> StateAggregateRepository for EventStoreStateAggregateRepository<F, E>
where
    F: StateAggregateFactory,
    E: EventStore,
{
    #[tracing::instrument(skip(self), fields(aggregate_id = %aggregate_id))]
    async fn load<S: AggregateState>(
        &self,
        aggregate_id: &AggregateId,
        tail_version: Version,
    ) -> Result<StateAggregate<S>> {
        let mut aggregate = if tail_version == Version::MAX {
            self.factory.create::<S>(aggregate_id).await?
        } else {
            self.factory
                .create_at_most::<S>(aggregate_id, tail_version)
                .await?
        };

        let head_version = aggregate.expected_next_version();
        let mut streams = self.store.load(aggregate_id, head_version, tail_version);
        let mut applied = 0usize;
        while let Some(stream) = streams.try_next().await? {
            aggregate.on_sourcing(&stream)?;
            applied += 1;
        }

        tracing::debug!(
            %head_version,
            version = %aggregate.version(),
            applied,
            "aggregate loaded"
        );
        Ok(aggregate)
    }

    #[tracing::instrument(skip(self), fields(aggregate_id = %aggregate_id))]
    async fn load_at<S: AggregateState>(
        &self,
        aggregate_id: &AggregateId,
        tail_event_time: DateTime<Utc>,
    ) -> Result<StateAggregate<S>> {
        let mut aggregate = self.factory.create::<S>(aggregate_id).await?;

        if aggregate
            .event_time()
            .is_some_and(|seeded_at| seeded_at > tail_event_time)
        {
            tracing::debug!("seed is newer than the requested time, replaying from start");
            aggregate = StateAggregate::new(aggregate_id.clone());
        }

        // Streams sharing the seed's event time are told apart by version.
        let head = match aggregate.event_time() {
            Some(seeded_at) => Bound::Included(seeded_at),
            None => Bound::Unbounded,
        };
        let floor = aggregate.expected_next_version();

        let mut streams = self
            .store
            .load_by_event_time(aggregate_id, head, tail_event_time)
            .try_filter(move |stream| future::ready(stream.version >= floor));
        let mut applied = 0usize;
        while let Some(stream) = streams.try_next().await? {
            aggregate.on_sourcing(&stream)?;
            applied += 1;
        }

        tracing::debug!(version = %aggregate.version(), applied, "aggregate loaded at time");
        Ok(aggregate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{EventPayload, StateAggregateMetadata};
    use crate::error::{DomainError, SourcingError};
    use crate::factory::{EmptyStateAggregateFactory, SnapshotStateAggregateFactory};
    use chrono::Duration;
    use event_store::{DomainEventStream, InMemoryEventStore, InMemorySnapshotStore, SnapshotStore};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ValueSet {
        x: i64,
    }

    impl EventPayload for ValueSet {
        fn event_name(&self) -> &'static str {
            "ValueSet"
        }
    }

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Register {
        x: i64,
        writes: u32,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("register error")]
    struct RegisterError;

    impl AggregateState for Register {
        type Event = ValueSet;
        type Error = RegisterError;

        fn metadata() -> StateAggregateMetadata {
            StateAggregateMetadata::new("test", "register")
        }

        fn apply(&mut self, event: Self::Event) {
            self.x = event.x;
            self.writes += 1;
        }
    }

    fn register_id() -> AggregateId {
        Register::metadata().aggregate_id("r-1")
    }

    fn set(aggregate_id: &AggregateId, version: i64, x: i64) -> DomainEventStream {
        DomainEventStream::builder()
            .aggregate_id(aggregate_id.clone())
            .version(Version::new(version))
            .event_from("ValueSet", &ValueSet { x })
            .unwrap()
            .build()
    }

    async fn store_with(values: &[i64]) -> InMemoryEventStore {
        let store = InMemoryEventStore::new().with_page_size(2);
        let id = register_id();
        for (index, x) in values.iter().enumerate() {
            let version = index as i64 + 1;
            store
                .append(Version::new(version - 1), set(&id, version, *x))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn load_latest_folds_everything() {
        let repository = EventStoreStateAggregateRepository::new(
            EmptyStateAggregateFactory,
            store_with(&[1, 2, 3, 4, 5]).await,
        );

        let aggregate = repository.load_latest::<Register>(&register_id()).await.unwrap();
        assert_eq!(aggregate.version(), Version::new(5));
        assert_eq!(aggregate.state().x, 5);
        assert_eq!(aggregate.state().writes, 5);
    }

    #[tokio::test]
    async fn load_to_tail_version() {
        let repository = EventStoreStateAggregateRepository::new(
            EmptyStateAggregateFactory,
            store_with(&[1, 2, 3]).await,
        );

        let aggregate = repository
            .load::<Register>(&register_id(), Version::new(2))
            .await
            .unwrap();
        assert_eq!(aggregate.version(), Version::new(2));
        assert_eq!(aggregate.state().x, 2);

        let at_end = repository
            .load::<Register>(&register_id(), Version::new(3))
            .await
            .unwrap();
        let latest = repository.load_latest::<Register>(&register_id()).await.unwrap();
        assert_eq!(at_end.state(), latest.state());
        assert_eq!(at_end.version(), latest.version());
    }

    #[tokio::test]
    async fn unknown_aggregate_is_version_zero() {
        let repository = EventStoreStateAggregateRepository::new(
            EmptyStateAggregateFactory,
            InMemoryEventStore::new(),
        );

        let aggregate = repository.load_latest::<Register>(&register_id()).await.unwrap();
        assert_eq!(aggregate.version(), Version::initial());
        assert_eq!(aggregate.state(), &Register::default());
    }

    #[tokio::test]
    async fn invalid_metadata_fails_before_reading() {
        let repository = EventStoreStateAggregateRepository::new(
            EmptyStateAggregateFactory,
            InMemoryEventStore::new(),
        );

        let result = repository
            .load_latest::<Register>(&AggregateId::new("test", "other", "r-1"))
            .await;
        assert!(matches!(result, Err(DomainError::InvalidMetadata { .. })));
    }

    #[tokio::test]
    async fn snapshot_seeded_load_matches_full_replay() {
        let store = store_with(&[1, 2, 3, 4]).await;
        let snapshots = InMemorySnapshotStore::new();

        let plain =
            EventStoreStateAggregateRepository::new(EmptyStateAggregateFactory, store.clone());
        let at_two = plain.load::<Register>(&register_id(), Version::new(2)).await.unwrap();
        snapshots.save(at_two.to_snapshot().unwrap().unwrap()).await.unwrap();

        let seeded = EventStoreStateAggregateRepository::new(
            SnapshotStateAggregateFactory::new(snapshots),
            store,
        );

        let full = plain.load_latest::<Register>(&register_id()).await.unwrap();
        let fast = seeded.load_latest::<Register>(&register_id()).await.unwrap();
        assert_eq!(full.state(), fast.state());
        assert_eq!(full.version(), fast.version());

        let early = seeded.load::<Register>(&register_id(), Version::first()).await.unwrap();
        assert_eq!(early.version(), Version::first());
        assert_eq!(early.state().x, 1);
    }

    #[tokio::test]
    async fn corrupt_history_aborts_the_load() {
        let store = InMemoryEventStore::new();
        let id = register_id();
        let bad = DomainEventStream::builder()
            .aggregate_id(id.clone())
            .version(Version::first())
            .event("ValueSet", serde_json::json!({ "y": "nope" }))
            .build();
        store.append(Version::initial(), bad).await.unwrap();

        let repository = EventStoreStateAggregateRepository::new(EmptyStateAggregateFactory, store);
        let result = repository.load_latest::<Register>(&id).await;
        assert!(matches!(
            result,
            Err(DomainError::Sourcing(SourcingError::Decode { .. }))
        ));
    }

    #[tokio::test]
    async fn load_at_event_time() {
        let store = InMemoryEventStore::new();
        let id = register_id();
        let t0 = Utc::now();
        for version in 1..=4 {
            let mut stream = set(&id, version, version * 10);
            stream.event_time = t0 + Duration::seconds(version);
            store.append(Version::new(version - 1), stream).await.unwrap();
        }

        let snapshots = InMemorySnapshotStore::new();
        let repository = EventStoreStateAggregateRepository::new(
            SnapshotStateAggregateFactory::new(snapshots.clone()),
            store,
        );

        let at_two = repository
            .load_at::<Register>(&id, t0 + Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(at_two.version(), Version::new(2));
        assert_eq!(at_two.state().x, 20);

        // Seeded from v2, only strictly later streams are replayed.
        snapshots.save(at_two.to_snapshot().unwrap().unwrap()).await.unwrap();
        let at_four = repository
            .load_at::<Register>(&id, t0 + Duration::seconds(4))
            .await
            .unwrap();
        assert_eq!(at_four.version(), Version::new(4));
        assert_eq!(at_four.state().writes, 4);

        // A snapshot newer than the requested time is not used.
        let before_seed = repository
            .load_at::<Register>(&id, t0 + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(before_seed.version(), Version::first());
        assert_eq!(before_seed.state().x, 10);

        let before_history = repository.load_at::<Register>(&id, t0).await.unwrap();
        assert_eq!(before_history.version(), Version::initial());
    }

    #[tokio::test]
    async fn load_at_keeps_streams_sharing_the_seed_time() {
        let store = InMemoryEventStore::new();
        let id = register_id();
        let at = Utc::now();
        for version in 1..=2 {
            let mut stream = set(&id, version, version * 10);
            stream.event_time = at;
            store.append(Version::new(version - 1), stream).await.unwrap();
        }

        let snapshots = InMemorySnapshotStore::new();
        let plain =
            EventStoreStateAggregateRepository::new(EmptyStateAggregateFactory, store.clone());
        let first = plain.load::<Register>(&id, Version::first()).await.unwrap();
        snapshots.save(first.to_snapshot().unwrap().unwrap()).await.unwrap();

        let seeded = EventStoreStateAggregateRepository::new(
            SnapshotStateAggregateFactory::new(snapshots),
            store,
        );
        let loaded = seeded.load_at::<Register>(&id, at).await.unwrap();
        assert_eq!(loaded.version(), Version::new(2));
        assert_eq!(loaded.state().x, 20);
        assert_eq!(loaded.state().writes, 2);
    }
}
