//! Append-only event stream log, partitioned per aggregate instance.
//!
//! Every successful command produces one [`DomainEventStream`]. The store
//! persists it with optimistic concurrency on the aggregate version and
//! reads histories back lazily, in ascending version order.

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod range;
pub mod snapshot;
pub mod store;

pub use common::{AggregateId, CommandId};
pub use error::{EventStoreError, Result};
pub use event::{DomainEvent, DomainEventStream, DomainEventStreamBuilder, EventId, Version};
pub use memory::InMemoryEventStore;
pub use postgres::{PostgresEventStore, PostgresSnapshotStore};
pub use range::LoadRange;
pub use snapshot::{InMemorySnapshotStore, NoOpSnapshotStore, Snapshot, SnapshotStore};
pub use store::{DomainEventStreams, EventStore, EventStoreExt};
