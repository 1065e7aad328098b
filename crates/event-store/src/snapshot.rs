use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{AggregateId, Result, Version};

/// A snapshot of an aggregate's state at a specific version.
///
/// Snapshots are an optimization: rebuilding from a snapshot plus the streams
/// after it must give the same state as a full replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The aggregate this snapshot belongs to.
    pub aggregate_id: AggregateId,

    /// The version of the aggregate at the time of the snapshot.
    pub version: Version,

    /// Event time of the last stream folded into the state.
    pub event_time: DateTime<Utc>,

    /// When the snapshot was taken.
    pub snapshot_time: DateTime<Utc>,

    /// The serialized aggregate state.
    pub state: serde_json::Value,
}

impl Snapshot {
    /// Creates a new snapshot.
    pub fn new(
        aggregate_id: AggregateId,
        version: Version,
        event_time: DateTime<Utc>,
        state: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_id,
            version,
            event_time,
            snapshot_time: Utc::now(),
            state,
        }
    }

    /// Creates a snapshot from a serializable state.
    pub fn from_state<T: Serialize>(
        aggregate_id: AggregateId,
        version: Version,
        event_time: DateTime<Utc>,
        state: &T,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self::new(
            aggregate_id,
            version,
            event_time,
            serde_json::to_value(state)?,
        ))
    }

    /// Deserializes the snapshot state into a concrete type.
    pub fn into_state<T: for<'de> Deserialize<'de>>(
        self,
    ) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_value(self.state)
    }
}

/// Storage for the latest snapshot of each aggregate.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Loads the latest snapshot, if any.
    async fn load(&self, aggregate_id: &AggregateId) -> Result<Option<Snapshot>>;

    /// Saves a snapshot. A snapshot older than the stored one is ignored.
    async fn save(&self, snapshot: Snapshot) -> Result<()>;
}

#[async_trait]
impl<T: SnapshotStore + ?Sized> SnapshotStore for Arc<T> {
    async fn load(&self, aggregate_id: &AggregateId) -> Result<Option<Snapshot>> {
        (**self).load(aggregate_id).await
    }

    async fn save(&self, snapshot: Snapshot) -> Result<()> {
        (**self).save(snapshot).await
    }
}

/// Snapshot store that keeps nothing. Every load falls back to replay.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSnapshotStore;

#[async_trait]
impl SnapshotStore for NoOpSnapshotStore {
    async fn load(&self, _aggregate_id: &AggregateId) -> Result<Option<Snapshot>> {
        Ok(None)
    }

    async fn save(&self, _snapshot: Snapshot) -> Result<()> {
        Ok(())
    }
}

/// In-memory snapshot store keeping the newest snapshot per aggregate.
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Arc<RwLock<HashMap<AggregateId, Snapshot>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of aggregates with a snapshot.
    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn load(&self, aggregate_id: &AggregateId) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.read().await.get(aggregate_id).cloned())
    }

    #[tracing::instrument(
        skip(self, snapshot),
        fields(aggregate_id = %snapshot.aggregate_id, version = %snapshot.version)
    )]
    async fn save(&self, snapshot: Snapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        match snapshots.get(&snapshot.aggregate_id) {
            Some(existing) if existing.version >= snapshot.version => {
                tracing::debug!(stored = %existing.version, "Ignoring stale snapshot");
            }
            _ => {
                snapshots.insert(snapshot.aggregate_id.clone(), snapshot);
            }
        }
        Ok(())
    }
}
