//! Creation of the aggregate shell a load replays onto.

use async_trait::async_trait;
use common::AggregateId;
use event_store::{SnapshotStore, Version};

use crate::aggregate::AggregateState;
use crate::error::{DomainError, Result};
use crate::state::StateAggregate;

/// Produces the starting point of a load: either an empty aggregate or one
/// seeded from a snapshot. Which one is the factory's policy.
#[async_trait]
pub trait StateAggregateFactory: Send + Sync {
    /// Creates the shell for a load to the end of the history.
    async fn create<S: AggregateState>(&self, aggregate_id: &AggregateId)
    -> Result<StateAggregate<S>>;

    /// Creates a shell whose version does not exceed `max_version`.
    async fn create_at_most<S: AggregateState>(
        &self,
        aggregate_id: &AggregateId,
        max_version: Version,
    ) -> Result<StateAggregate<S>>;
}

/// Checks that `aggregate_id` names an instance of `S`.
pub fn validate_metadata<S: AggregateState>(aggregate_id: &AggregateId) -> Result<()> {
    let metadata = S::metadata();
    if metadata.matches(aggregate_id) {
        Ok(())
    } else {
        Err(DomainError::InvalidMetadata {
            expected: metadata.named_aggregate(),
            actual: aggregate_id.named_aggregate(),
        })
    }
}

/// Always starts from version 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyStateAggregateFactory;

#[async_trait]
impl StateAggregateFactory for EmptyStateAggregateFactory {
    async fn create<S: AggregateState>(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<StateAggregate<S>> {
        validate_metadata::<S>(aggregate_id)?;
        Ok(StateAggregate::new(aggregate_id.clone()))
    }

    async fn create_at_most<S: AggregateState>(
        &self,
        aggregate_id: &AggregateId,
        _max_version: Version,
    ) -> Result<StateAggregate<S>> {
        self.create(aggregate_id).await
    }
}

/// Starts from the newest usable snapshot, or from version 0 without one.
///
/// Snapshots are never required for correctness: a snapshot that cannot be
/// read or decoded is logged and ignored.
#[derive(Debug, Clone)]
pub struct SnapshotStateAggregateFactory<SS> {
    snapshots: SS,
}

impl<SS: SnapshotStore> SnapshotStateAggregateFactory<SS> {
    pub fn new(snapshots: SS) -> Self {
        Self { snapshots }
    }

    pub fn snapshots(&self) -> &SS {
        &self.snapshots
    }
}

#[async_trait]
impl<SS: SnapshotStore> StateAggregateFactory for SnapshotStateAggregateFactory<SS> {
    async fn create<S: AggregateState>(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<StateAggregate<S>> {
        self.create_at_most(aggregate_id, Version::MAX).await
    }

    async fn create_at_most<S: AggregateState>(
        &self,
        aggregate_id: &AggregateId,
        max_version: Version,
    ) -> Result<StateAggregate<S>> {
        validate_metadata::<S>(aggregate_id)?;

        let snapshot = match self.snapshots.load(aggregate_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(StateAggregate::new(aggregate_id.clone())),
            Err(e) => {
                tracing::warn!(
                    %aggregate_id,
                    error = %e,
                    "snapshot load failed, replaying from start"
                );
                return Ok(StateAggregate::new(aggregate_id.clone()));
            }
        };

        if snapshot.aggregate_id != *aggregate_id {
            tracing::warn!(
                %aggregate_id,
                snapshot_of = %snapshot.aggregate_id,
                "snapshot belongs to another aggregate, ignoring"
            );
            return Ok(StateAggregate::new(aggregate_id.clone()));
        }

        if snapshot.version > max_version {
            tracing::debug!(
                %aggregate_id,
                snapshot_version = %snapshot.version,
                %max_version,
                "snapshot newer than requested tail"
            );
            return Ok(StateAggregate::new(aggregate_id.clone()));
        }

        let version = snapshot.version;
        match StateAggregate::from_snapshot(snapshot) {
            Ok(aggregate) => {
                tracing::debug!(%aggregate_id, %version, "seeded from snapshot");
                Ok(aggregate)
            }
            Err(e) => {
                tracing::warn!(
                    %aggregate_id,
                    %version,
                    error = %e,
                    "snapshot could not be decoded, replaying from start"
                );
                Ok(StateAggregate::new(aggregate_id.clone()))
            }
        }
    }
}
