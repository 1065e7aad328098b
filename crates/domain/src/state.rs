//! Event-sourced wrapper around a user state.

use chrono::{DateTime, Utc};
use common::AggregateId;
use event_store::{DomainEventStream, Snapshot, Version};

use crate::aggregate::AggregateState;
use crate::error::SourcingError;

/// An aggregate instance: its identity, the state folded so far, and the
/// position in its history that state corresponds to.
///
/// A `StateAggregate` lives for one load or one command. It is only ever
/// advanced by [`on_sourcing`](Self::on_sourcing), one stream at a time.
#[derive(Debug, Clone)]
pub struct StateAggregate<S: AggregateState> {
    aggregate_id: AggregateId,
    state: S,
    version: Version,
    event_time: Option<DateTime<Utc>>,
}

impl<S: AggregateState> StateAggregate<S> {
    /// Creates an empty aggregate at version 0.
    pub fn new(aggregate_id: AggregateId) -> Self {
        Self {
            aggregate_id,
            state: S::default(),
            version: Version::initial(),
            event_time: None,
        }
    }

    /// Restores an aggregate from a snapshot.
    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self, serde_json::Error> {
        let aggregate_id = snapshot.aggregate_id.clone();
        let version = snapshot.version;
        let event_time = snapshot.event_time;
        let state = snapshot.into_state()?;
        Ok(Self {
            aggregate_id,
            state,
            version,
            event_time: Some(event_time),
        })
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn into_state(self) -> S {
        self.state
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Event time of the last applied stream.
    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        self.event_time
    }

    /// Version the next stream must carry.
    pub fn expected_next_version(&self) -> Version {
        self.version.next()
    }

    /// True once at least one stream has been applied.
    pub fn initialized(&self) -> bool {
        !self.version.is_initial()
    }

    /// Applies one stream.
    ///
    /// The stream must belong to this aggregate and carry exactly
    /// `expected_next_version`. All events are decoded before any is applied,
    /// so a failed call leaves the aggregate unchanged.
    pub fn on_sourcing(&mut self, stream: &DomainEventStream) -> Result<(), SourcingError> {
        if stream.aggregate_id != self.aggregate_id {
            return Err(SourcingError::AggregateMismatch {
                expected: self.aggregate_id.clone(),
                actual: stream.aggregate_id.clone(),
            });
        }

        if stream.version != self.expected_next_version() {
            return Err(SourcingError::VersionMismatch {
                aggregate_id: self.aggregate_id.clone(),
                expected: self.expected_next_version(),
                actual: stream.version,
            });
        }

        let events = stream
            .events
            .iter()
            .map(|event| {
                serde_json::from_value::<S::Event>(event.body.clone()).map_err(|source| {
                    SourcingError::Decode {
                        event_name: event.name.clone(),
                        source,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.state.apply_events(events);
        self.version = stream.version;
        self.event_time = Some(stream.event_time);
        Ok(())
    }

    /// Takes a snapshot of the current state. None before the first stream.
    pub fn to_snapshot(&self) -> Result<Option<Snapshot>, serde_json::Error> {
        let Some(event_time) = self.event_time.filter(|_| self.initialized()) else {
            return Ok(None);
        };
        Snapshot::from_state(self.aggregate_id.clone(), self.version, event_time, &self.state)
            .map(Some)
    }
}
