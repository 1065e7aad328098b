//! Domain error types.

use common::{AggregateId, IsTransient, NamedAggregate};
use event_store::{EventStoreError, Version};
use messaging::BusError;
use thiserror::Error;

/// Errors raised while replaying streams into an aggregate.
#[derive(Debug, Error)]
pub enum SourcingError {
    /// The stream belongs to another aggregate.
    #[error("Stream for {actual} cannot be applied to {expected}")]
    AggregateMismatch {
        expected: AggregateId,
        actual: AggregateId,
    },

    /// The stream does not follow the aggregate's current version.
    #[error("Aggregate {aggregate_id} expected stream version {expected}, got {actual}")]
    VersionMismatch {
        aggregate_id: AggregateId,
        expected: Version,
        actual: Version,
    },

    /// An event body could not be decoded into the aggregate's event type.
    #[error("Failed to decode event '{event_name}': {source}")]
    Decode {
        event_name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// The aggregate ID does not name the aggregate type being loaded.
    #[error("Aggregate {actual} does not match expected type {expected}")]
    InvalidMetadata {
        expected: NamedAggregate,
        actual: NamedAggregate,
    },

    /// Replaying the history failed.
    #[error("Sourcing error: {0}")]
    Sourcing(#[from] SourcingError),

    /// The aggregate refused the command.
    #[error("Command rejected: {0}")]
    Rejected(String),

    /// No processor is registered for the aggregate type.
    #[error("No processor registered for aggregate {0}")]
    UnknownAggregate(NamedAggregate),

    /// A message bus error.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    /// Returns true when the event store reported an optimistic concurrency conflict.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, DomainError::EventStore(e) if e.is_version_conflict())
    }
}

impl IsTransient for DomainError {
    fn is_transient(&self) -> bool {
        match self {
            DomainError::EventStore(e) => e.is_transient(),
            DomainError::Bus(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
