use common::{CommandId, IsTransient};
use thiserror::Error;

use crate::{AggregateId, Version};

/// Errors that can occur when interacting with the event store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Optimistic concurrency lost: the aggregate moved on since it was loaded.
    /// Retry by reloading the aggregate, not by resending the same stream.
    #[error(
        "Version conflict for aggregate {aggregate_id}: expected version {expected}, found {actual}"
    )]
    VersionConflict {
        aggregate_id: AggregateId,
        expected: Version,
        actual: Version,
    },

    /// The command already produced a persisted stream for this aggregate.
    #[error("Command {command_id} already persisted for aggregate {aggregate_id}")]
    DuplicateCommand {
        aggregate_id: AggregateId,
        command_id: CommandId,
    },

    /// The store could not be reached or the operation was interrupted.
    #[error("Event store unavailable: {0}")]
    Unavailable(String),

    /// The stream violates the append contract.
    #[error("Invalid event stream: {0}")]
    InvalidStream(String),

    /// A database error that retrying will not fix.
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    /// Returns true for the optimistic concurrency failure kind.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, EventStoreError::VersionConflict { .. })
    }
}

impl IsTransient for EventStoreError {
    fn is_transient(&self) -> bool {
        matches!(self, EventStoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for EventStoreError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => EventStoreError::Unavailable(error.to_string()),
            other => EventStoreError::Database(other),
        }
    }
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;
