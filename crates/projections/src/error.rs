//! Projection error types.

use thiserror::Error;

/// Errors that can occur during projection processing.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// Reading stored history for a catch-up failed.
    #[error("Catch-up read failed: {0}")]
    EventStore(#[from] event_store::EventStoreError),

    /// Failed to deserialize an event body.
    #[error("Event deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// The event bus could not be subscribed to.
    #[error("Bus error: {0}")]
    Bus(#[from] messaging::BusError),

    /// The projection refused or failed to handle a stream.
    #[error("Projection failed: {0}")]
    Projection(String),
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
