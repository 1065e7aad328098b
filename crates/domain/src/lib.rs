//! Write side of the event-sourcing kernel.
//!
//! This crate provides:
//! - `AggregateState` for user-defined aggregate state and its events
//! - `StateAggregate`, the versioned wrapper rebuilt by replaying streams
//! - factories and the `StateAggregateRepository` that reconstruct aggregates
//!   up to a version or a point in time, optionally seeded by snapshots
//! - `AggregateProcessor`, which loads, decides, appends and snapshots
//! - `CommandDispatcher`, which connects processors to the message buses

pub mod aggregate;
pub mod command;
pub mod dispatcher;
pub mod error;
pub mod factory;
pub mod idempotency;
pub mod repository;
pub mod state;

pub use aggregate::{AggregateState, EventPayload, StateAggregateMetadata};
pub use command::{AggregateProcessor, CommandResult, DEFAULT_CONFLICT_RETRIES, SnapshotStrategy};
pub use dispatcher::{
    AggregateCommandHandler, CommandDispatcher, CommandProcessor, ProcessedCommand,
};
pub use error::{DomainError, Result, SourcingError};
pub use factory::{
    EmptyStateAggregateFactory, SnapshotStateAggregateFactory, StateAggregateFactory,
    validate_metadata,
};
pub use idempotency::ProcessedCommands;
pub use repository::{EventStoreStateAggregateRepository, StateAggregateRepository};
pub use state::StateAggregate;
