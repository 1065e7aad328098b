//! Shared identifiers and infrastructure policies for the event-sourcing kernel.

pub mod retry;
pub mod types;

pub use retry::{IsTransient, RetryPolicy, retry_transient};
pub use types::{AggregateId, CommandId, DEFAULT_TENANT_ID, NamedAggregate};
