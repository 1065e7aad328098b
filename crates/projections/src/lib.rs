//! Downstream consumers of domain event streams.
//!
//! This crate provides:
//! - [`Projection`] trait for read models and event handlers
//! - [`ProjectionProcessor`] for feeding streams from the event bus to
//!   projections, once per projection and aggregate version, and reporting
//!   `PROJECTED` / `EVENT_HANDLED` wait signals

pub mod error;
pub mod processor;
pub mod projection;

pub use error::{ProjectionError, Result};
pub use processor::ProjectionProcessor;
pub use projection::{ProcessorKind, Projection};
