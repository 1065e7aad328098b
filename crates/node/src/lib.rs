//! Process wiring for the event-sourcing kernel.
//!
//! [`Config`] is read from the environment and resolved once by
//! [`Kernel::build`] into concrete backends; bounded contexts then obtain
//! processors, dispatchers and projection processors from the kernel.

pub mod backend;
pub mod config;
pub mod kernel;

pub use backend::{EventStoreBackend, SnapshotBackend};
pub use config::{BusKind, Config, ConfigError, EventStoreKind, SnapshotKind};
pub use kernel::{Kernel, KernelProcessor, NodeError, Result};
