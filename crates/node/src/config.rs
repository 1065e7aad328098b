//! Node configuration loaded from environment variables.

use std::time::Duration;

use common::RetryPolicy;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {variable}")]
    InvalidValue { variable: &'static str, value: String },

    #[error("{variable} is required when {reason}")]
    Missing {
        variable: &'static str,
        reason: &'static str,
    },
}

/// Where event streams are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventStoreKind {
    #[default]
    Memory,
    Postgres,
}

/// Where snapshots are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotKind {
    None,
    #[default]
    Memory,
    Postgres,
}

/// Message bus transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusKind {
    #[default]
    Memory,
}

/// Node configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `EVENT_STORE`: `memory` | `postgres` (default: `memory`)
/// - `DATABASE_URL`: PostgreSQL URL, required by any postgres backend
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default: `5`)
/// - `SNAPSHOT_SINK`: `none` | `memory` | `postgres` (default: `memory`)
/// - `SNAPSHOT_INTERVAL`: snapshot every N versions (default: `10`)
/// - `BUS_TYPE`: `memory` (default: `memory`)
/// - `BUS_PARTITIONS`: lanes per consumer group (default: `16`)
/// - `RETRY_MAX_ATTEMPTS`, `RETRY_INITIAL_DELAY_MS`, `RETRY_MAX_DELAY_MS`
/// - `CONFLICT_RETRIES`: reload-and-retry budget (default: `3`)
/// - `COMMAND_RETENTION_SECS`, `COMMAND_RETENTION_CAPACITY`: duplicate registry
/// - `WAIT_RETENTION_SECS`: wait progress retention (default: `300`)
/// - `DISPATCHER_WORKERS`: command workers per context (default: `4`)
/// - `NODE_ID`: suffix of this node's signal consumer group (default: random)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
///
/// Unknown backend names are errors; unparsable numbers fall back to their
/// defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub event_store: EventStoreKind,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub snapshot_sink: SnapshotKind,
    pub snapshot_interval: u64,
    pub bus: BusKind,
    pub bus_partitions: usize,
    pub retry: RetryPolicy,
    pub conflict_retries: u32,
    pub command_retention: Duration,
    pub command_retention_capacity: usize,
    pub wait_retention: Duration,
    pub dispatcher_workers: usize,
    pub node_id: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            event_store: EventStoreKind::default(),
            database_url: None,
            database_max_connections: 5,
            snapshot_sink: SnapshotKind::default(),
            snapshot_interval: 10,
            bus: BusKind::default(),
            bus_partitions: messaging::memory::DEFAULT_PARTITIONS,
            retry: RetryPolicy::default(),
            conflict_retries: domain::DEFAULT_CONFLICT_RETRIES,
            command_retention: domain::idempotency::DEFAULT_RETENTION,
            command_retention_capacity: domain::idempotency::DEFAULT_CAPACITY,
            wait_retention: messaging::wait::DEFAULT_RETENTION,
            dispatcher_workers: 4,
            node_id: uuid::Uuid::new_v4().to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let number = |name: &str| lookup(name).and_then(|value| value.trim().parse::<u64>().ok());

        let event_store = match lookup("EVENT_STORE") {
            None => defaults.event_store,
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "memory" => EventStoreKind::Memory,
                "postgres" => EventStoreKind::Postgres,
                _ => return Err(invalid("EVENT_STORE", value)),
            },
        };
        let snapshot_sink = match lookup("SNAPSHOT_SINK") {
            None => defaults.snapshot_sink,
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "none" => SnapshotKind::None,
                "memory" => SnapshotKind::Memory,
                "postgres" => SnapshotKind::Postgres,
                _ => return Err(invalid("SNAPSHOT_SINK", value)),
            },
        };
        let bus = match lookup("BUS_TYPE") {
            None => defaults.bus,
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "memory" => BusKind::Memory,
                _ => return Err(invalid("BUS_TYPE", value)),
            },
        };

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        if database_url.is_none() {
            if event_store == EventStoreKind::Postgres {
                return Err(ConfigError::Missing {
                    variable: "DATABASE_URL",
                    reason: "EVENT_STORE=postgres",
                });
            }
            if snapshot_sink == SnapshotKind::Postgres {
                return Err(ConfigError::Missing {
                    variable: "DATABASE_URL",
                    reason: "SNAPSHOT_SINK=postgres",
                });
            }
        }

        let retry = RetryPolicy {
            max_attempts: number("RETRY_MAX_ATTEMPTS")
                .map(|n| n as u32)
                .unwrap_or(defaults.retry.max_attempts),
            initial_delay: number("RETRY_INITIAL_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.initial_delay),
            max_delay: number("RETRY_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_delay),
            ..defaults.retry
        };

        Ok(Self {
            event_store,
            database_url,
            database_max_connections: number("DATABASE_MAX_CONNECTIONS")
                .map(|n| n as u32)
                .unwrap_or(defaults.database_max_connections),
            snapshot_sink,
            snapshot_interval: number("SNAPSHOT_INTERVAL").unwrap_or(defaults.snapshot_interval),
            bus,
            bus_partitions: number("BUS_PARTITIONS")
                .map(|n| n as usize)
                .unwrap_or(defaults.bus_partitions),
            retry,
            conflict_retries: number("CONFLICT_RETRIES")
                .map(|n| n as u32)
                .unwrap_or(defaults.conflict_retries),
            command_retention: number("COMMAND_RETENTION_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.command_retention),
            command_retention_capacity: number("COMMAND_RETENTION_CAPACITY")
                .map(|n| n as usize)
                .unwrap_or(defaults.command_retention_capacity),
            wait_retention: number("WAIT_RETENTION_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.wait_retention),
            dispatcher_workers: number("DISPATCHER_WORKERS")
                .map(|n| n as usize)
                .unwrap_or(defaults.dispatcher_workers),
            node_id: lookup("NODE_ID")
                .filter(|id| !id.trim().is_empty())
                .unwrap_or(defaults.node_id),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
        })
    }

    /// Consumer group this node uses for wait signals.
    pub fn signal_group(&self) -> String {
        format!("wait.{}", self.node_id)
    }
}

fn invalid(variable: &'static str, value: String) -> ConfigError {
    ConfigError::InvalidValue { variable, value }
}
