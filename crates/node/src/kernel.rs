//! Wires stores, buses, and the wait coordinator for one node.

use std::sync::Arc;

use domain::{
    AggregateProcessor, CommandDispatcher, EventStoreStateAggregateRepository, ProcessedCommands,
    SnapshotStateAggregateFactory, SnapshotStrategy,
};
use event_store::{
    EventStoreError, InMemoryEventStore, InMemorySnapshotStore, NoOpSnapshotStore,
    PostgresEventStore, PostgresSnapshotStore, SnapshotStore,
};
use messaging::{
    BusError, CommandBus, CommandGateway, DomainEventBus, InMemoryMessageBus, Message, MessageBus,
    RetryingBus, SignalBus, SignalEmitter, WaitCoordinator,
};
use projections::ProjectionProcessor;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::backend::{EventStoreBackend, SnapshotBackend};
use crate::config::{BusKind, Config, ConfigError, EventStoreKind, SnapshotKind};

/// Errors raised while bringing a node up.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

pub type Result<T> = std::result::Result<T, NodeError>;

/// Aggregate processor type handed out by the kernel.
pub type KernelProcessor =
    AggregateProcessor<SnapshotStateAggregateFactory<Arc<SnapshotBackend>>, EventStoreBackend>;

/// Shared infrastructure of one node.
///
/// Build it once from [`Config`], then create processors, dispatchers and
/// projection processors from it. Everything it hands out shares the same
/// stores and buses.
pub struct Kernel {
    config: Config,
    event_store: EventStoreBackend,
    snapshots: Arc<SnapshotBackend>,
    command_bus: Arc<CommandBus>,
    event_bus: Arc<DomainEventBus>,
    signal_bus: Arc<SignalBus>,
    coordinator: WaitCoordinator,
    processed: ProcessedCommands,
    tasks: Vec<JoinHandle<()>>,
}

impl Kernel {
    /// Connects the configured backends.
    #[tracing::instrument(skip(config), fields(node_id = %config.node_id))]
    pub async fn build(config: Config) -> Result<Self> {
        let pool = connect(&config).await?;

        let event_store = match (config.event_store, &pool) {
            (EventStoreKind::Postgres, Some(pool)) => {
                EventStoreBackend::Postgres(PostgresEventStore::new(pool.clone()))
            }
            _ => EventStoreBackend::Memory(InMemoryEventStore::new()),
        };
        let snapshots = match (config.snapshot_sink, &pool) {
            (SnapshotKind::None, _) => SnapshotBackend::None(NoOpSnapshotStore),
            (SnapshotKind::Postgres, Some(pool)) => {
                SnapshotBackend::Postgres(PostgresSnapshotStore::new(pool.clone()))
            }
            _ => SnapshotBackend::Memory(InMemorySnapshotStore::new()),
        };

        let kernel = Self {
            command_bus: bus(&config),
            event_bus: bus(&config),
            signal_bus: bus(&config),
            coordinator: WaitCoordinator::new(config.wait_retention),
            processed: ProcessedCommands::new(
                config.command_retention_capacity,
                config.command_retention,
            ),
            event_store,
            snapshots: Arc::new(snapshots),
            tasks: Vec::new(),
            config,
        };

        tracing::info!(
            event_store = kernel.event_store.name(),
            snapshots = kernel.snapshots.name(),
            partitions = kernel.config.bus_partitions,
            "kernel built"
        );
        Ok(kernel)
    }

    /// Starts the node-wide background tasks: the wait signal listener and
    /// the periodic purge of settled wait progress.
    pub async fn start(&mut self) -> Result<()> {
        let listener = self
            .coordinator
            .listen(Arc::clone(&self.signal_bus), &self.config.signal_group())
            .await?;
        self.tasks.push(listener);

        let coordinator = self.coordinator.clone();
        let every = (self.config.wait_retention / 2).max(std::time::Duration::from_secs(1));
        self.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                coordinator.purge_expired().await;
                metrics::gauge!("wait_pending_waiters")
                    .set(coordinator.pending_waiters().await as f64);
            }
        }));

        tracing::info!(group = %self.config.signal_group(), "kernel started");
        Ok(())
    }

    /// Keeps `handle` alive with the node and aborts it on shutdown.
    pub fn track(&mut self, handle: JoinHandle<()>) {
        self.tasks.push(handle);
    }

    /// An aggregate processor with the configured snapshot, retry and
    /// duplicate policies.
    pub fn processor(&self) -> KernelProcessor {
        let repository = EventStoreStateAggregateRepository::new(
            SnapshotStateAggregateFactory::new(Arc::clone(&self.snapshots)),
            self.event_store.clone(),
        );
        let strategy = match self.config.snapshot_sink {
            SnapshotKind::None => SnapshotStrategy::Never,
            _ => SnapshotStrategy::Every(self.config.snapshot_interval),
        };
        AggregateProcessor::new(repository)
            .with_snapshots(
                Arc::clone(&self.snapshots) as Arc<dyn SnapshotStore>,
                strategy,
            )
            .with_processed_commands(self.processed.clone())
            .with_retry_policy(self.config.retry)
            .with_conflict_retries(self.config.conflict_retries)
    }

    /// A command dispatcher for `context_name`. Register processors, then
    /// start it and [`track`](Self::track) the handle.
    pub fn dispatcher(&self, context_name: &str) -> CommandDispatcher {
        CommandDispatcher::new(
            context_name,
            Arc::clone(&self.command_bus),
            Arc::clone(&self.event_bus),
            self.emitter(),
        )
        .with_workers(self.config.dispatcher_workers)
    }

    /// A projection processor reporting signals for `context_name`.
    pub fn projection_processor(
        &self,
        context_name: &str,
    ) -> ProjectionProcessor<EventStoreBackend> {
        ProjectionProcessor::new(context_name, self.event_store.clone())
            .with_emitter(self.emitter())
            .with_workers(self.config.dispatcher_workers)
    }

    pub fn gateway(&self) -> CommandGateway {
        CommandGateway::new(Arc::clone(&self.command_bus), self.coordinator.clone())
    }

    pub fn emitter(&self) -> SignalEmitter {
        SignalEmitter::new(Arc::clone(&self.signal_bus))
    }

    pub fn coordinator(&self) -> &WaitCoordinator {
        &self.coordinator
    }

    pub fn event_store(&self) -> &EventStoreBackend {
        &self.event_store
    }

    pub fn event_bus(&self) -> Arc<DomainEventBus> {
        Arc::clone(&self.event_bus)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stops every tracked task.
    pub async fn shutdown(self) {
        let count = self.tasks.len();
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!(tasks = count, "kernel shut down");
    }
}

async fn connect(config: &Config) -> Result<Option<PgPool>> {
    let needs_postgres = config.event_store == EventStoreKind::Postgres
        || config.snapshot_sink == SnapshotKind::Postgres;
    if !needs_postgres {
        return Ok(None);
    }

    let Some(url) = config.database_url.as_deref() else {
        return Err(ConfigError::Missing {
            variable: "DATABASE_URL",
            reason: "a postgres backend is selected",
        }
        .into());
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(url)
        .await?;
    PostgresEventStore::new(pool.clone())
        .run_migrations()
        .await
        .map_err(EventStoreError::from)?;
    tracing::info!(
        max_connections = config.database_max_connections,
        "connected to postgres and applied migrations"
    );
    Ok(Some(pool))
}

fn bus<M: Message>(config: &Config) -> Arc<dyn MessageBus<M>> {
    match config.bus {
        BusKind::Memory => Arc::new(RetryingBus::new(
            InMemoryMessageBus::<M>::new(config.bus_partitions),
            config.retry,
        )),
    }
}
