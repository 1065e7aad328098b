//! Consumes a context's command topic and drives each command through its
//! aggregate processor.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use common::{AggregateId, CommandId, NamedAggregate};
use event_store::{DomainEventStream, EventStore, Version};
use futures_util::StreamExt;
use messaging::{
    BusError, CommandBus, CommandMessage, CommandStage, DomainEventBus, Message, SignalEmitter,
    WaitSignal,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::aggregate::AggregateState;
use crate::command::AggregateProcessor;
use crate::error::{DomainError, Result};
use crate::factory::StateAggregateFactory;
use crate::state::StateAggregate;

/// Per-worker queue depth.
const WORKER_QUEUE: usize = 256;

/// Type-erased outcome of a processed command.
#[derive(Debug, Clone)]
pub struct ProcessedCommand {
    pub command_id: CommandId,
    pub aggregate_id: AggregateId,
    pub version: Version,
    /// The command's stream. Duplicates carry the stream persisted by the
    /// earlier delivery so it can be published again.
    pub stream: Option<DomainEventStream>,
    pub duplicate: bool,
    pub snapshot_taken: bool,
}

impl ProcessedCommand {
    pub fn produced_events(&self) -> bool {
        self.stream.is_some()
    }
}

/// Handles the commands of one aggregate type.
#[async_trait]
pub trait CommandProcessor: Send + Sync {
    fn named_aggregate(&self) -> NamedAggregate;

    async fn handle(&self, command: &CommandMessage) -> Result<ProcessedCommand>;
}

/// Binds an [`AggregateProcessor`] to an aggregate type and its decision
/// function.
pub struct AggregateCommandHandler<S, F, E, D> {
    processor: Arc<AggregateProcessor<F, E>>,
    decide: D,
    _state: PhantomData<fn() -> S>,
}

impl<S, F, E, D> AggregateCommandHandler<S, F, E, D>
where
    S: AggregateState,
    F: StateAggregateFactory,
    E: EventStore,
    D: Fn(&StateAggregate<S>, &CommandMessage) -> std::result::Result<Vec<S::Event>, S::Error>
        + Send
        + Sync,
{
    pub fn new(processor: Arc<AggregateProcessor<F, E>>, decide: D) -> Self {
        Self {
            processor,
            decide,
            _state: PhantomData,
        }
    }
}

#[async_trait]
impl<S, F, E, D> CommandProcessor for AggregateCommandHandler<S, F, E, D>
where
    S: AggregateState,
    F: StateAggregateFactory + 'static,
    E: EventStore + 'static,
    D: Fn(&StateAggregate<S>, &CommandMessage) -> std::result::Result<Vec<S::Event>, S::Error>
        + Send
        + Sync
        + 'static,
{
    fn named_aggregate(&self) -> NamedAggregate {
        S::metadata().named_aggregate()
    }

    async fn handle(&self, command: &CommandMessage) -> Result<ProcessedCommand> {
        let result = self.processor.process::<S, _>(command, &self.decide).await?;
        Ok(ProcessedCommand {
            command_id: command.command_id,
            aggregate_id: command.aggregate_id.clone(),
            version: result.version(),
            stream: result.stream,
            duplicate: result.duplicate,
            snapshot_taken: result.snapshot_taken,
        })
    }
}

struct Shared {
    processors: HashMap<NamedAggregate, Arc<dyn CommandProcessor>>,
    event_bus: Arc<DomainEventBus>,
    emitter: SignalEmitter,
}

/// Runs the command side of one bounded context on this node.
///
/// Commands are routed to `workers` local tasks by partition lane, so the
/// commands of one aggregate are handled one after another while different
/// aggregates proceed in parallel. After each command the dispatcher
/// publishes the new stream and emits `PROCESSED` and `SNAPSHOT` signals.
/// A redelivered command publishes its persisted stream again, which repairs
/// an earlier publish that failed after the append.
pub struct CommandDispatcher {
    context_name: String,
    group: String,
    workers: usize,
    command_bus: Arc<CommandBus>,
    event_bus: Arc<DomainEventBus>,
    emitter: SignalEmitter,
    processors: HashMap<NamedAggregate, Arc<dyn CommandProcessor>>,
}

impl CommandDispatcher {
    pub fn new(
        context_name: impl Into<String>,
        command_bus: Arc<CommandBus>,
        event_bus: Arc<DomainEventBus>,
        emitter: SignalEmitter,
    ) -> Self {
        let context_name = context_name.into();
        Self {
            group: format!("{context_name}.command-processor"),
            context_name,
            workers: 4,
            command_bus,
            event_bus,
            emitter,
            processors: HashMap::new(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Consumer group used on the command topic.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn register(mut self, processor: Arc<dyn CommandProcessor>) -> Self {
        let named = processor.named_aggregate();
        if named.context_name != self.context_name {
            tracing::warn!(
                aggregate = %named,
                context = %self.context_name,
                "processor registered outside its context, it will never receive commands"
            );
        }
        self.processors.insert(named, processor);
        self
    }

    pub fn context_name(&self) -> &str {
        &self.context_name
    }

    /// Subscribes to the command topic and starts routing.
    ///
    /// The returned task ends once the command stream ends and every worker
    /// drained its queue.
    pub async fn start(self) -> std::result::Result<JoinHandle<()>, BusError> {
        let mut commands = self
            .command_bus
            .subscribe(&self.context_name, &self.group)
            .await?;

        tracing::info!(
            context = %self.context_name,
            group = %self.group,
            workers = self.workers,
            aggregates = self.processors.len(),
            "command dispatcher started"
        );

        let shared = Arc::new(Shared {
            processors: self.processors,
            event_bus: self.event_bus,
            emitter: self.emitter,
        });

        let mut lanes = Vec::with_capacity(self.workers);
        let mut workers = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let (tx, mut rx) = mpsc::channel::<CommandMessage>(WORKER_QUEUE);
            let shared = Arc::clone(&shared);
            lanes.push(tx);
            workers.push(tokio::spawn(async move {
                while let Some(command) = rx.recv().await {
                    shared.dispatch(command).await;
                }
                tracing::debug!(worker, "command worker stopped");
            }));
        }

        let context_name = self.context_name;
        Ok(tokio::spawn(async move {
            while let Some(command) = commands.next().await {
                let lane = command.partition_key().lane(lanes.len());
                if lanes[lane].send(command).await.is_err() {
                    tracing::error!(lane, "command worker is gone");
                }
            }
            drop(lanes);
            for worker in workers {
                let _ = worker.await;
            }
            tracing::info!(context = %context_name, "command dispatcher stopped");
        }))
    }
}

impl Shared {
    #[tracing::instrument(
        skip(self, command),
        fields(
            command_id = %command.command_id,
            aggregate_id = %command.aggregate_id,
            command = %command.name
        )
    )]
    async fn dispatch(&self, command: CommandMessage) {
        let started = Instant::now();
        let named = command.aggregate_id.named_aggregate();

        let Some(processor) = self.processors.get(&named) else {
            tracing::warn!(aggregate = %named, "no processor registered");
            metrics::counter!("commands_failed_total").increment(1);
            self.emit_failure(&command, &DomainError::UnknownAggregate(named))
                .await;
            return;
        };

        match processor.handle(&command).await {
            Ok(processed) => {
                if let Some(stream) = &processed.stream {
                    if let Err(e) = self.event_bus.send(stream.clone()).await {
                        tracing::error!(
                            version = %stream.version,
                            error = %e,
                            "failed to publish event stream"
                        );
                    }
                }

                let mut signal = WaitSignal::new(
                    command.command_id,
                    command.aggregate_id.clone(),
                    CommandStage::Processed,
                )
                .with_version(processed.version);
                if !processed.produced_events() {
                    signal = signal.without_events();
                }
                self.emitter.emit(signal).await;

                if processed.produced_events() {
                    self.emitter
                        .emit(
                            WaitSignal::new(
                                command.command_id,
                                command.aggregate_id.clone(),
                                CommandStage::Snapshot,
                            )
                            .with_version(processed.version),
                        )
                        .await;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "command failed");
                metrics::counter!("commands_failed_total").increment(1);
                self.emit_failure(&command, &e).await;
            }
        }

        metrics::histogram!("command_processing_duration_seconds")
            .record(started.elapsed().as_secs_f64());
    }

    async fn emit_failure(&self, command: &CommandMessage, error: &DomainError) {
        self.emitter
            .emit(
                WaitSignal::new(
                    command.command_id,
                    command.aggregate_id.clone(),
                    CommandStage::Processed,
                )
                .failed(error.to_string()),
            )
            .await;
    }
}
