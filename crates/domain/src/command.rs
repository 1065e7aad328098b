//! Command processing: load, decide, append, snapshot.

use std::sync::Arc;

use common::{AggregateId, RetryPolicy, retry_transient};
use event_store::{DomainEventStream, EventStore, EventStoreError, SnapshotStore, Version};
use messaging::CommandMessage;

use crate::aggregate::{AggregateState, EventPayload};
use crate::error::{DomainError, Result};
use crate::factory::StateAggregateFactory;
use crate::idempotency::ProcessedCommands;
use crate::repository::{EventStoreStateAggregateRepository, StateAggregateRepository};
use crate::state::StateAggregate;

/// Default number of reload-and-retry rounds after a version conflict.
pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;

/// Result of processing one command.
#[derive(Debug)]
pub struct CommandResult<S: AggregateState> {
    /// The aggregate after the command.
    pub aggregate: StateAggregate<S>,

    /// The stream that was persisted, if the command produced events. For a
    /// duplicate this is the stream the earlier delivery persisted.
    pub stream: Option<DomainEventStream>,

    /// True when the command had already been processed earlier.
    pub duplicate: bool,

    /// True when a snapshot was written for the new version.
    pub snapshot_taken: bool,
}

impl<S: AggregateState> CommandResult<S> {
    pub fn version(&self) -> Version {
        self.aggregate.version()
    }

    /// Number of events the command produced.
    pub fn event_count(&self) -> usize {
        self.stream.as_ref().map_or(0, DomainEventStream::len)
    }
}

/// When to write snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStrategy {
    Never,
    /// Every `n` versions.
    Every(u64),
}

impl Default for SnapshotStrategy {
    fn default() -> Self {
        SnapshotStrategy::Every(10)
    }
}

impl SnapshotStrategy {
    pub fn should_snapshot(&self, version: Version) -> bool {
        match self {
            SnapshotStrategy::Never => false,
            SnapshotStrategy::Every(0) => false,
            SnapshotStrategy::Every(n) => {
                version.as_i64() > 0 && version.as_i64() as u64 % n == 0
            }
        }
    }
}

/// Executes commands against aggregates with optimistic concurrency.
///
/// There is no lock around an aggregate: concurrent commands race on the
/// event store append, and the loser reloads and decides again, up to
/// `conflict_retries` times.
pub struct AggregateProcessor<F, E> {
    repository: EventStoreStateAggregateRepository<F, E>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    snapshot_strategy: SnapshotStrategy,
    processed: ProcessedCommands,
    retry_policy: RetryPolicy,
    conflict_retries: u32,
}

impl<F, E> AggregateProcessor<F, E>
where
    F: StateAggregateFactory,
    E: EventStore,
{
    pub fn new(repository: EventStoreStateAggregateRepository<F, E>) -> Self {
        Self {
            repository,
            snapshots: None,
            snapshot_strategy: SnapshotStrategy::Never,
            processed: ProcessedCommands::default(),
            retry_policy: RetryPolicy::default(),
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    /// Writes snapshots to `snapshots` according to `strategy`.
    pub fn with_snapshots(
        mut self,
        snapshots: Arc<dyn SnapshotStore>,
        strategy: SnapshotStrategy,
    ) -> Self {
        self.snapshots = Some(snapshots);
        self.snapshot_strategy = strategy;
        self
    }

    pub fn with_processed_commands(mut self, processed: ProcessedCommands) -> Self {
        self.processed = processed;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    pub fn repository(&self) -> &EventStoreStateAggregateRepository<F, E> {
        &self.repository
    }

    /// Processes `command` against its aggregate.
    ///
    /// `decide` inspects the current aggregate and returns the events to
    /// record, or refuses the command. It may run more than once when the
    /// append loses a race, so it must not have side effects. It never runs
    /// for a command whose stream is already in the store.
    #[tracing::instrument(
        skip(self, command, decide),
        fields(
            command_id = %command.command_id,
            aggregate_id = %command.aggregate_id,
            command = %command.name
        )
    )]
    pub async fn process<S, D>(
        &self,
        command: &CommandMessage,
        decide: D,
    ) -> Result<CommandResult<S>>
    where
        S: AggregateState,
        D: Fn(&StateAggregate<S>, &CommandMessage) -> std::result::Result<Vec<S::Event>, S::Error>
            + Send
            + Sync,
    {
        let aggregate_id = &command.aggregate_id;

        if let Some(stream) = self.persisted_stream(command).await? {
            tracing::info!(version = %stream.version, "command already persisted, skipping");
            self.processed.insert(command.command_id).await;
            metrics::counter!("commands_duplicate_total").increment(1);
            return self.duplicate_result(aggregate_id, Some(stream)).await;
        }
        if self.processed.contains(command.command_id).await {
            tracing::info!("command already processed without events, skipping");
            metrics::counter!("commands_duplicate_total").increment(1);
            return self.duplicate_result(aggregate_id, None).await;
        }

        let mut conflicts = 0;
        loop {
            let mut aggregate = self.load_latest::<S>(aggregate_id).await?;

            let events = decide(&aggregate, command).map_err(|e| {
                metrics::counter!("commands_rejected_total").increment(1);
                DomainError::Rejected(e.to_string())
            })?;

            if events.is_empty() {
                tracing::debug!("command produced no events");
                self.processed.insert(command.command_id).await;
                return Ok(CommandResult {
                    aggregate,
                    stream: None,
                    duplicate: false,
                    snapshot_taken: false,
                });
            }

            let stream = build_stream::<S>(&aggregate, command, &events)?;
            let expected_version = aggregate.version();

            let appended = retry_transient(&self.retry_policy, "event_store.append", |_| {
                self.repository
                    .store()
                    .append(expected_version, stream.clone())
            })
            .await;

            match appended {
                Ok(()) => {
                    aggregate.on_sourcing(&stream)?;
                    self.processed.insert(command.command_id).await;
                    metrics::counter!("commands_processed_total").increment(1);
                    tracing::info!(
                        version = %stream.version,
                        events = stream.len(),
                        "command processed"
                    );

                    let snapshot_taken = self.snapshot(&aggregate).await;
                    return Ok(CommandResult {
                        aggregate,
                        stream: Some(stream),
                        duplicate: false,
                        snapshot_taken,
                    });
                }
                Err(EventStoreError::VersionConflict { actual, .. })
                    if conflicts < self.conflict_retries =>
                {
                    conflicts += 1;
                    metrics::counter!("commands_conflict_retries_total").increment(1);
                    tracing::warn!(
                        %expected_version,
                        %actual,
                        attempt = conflicts,
                        "version conflict, reloading aggregate"
                    );
                }
                Err(EventStoreError::DuplicateCommand { .. }) => {
                    tracing::info!("command persisted concurrently, treating as processed");
                    self.processed.insert(command.command_id).await;
                    metrics::counter!("commands_duplicate_total").increment(1);
                    let persisted = self.persisted_stream(command).await?;
                    return self.duplicate_result(aggregate_id, persisted).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn load_latest<S: AggregateState>(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<StateAggregate<S>> {
        retry_transient(&self.retry_policy, "repository.load", |_| {
            self.repository.load_latest::<S>(aggregate_id)
        })
        .await
    }

    async fn persisted_stream(
        &self,
        command: &CommandMessage,
    ) -> Result<Option<DomainEventStream>> {
        let store = self.repository.store();
        let found = retry_transient(&self.retry_policy, "event_store.find_by_command", |_| {
            store.find_by_command(&command.aggregate_id, command.command_id)
        })
        .await?;
        Ok(found)
    }

    async fn duplicate_result<S: AggregateState>(
        &self,
        aggregate_id: &AggregateId,
        stream: Option<DomainEventStream>,
    ) -> Result<CommandResult<S>> {
        Ok(CommandResult {
            aggregate: self.load_latest::<S>(aggregate_id).await?,
            stream,
            duplicate: true,
            snapshot_taken: false,
        })
    }

    /// Best effort: a failed snapshot never fails the command.
    async fn snapshot<S: AggregateState>(&self, aggregate: &StateAggregate<S>) -> bool {
        let Some(snapshots) = &self.snapshots else {
            return false;
        };
        if !self.snapshot_strategy.should_snapshot(aggregate.version()) {
            return false;
        }

        let snapshot = match aggregate.to_snapshot() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize snapshot");
                return false;
            }
        };

        match snapshots.save(snapshot).await {
            Ok(()) => {
                metrics::counter!("snapshots_saved_total").increment(1);
                true
            }
            Err(e) => {
                tracing::warn!(
                    version = %aggregate.version(),
                    error = %e,
                    "failed to save snapshot"
                );
                false
            }
        }
    }
}

fn build_stream<S: AggregateState>(
    aggregate: &StateAggregate<S>,
    command: &CommandMessage,
    events: &[S::Event],
) -> Result<DomainEventStream> {
    let mut builder = DomainEventStream::builder()
        .command_id(command.command_id)
        .aggregate_id(aggregate.aggregate_id().clone())
        .version(aggregate.expected_next_version());

    for (key, value) in &command.header {
        builder = builder.header(key.clone(), value.clone());
    }
    for event in events {
        builder = builder.event_from(event.event_name(), event)?;
    }

    builder.try_build().ok_or_else(|| {
        DomainError::Rejected("stream is missing its aggregate or version".to_string())
    })
}
