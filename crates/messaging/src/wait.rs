//! Cross-process wait/notification for command processing milestones.
//!
//! Processors emit a [`WaitSignal`] after each stage of a command. Signals
//! travel over the signal bus keyed by command id, and every process feeds
//! them into its own [`WaitCoordinator`], so a caller in one process can be
//! released by processing that happened in another.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{AggregateId, CommandId};
use event_store::Version;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bus::{BusError, SignalBus};
use crate::message::Message;
use crate::partition::PartitionKey;
use crate::stage::{CommandStage, UnknownStage};

/// Topic carrying wait signals.
pub const SIGNAL_TOPIC: &str = "__wait_signals";

pub const WAIT_STAGE_HEADER: &str = "wait_stage";
pub const WAIT_CONTEXT_HEADER: &str = "wait_context";
pub const WAIT_PROCESSOR_HEADER: &str = "wait_processor";
pub const WAIT_TIMEOUT_HEADER: &str = "wait_timeout_ms";

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long settled progress is kept for late waiters.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

/// Notification that a command reached a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitSignal {
    pub command_id: CommandId,
    pub aggregate_id: AggregateId,
    pub stage: CommandStage,
    /// Context of the reporting processor, empty for kernel stages.
    #[serde(default)]
    pub context_name: String,
    /// Name of the reporting processor, empty for kernel stages.
    #[serde(default)]
    pub processor_name: String,
    /// Aggregate version after the command, when known.
    pub version: Option<Version>,
    /// False when the command was handled but produced no stream.
    pub produced_events: bool,
    /// Set when the stage failed.
    pub error: Option<String>,
    pub signal_time: DateTime<Utc>,
}

impl WaitSignal {
    pub fn new(command_id: CommandId, aggregate_id: AggregateId, stage: CommandStage) -> Self {
        Self {
            command_id,
            aggregate_id,
            stage,
            context_name: String::new(),
            processor_name: String::new(),
            version: None,
            produced_events: true,
            error: None,
            signal_time: Utc::now(),
        }
    }

    pub fn with_processor(
        mut self,
        context_name: impl Into<String>,
        processor_name: impl Into<String>,
    ) -> Self {
        self.context_name = context_name.into();
        self.processor_name = processor_name.into();
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn without_events(mut self) -> Self {
        self.produced_events = false;
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    fn is_duplicate_of(&self, other: &WaitSignal) -> bool {
        self.stage == other.stage
            && self.context_name == other.context_name
            && self.processor_name == other.processor_name
    }

    /// True when no stage after this one will ever be reached.
    fn is_terminal(&self) -> bool {
        self.stage == CommandStage::Processed && (self.error.is_some() || !self.produced_events)
    }
}

impl Message for WaitSignal {
    fn topic(&self) -> &str {
        SIGNAL_TOPIC
    }

    fn partition_key(&self) -> PartitionKey {
        PartitionKey::for_command(self.command_id)
    }
}

/// What a caller waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOptions {
    pub stage: CommandStage,
    /// Required context of the reporting processor; empty matches any.
    pub context_name: String,
    /// Required processor name; empty matches any.
    pub processor_name: String,
    pub timeout: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self::stage(CommandStage::default())
    }
}

impl WaitOptions {
    pub fn stage(stage: CommandStage) -> Self {
        Self {
            stage,
            context_name: String::new(),
            processor_name: String::new(),
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    pub fn with_processor(
        mut self,
        context_name: impl Into<String>,
        processor_name: impl Into<String>,
    ) -> Self {
        self.context_name = context_name.into();
        self.processor_name = processor_name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reads wait options from command headers.
    ///
    /// Missing entries take their defaults; an unparsable timeout falls back
    /// to [`DEFAULT_WAIT_TIMEOUT`].
    pub fn from_header(header: &HashMap<String, String>) -> Result<Self, UnknownStage> {
        let stage = match header.get(WAIT_STAGE_HEADER) {
            Some(value) if !value.trim().is_empty() => value.parse()?,
            _ => CommandStage::default(),
        };
        let timeout = header
            .get(WAIT_TIMEOUT_HEADER)
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_WAIT_TIMEOUT);

        Ok(Self {
            stage,
            context_name: header.get(WAIT_CONTEXT_HEADER).cloned().unwrap_or_default(),
            processor_name: header
                .get(WAIT_PROCESSOR_HEADER)
                .cloned()
                .unwrap_or_default(),
            timeout,
        })
    }

    /// Writes these options into command headers.
    pub fn write_header(&self, header: &mut HashMap<String, String>) {
        header.insert(WAIT_STAGE_HEADER.to_string(), self.stage.to_string());
        header.insert(
            WAIT_TIMEOUT_HEADER.to_string(),
            self.timeout.as_millis().to_string(),
        );
        if !self.context_name.is_empty() {
            header.insert(WAIT_CONTEXT_HEADER.to_string(), self.context_name.clone());
        }
        if !self.processor_name.is_empty() {
            header.insert(WAIT_PROCESSOR_HEADER.to_string(), self.processor_name.clone());
        }
    }

    fn matches_processor(&self, signal: &WaitSignal) -> bool {
        if !self.stage.is_processor_stage() {
            return true;
        }
        (self.context_name.is_empty() || self.context_name == signal.context_name)
            && (self.processor_name.is_empty() || self.processor_name == signal.processor_name)
    }

    /// True when `signal` completes a waiter with these options.
    pub fn is_satisfied_by(&self, signal: &WaitSignal) -> bool {
        if signal.stage < self.stage {
            return signal.is_terminal();
        }
        if signal.stage.is_processor_stage() || self.stage.is_processor_stage() {
            return self.matches_processor(signal);
        }
        true
    }
}

/// Result delivered to a waiter.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitOutcome {
    pub command_id: CommandId,
    pub aggregate_id: AggregateId,
    /// Stage the waiter asked for.
    pub requested: CommandStage,
    /// Stage of the signal that completed the wait.
    pub reached: CommandStage,
    pub version: Option<Version>,
    pub produced_events: bool,
    pub error: Option<String>,
}

impl WaitOutcome {
    fn from_signal(requested: CommandStage, signal: &WaitSignal) -> Self {
        Self {
            command_id: signal.command_id,
            aggregate_id: signal.aggregate_id.clone(),
            requested,
            reached: signal.stage,
            version: signal.version,
            produced_events: signal.produced_events,
            error: signal.error.clone(),
        }
    }

    /// False when the command failed; the reason is in `error`.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Errors raised while waiting. Command failures are not errors here; they
/// are reported through [`WaitOutcome`].
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("Timed out after {timeout:?} waiting for command {command_id} to reach {stage}")]
    Timeout {
        command_id: CommandId,
        stage: CommandStage,
        timeout: Duration,
    },

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Invalid wait options: {0}")]
    InvalidOptions(#[from] UnknownStage),

    #[error("Wait coordinator closed")]
    Closed,
}

struct Waiter {
    id: u64,
    options: WaitOptions,
    reply: oneshot::Sender<WaitOutcome>,
}

struct Progress {
    signals: Vec<WaitSignal>,
    waiters: Vec<Waiter>,
    touched: Instant,
}

impl Progress {
    fn new() -> Self {
        Self {
            signals: Vec::new(),
            waiters: Vec::new(),
            touched: Instant::now(),
        }
    }
}

/// Matches wait signals to the callers waiting on them.
///
/// Signals that arrive before anyone waits are kept per command until the
/// retention period lapses, so a late `wait` still completes immediately.
#[derive(Clone)]
pub struct WaitCoordinator {
    progress: Arc<Mutex<HashMap<CommandId, Progress>>>,
    retention: Duration,
    next_waiter: Arc<AtomicU64>,
}

impl Default for WaitCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl WaitCoordinator {
    pub fn new(retention: Duration) -> Self {
        Self {
            progress: Arc::default(),
            retention,
            next_waiter: Arc::default(),
        }
    }

    /// Waits until `command_id` reaches the stage described by `options`.
    #[tracing::instrument(skip(self, options), fields(stage = %options.stage))]
    pub async fn wait(
        &self,
        command_id: CommandId,
        options: WaitOptions,
    ) -> Result<WaitOutcome, WaitError> {
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let mut rx = {
            let mut table = self.progress.lock().await;
            self.purge_locked(&mut table);
            let progress = table.entry(command_id).or_insert_with(Progress::new);

            if let Some(signal) = progress
                .signals
                .iter()
                .find(|signal| options.is_satisfied_by(signal))
            {
                return Ok(WaitOutcome::from_signal(options.stage, signal));
            }

            let (reply, rx) = oneshot::channel();
            progress.waiters.push(Waiter {
                id,
                options: options.clone(),
                reply,
            });
            rx
        };

        match tokio::time::timeout(options.timeout, &mut rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(WaitError::Closed),
            Err(_) => {
                {
                    let mut table = self.progress.lock().await;
                    if let Some(progress) = table.get_mut(&command_id) {
                        progress.waiters.retain(|waiter| waiter.id != id);
                        progress.touched = Instant::now();
                    }
                }
                // A signal may have landed between the deadline and the removal.
                if let Ok(outcome) = rx.try_recv() {
                    return Ok(outcome);
                }
                metrics::counter!("wait_timeouts_total").increment(1);
                tracing::warn!(
                    %command_id,
                    timeout_ms = options.timeout.as_millis() as u64,
                    "wait timed out"
                );
                Err(WaitError::Timeout {
                    command_id,
                    stage: options.stage,
                    timeout: options.timeout,
                })
            }
        }
    }

    /// Records a signal and releases every waiter it satisfies.
    pub async fn notify(&self, signal: WaitSignal) {
        let mut table = self.progress.lock().await;
        self.purge_locked(&mut table);
        let progress = table
            .entry(signal.command_id)
            .or_insert_with(Progress::new);

        if progress.signals.iter().any(|seen| seen.is_duplicate_of(&signal)) {
            tracing::debug!(
                command_id = %signal.command_id,
                stage = %signal.stage,
                "duplicate signal dropped"
            );
            return;
        }

        progress.touched = Instant::now();
        let waiters = std::mem::take(&mut progress.waiters);
        for waiter in waiters {
            if waiter.options.is_satisfied_by(&signal) {
                let outcome = WaitOutcome::from_signal(waiter.options.stage, &signal);
                // The waiter may have given up already.
                let _ = waiter.reply.send(outcome);
            } else {
                progress.waiters.push(waiter);
            }
        }
        progress.signals.push(signal);
    }

    /// Drops settled progress older than the retention period.
    pub async fn purge_expired(&self) {
        let mut table = self.progress.lock().await;
        self.purge_locked(&mut table);
    }

    fn purge_locked(&self, table: &mut HashMap<CommandId, Progress>) {
        let retention = self.retention;
        table.retain(|_, progress| {
            !progress.waiters.is_empty() || progress.touched.elapsed() < retention
        });
    }

    /// Number of callers currently waiting.
    pub async fn pending_waiters(&self) -> usize {
        self.progress
            .lock()
            .await
            .values()
            .map(|progress| progress.waiters.len())
            .sum()
    }

    /// Number of commands with retained progress.
    pub async fn tracked_commands(&self) -> usize {
        self.progress.lock().await.len()
    }

    /// Feeds every signal from `bus` into this coordinator.
    ///
    /// `group` must be unique per process so each one sees every signal.
    pub async fn listen(
        &self,
        bus: Arc<SignalBus>,
        group: &str,
    ) -> Result<JoinHandle<()>, BusError> {
        let mut signals = bus.subscribe(SIGNAL_TOPIC, group).await?;
        let coordinator = self.clone();
        tracing::info!(group, "listening for wait signals");

        Ok(tokio::spawn(async move {
            while let Some(signal) = signals.next().await {
                coordinator.notify(signal).await;
            }
            tracing::debug!("signal stream ended");
        }))
    }
}

/// Publishes wait signals on the signal bus.
///
/// Emission is best effort: a lost signal makes a waiter time out, it never
/// fails the command that produced it.
#[derive(Clone)]
pub struct SignalEmitter {
    bus: Arc<SignalBus>,
}

impl SignalEmitter {
    pub fn new(bus: Arc<SignalBus>) -> Self {
        Self { bus }
    }

    pub async fn emit(&self, signal: WaitSignal) {
        let command_id = signal.command_id;
        let stage = signal.stage;
        if let Err(e) = self.bus.send(signal).await {
            tracing::warn!(%command_id, %stage, error = %e, "failed to emit wait signal");
        }
    }
}
