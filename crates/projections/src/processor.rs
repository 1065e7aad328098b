//! Feeds domain event streams from the bus to projections.

use std::collections::HashMap;
use std::sync::Arc;

use common::AggregateId;
use event_store::{DomainEventStream, EventStore, Version};
use futures_util::{StreamExt, TryStreamExt};
use messaging::{BusError, DomainEventBus, Message, SignalEmitter, WaitSignal};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::Result;
use crate::projection::Projection;

/// Per-lane queue depth of the live delivery workers.
const LANE_QUEUE: usize = 256;

/// Last handled version of one aggregate for one projection.
type Cursor = Arc<Mutex<Version>>;
type Cursors = HashMap<(String, AggregateId), Cursor>;

/// Delivers streams to projections exactly once per projection and aggregate.
///
/// The processor supports:
/// - Live delivery: subscribes to a context's domain event bus
/// - Gap repair: a stream that skips versions triggers a catch-up from the
///   event store for the missing ones
/// - Rebuild: resets all projections and replays the given aggregates
///
/// Each (projection, aggregate) pair has its own cursor. A projection sees
/// one aggregate's streams in version order while other aggregates are
/// handled concurrently.
///
/// After a projection handles a stream, live or replayed, it emits a
/// `PROJECTED` or `EVENT_HANDLED` signal naming this processor's context and
/// the projection.
pub struct ProjectionProcessor<E: EventStore> {
    context_name: String,
    group: String,
    workers: usize,
    store: E,
    projections: Vec<Arc<dyn Projection>>,
    cursors: Mutex<Cursors>,
    emitter: Option<SignalEmitter>,
}

impl<E: EventStore> ProjectionProcessor<E> {
    /// Creates a processor for `context_name` reading history from `store`.
    pub fn new(context_name: impl Into<String>, store: E) -> Self {
        let context_name = context_name.into();
        Self {
            group: format!("{context_name}.projections"),
            context_name,
            workers: 4,
            store,
            projections: Vec::new(),
            cursors: Mutex::new(HashMap::new()),
            emitter: None,
        }
    }

    pub fn with_emitter(mut self, emitter: SignalEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Consumer group used on the event bus.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Number of tasks live streams are spread over by partition lane.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Registers a projection with this processor.
    pub fn register(&mut self, projection: Arc<dyn Projection>) {
        self.projections.push(projection);
    }

    /// Returns the number of registered projections.
    pub fn projection_count(&self) -> usize {
        self.projections.len()
    }

    pub fn context_name(&self) -> &str {
        &self.context_name
    }

    /// Last version of `aggregate_id` the named projection has handled.
    pub async fn position(&self, projection: &str, aggregate_id: &AggregateId) -> Version {
        let cursor = self
            .cursors
            .lock()
            .await
            .get(&(projection.to_string(), aggregate_id.clone()))
            .cloned();
        match cursor {
            Some(cursor) => *cursor.lock().await,
            None => Version::initial(),
        }
    }

    /// Delivers a single stream to every interested projection.
    #[tracing::instrument(
        skip(self, stream),
        fields(aggregate_id = %stream.aggregate_id, version = %stream.version)
    )]
    pub async fn process_stream(&self, stream: &DomainEventStream) -> Result<()> {
        let named = stream.aggregate_id.named_aggregate();
        for projection in &self.projections {
            if projection.handles(&named) {
                self.deliver(projection.as_ref(), stream).await?;
            }
        }
        Ok(())
    }

    /// Brings every projection up to date with the stored history of
    /// `aggregate_id`.
    #[tracing::instrument(skip(self), fields(aggregate_id = %aggregate_id))]
    pub async fn catch_up(&self, aggregate_id: &AggregateId) -> Result<()> {
        self.catch_up_all(aggregate_id, true).await
    }

    /// Resets all projections and replays the history of `aggregate_ids`.
    ///
    /// Replayed streams do not emit signals again.
    #[tracing::instrument(skip(self, aggregate_ids))]
    pub async fn rebuild_all(&self, aggregate_ids: &[AggregateId]) -> Result<()> {
        for projection in &self.projections {
            projection.reset().await?;
        }
        self.cursors.lock().await.clear();
        for aggregate_id in aggregate_ids {
            self.catch_up_all(aggregate_id, false).await?;
        }
        tracing::info!(aggregates = aggregate_ids.len(), "projections rebuilt");
        Ok(())
    }

    /// Subscribes to the domain streams of `source_context` and processes
    /// them until the subscription ends.
    ///
    /// Streams are routed to worker tasks by partition lane. A stream a
    /// projection fails on is logged and reported to waiters as failed;
    /// processing continues with the next stream.
    pub async fn start(
        self: Arc<Self>,
        event_bus: Arc<DomainEventBus>,
        source_context: &str,
    ) -> std::result::Result<JoinHandle<()>, BusError>
    where
        E: 'static,
    {
        let mut streams = event_bus.subscribe(source_context, &self.group).await?;
        tracing::info!(
            context = %self.context_name,
            source = source_context,
            group = %self.group,
            workers = self.workers,
            projections = self.projections.len(),
            "projection processor started"
        );

        let mut lanes = Vec::with_capacity(self.workers);
        let mut workers = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let (tx, mut rx) = mpsc::channel::<DomainEventStream>(LANE_QUEUE);
            let processor = Arc::clone(&self);
            lanes.push(tx);
            workers.push(tokio::spawn(async move {
                while let Some(stream) = rx.recv().await {
                    if let Err(e) = processor.process_stream(&stream).await {
                        tracing::error!(
                            aggregate_id = %stream.aggregate_id,
                            version = %stream.version,
                            error = %e,
                            "projection failed"
                        );
                    }
                }
            }));
        }

        Ok(tokio::spawn(async move {
            while let Some(stream) = streams.next().await {
                let lane = stream.partition_key().lane(lanes.len());
                if lanes[lane].send(stream).await.is_err() {
                    tracing::error!(lane, "projection worker is gone");
                }
            }
            drop(lanes);
            for worker in workers {
                let _ = worker.await;
            }
            tracing::info!(context = %self.context_name, "projection processor stopped");
        }))
    }

    async fn cursor(&self, projection: &str, aggregate_id: &AggregateId) -> Cursor {
        let mut cursors = self.cursors.lock().await;
        Arc::clone(
            cursors
                .entry((projection.to_string(), aggregate_id.clone()))
                .or_default(),
        )
    }

    async fn catch_up_all(&self, aggregate_id: &AggregateId, announce: bool) -> Result<()> {
        let named = aggregate_id.named_aggregate();
        for projection in &self.projections {
            if !projection.handles(&named) {
                continue;
            }
            let cursor = self.cursor(projection.name(), aggregate_id).await;
            let mut position = cursor.lock().await;
            self.replay(
                projection.as_ref(),
                aggregate_id,
                &mut position,
                Version::MAX,
                announce,
            )
            .await?;
        }
        Ok(())
    }

    async fn deliver(&self, projection: &dyn Projection, stream: &DomainEventStream) -> Result<()> {
        let cursor = self.cursor(projection.name(), &stream.aggregate_id).await;
        let mut position = cursor.lock().await;

        if stream.version <= *position {
            tracing::debug!(
                projection = projection.name(),
                position = %*position,
                "stream already handled"
            );
            drop(position);
            metrics::counter!("projections_duplicates_skipped").increment(1);
            self.signal(projection, stream, None).await;
            return Ok(());
        }

        if stream.version > position.next() {
            tracing::warn!(
                projection = projection.name(),
                position = %*position,
                received = %stream.version,
                "gap in delivered streams, catching up from the store"
            );
            let replayed = self
                .replay(
                    projection,
                    &stream.aggregate_id,
                    &mut position,
                    stream.version.previous(),
                    true,
                )
                .await;
            if let Err(e) = replayed {
                drop(position);
                self.signal(projection, stream, Some(e.to_string())).await;
                return Err(e);
            }
        }

        if let Err(e) = projection.handle(stream).await {
            drop(position);
            self.signal(projection, stream, Some(e.to_string())).await;
            return Err(e);
        }
        *position = stream.version;
        drop(position);

        metrics::counter!("projections_streams_processed").increment(1);
        self.signal(projection, stream, None).await;
        Ok(())
    }

    /// Replays stored streams after `position` up to `to` into one
    /// projection, advancing `position` after every handled stream.
    async fn replay(
        &self,
        projection: &dyn Projection,
        aggregate_id: &AggregateId,
        position: &mut Version,
        to: Version,
        announce: bool,
    ) -> Result<()> {
        let from = *position;
        let mut streams = self.store.load(aggregate_id, from.next(), to);
        while let Some(stream) = streams.try_next().await? {
            if let Err(e) = projection.handle(&stream).await {
                if announce {
                    self.signal(projection, &stream, Some(e.to_string())).await;
                }
                return Err(e);
            }
            *position = stream.version;
            metrics::counter!("projections_streams_processed").increment(1);
            if announce {
                self.signal(projection, &stream, None).await;
            }
        }
        tracing::debug!(
            projection = projection.name(),
            %from,
            position = %*position,
            "replayed stored streams"
        );
        Ok(())
    }

    async fn signal(
        &self,
        projection: &dyn Projection,
        stream: &DomainEventStream,
        error: Option<String>,
    ) {
        let Some(emitter) = &self.emitter else {
            return;
        };
        let mut signal = WaitSignal::new(
            stream.command_id,
            stream.aggregate_id.clone(),
            projection.kind().stage(),
        )
        .with_processor(self.context_name.clone(), projection.name())
        .with_version(stream.version);
        if let Some(error) = error {
            signal = signal.failed(error);
        }
        emitter.emit(signal).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProjectionError;
    use crate::projection::ProcessorKind;
    use async_trait::async_trait;
    use event_store::InMemoryEventStore;
    use messaging::{CommandStage, InMemoryMessageBus, MessageBus, SIGNAL_TOPIC};
    use std::time::Duration;
    use tokio::sync::RwLock;

    /// Records the versions it sees.
    struct RecordingProjection {
        name: &'static str,
        kind: ProcessorKind,
        seen: Arc<RwLock<Vec<i64>>>,
        fail_on: std::sync::Mutex<Option<i64>>,
    }

    impl RecordingProjection {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                kind: ProcessorKind::Projection,
                seen: Arc::default(),
                fail_on: std::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Projection for RecordingProjection {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> ProcessorKind {
            self.kind
        }

        async fn handle(&self, stream: &DomainEventStream) -> Result<()> {
            let fails = *self.fail_on.lock().unwrap() == Some(stream.version.as_i64());
            if fails {
                return Err(ProjectionError::Projection("boom".into()));
            }
            self.seen.write().await.push(stream.version.as_i64());
            Ok(())
        }

        async fn reset(&self) -> Result<()> {
            self.seen.write().await.clear();
            Ok(())
        }
    }

    fn order_id() -> AggregateId {
        AggregateId::new("sales", "order", "o-1")
    }

    fn stream(version: i64) -> DomainEventStream {
        DomainEventStream::builder()
            .aggregate_id(order_id())
            .version(Version::new(version))
            .event("Touched", serde_json::json!({ "n": version }))
            .build()
    }

    async fn store_with(versions: i64) -> InMemoryEventStore {
        let store = InMemoryEventStore::new();
        for version in 1..=versions {
            store
                .append(Version::new(version - 1), stream(version))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn redelivered_stream_is_handled_once() {
        let projection = RecordingProjection::new("orders");
        let seen = Arc::clone(&projection.seen);
        let mut processor = ProjectionProcessor::new("reporting", InMemoryEventStore::new());
        processor.register(Arc::new(projection));

        let first = stream(1);
        processor.process_stream(&first).await.unwrap();
        processor.process_stream(&first).await.unwrap();

        assert_eq!(*seen.read().await, vec![1]);
        assert_eq!(processor.position("orders", &order_id()).await, Version::first());
    }

    #[tokio::test]
    async fn gap_is_filled_from_the_store() {
        let store = store_with(3).await;
        let projection = RecordingProjection::new("orders");
        let seen = Arc::clone(&projection.seen);
        let mut processor = ProjectionProcessor::new("reporting", store.clone());
        processor.register(Arc::new(projection));

        processor.process_stream(&stream(1)).await.unwrap();
        // Version 2 was lost in transit.
        processor.process_stream(&stream(3)).await.unwrap();

        assert_eq!(*seen.read().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failed_replay_keeps_the_streams_it_handled() {
        let store = store_with(4).await;
        let signals = InMemoryMessageBus::<WaitSignal>::new(4);
        let mut received = signals.subscribe(SIGNAL_TOPIC, "test").await.unwrap();
        let projection = Arc::new(RecordingProjection::new("orders"));
        *projection.fail_on.lock().unwrap() = Some(3);
        let mut processor = ProjectionProcessor::new("reporting", store)
            .with_emitter(SignalEmitter::new(Arc::new(signals.clone())));
        processor.register(Arc::clone(&projection) as Arc<dyn Projection>);

        processor.process_stream(&stream(1)).await.unwrap();
        // Versions 2 and 3 were lost in transit and version 3 cannot be handled yet.
        assert!(processor.process_stream(&stream(4)).await.is_err());
        assert_eq!(*projection.seen.read().await, vec![1, 2]);
        assert_eq!(processor.position("orders", &order_id()).await, Version::new(2));

        let mut outcomes = Vec::new();
        for _ in 0..4 {
            let signal = received.next().await.unwrap();
            outcomes.push((signal.version, signal.succeeded()));
        }
        outcomes.sort();
        assert_eq!(
            outcomes,
            vec![
                (Some(Version::new(1)), true),
                (Some(Version::new(2)), true),
                (Some(Version::new(3)), false),
                (Some(Version::new(4)), false),
            ]
        );

        *projection.fail_on.lock().unwrap() = None;
        processor.process_stream(&stream(4)).await.unwrap();
        assert_eq!(*projection.seen.read().await, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn slow_aggregate_does_not_block_others() {
        struct Gated {
            gate: Arc<tokio::sync::Notify>,
            seen: Arc<RwLock<Vec<String>>>,
        }

        #[async_trait]
        impl Projection for Gated {
            fn name(&self) -> &str {
                "orders"
            }

            async fn handle(&self, stream: &DomainEventStream) -> Result<()> {
                if stream.aggregate_id.id == "o-slow" {
                    self.gate.notified().await;
                }
                self.seen.write().await.push(stream.aggregate_id.id.clone());
                Ok(())
            }

            async fn reset(&self) -> Result<()> {
                Ok(())
            }
        }

        let gate = Arc::new(tokio::sync::Notify::new());
        let seen = Arc::new(RwLock::new(Vec::new()));
        let mut processor = ProjectionProcessor::new("reporting", InMemoryEventStore::new());
        processor.register(Arc::new(Gated {
            gate: Arc::clone(&gate),
            seen: Arc::clone(&seen),
        }));
        let processor = Arc::new(processor);

        let slow = DomainEventStream::builder()
            .aggregate_id(AggregateId::new("sales", "order", "o-slow"))
            .version(Version::first())
            .event("Touched", serde_json::json!({}))
            .build();
        let blocked = {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move { processor.process_stream(&slow).await })
        };
        tokio::task::yield_now().await;

        tokio::time::timeout(Duration::from_secs(5), processor.process_stream(&stream(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*seen.read().await, vec!["o-1".to_string()]);

        gate.notify_one();
        blocked.await.unwrap().unwrap();
        assert_eq!(*seen.read().await, vec!["o-1".to_string(), "o-slow".to_string()]);
    }

    #[tokio::test]
    async fn catch_up_and_rebuild() {
        let store = store_with(4).await;
        let projection = RecordingProjection::new("orders");
        let seen = Arc::clone(&projection.seen);
        let mut processor = ProjectionProcessor::new("reporting", store);
        processor.register(Arc::new(projection));

        processor.process_stream(&stream(1)).await.unwrap();
        processor.catch_up(&order_id()).await.unwrap();
        assert_eq!(*seen.read().await, vec![1, 2, 3, 4]);

        processor.rebuild_all(&[order_id()]).await.unwrap();
        assert_eq!(*seen.read().await, vec![1, 2, 3, 4]);
        assert_eq!(processor.position("orders", &order_id()).await, Version::new(4));
    }

    #[tokio::test]
    async fn projections_only_see_relevant_aggregates() {
        struct InvoicesOnly(Arc<RwLock<Vec<i64>>>);

        #[async_trait]
        impl Projection for InvoicesOnly {
            fn name(&self) -> &str {
                "invoices"
            }

            fn handles(&self, aggregate: &common::NamedAggregate) -> bool {
                aggregate.aggregate_name == "invoice"
            }

            async fn handle(&self, stream: &DomainEventStream) -> Result<()> {
                self.0.write().await.push(stream.version.as_i64());
                Ok(())
            }

            async fn reset(&self) -> Result<()> {
                Ok(())
            }
        }

        let seen = Arc::new(RwLock::new(Vec::new()));
        let mut processor = ProjectionProcessor::new("reporting", InMemoryEventStore::new());
        processor.register(Arc::new(InvoicesOnly(Arc::clone(&seen))));

        processor.process_stream(&stream(1)).await.unwrap();
        assert!(seen.read().await.is_empty());
    }

    #[tokio::test]
    async fn failure_keeps_position_and_reports_signal() {
        let signals = InMemoryMessageBus::<WaitSignal>::new(4);
        let mut received = signals.subscribe(SIGNAL_TOPIC, "test").await.unwrap();
        let projection = RecordingProjection::new("orders");
        *projection.fail_on.lock().unwrap() = Some(1);
        let mut processor = ProjectionProcessor::new("reporting", InMemoryEventStore::new())
            .with_emitter(SignalEmitter::new(Arc::new(signals.clone())));
        processor.register(Arc::new(projection));

        let result = processor.process_stream(&stream(1)).await;
        assert!(result.is_err());
        assert_eq!(processor.position("orders", &order_id()).await, Version::initial());

        let signal = received.next().await.unwrap();
        assert_eq!(signal.stage, CommandStage::Projected);
        assert!(!signal.succeeded());
    }

    #[tokio::test]
    async fn bus_driven_processing_emits_named_signals() {
        let events = InMemoryMessageBus::<DomainEventStream>::new(4);
        let signals = InMemoryMessageBus::<WaitSignal>::new(4);
        let mut received = signals.subscribe(SIGNAL_TOPIC, "test").await.unwrap();

        let mut handler = RecordingProjection::new("mailer");
        handler.kind = ProcessorKind::EventHandler;
        let mut processor = ProjectionProcessor::new("notifications", InMemoryEventStore::new())
            .with_emitter(SignalEmitter::new(Arc::new(signals.clone())));
        processor.register(Arc::new(handler));
        Arc::new(processor)
            .start(Arc::new(events.clone()), "sales")
            .await
            .unwrap();

        let sent = stream(1);
        events.send(sent.clone()).await.unwrap();

        let signal = tokio::time::timeout(Duration::from_secs(5), received.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.command_id, sent.command_id);
        assert_eq!(signal.stage, CommandStage::EventHandled);
        assert_eq!(signal.context_name, "notifications");
        assert_eq!(signal.processor_name, "mailer");
    }
}
