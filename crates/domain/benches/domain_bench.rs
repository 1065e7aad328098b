use criterion::{Criterion, criterion_group, criterion_main};
use domain::{
    AggregateProcessor, AggregateState, EmptyStateAggregateFactory, EventPayload,
    EventStoreStateAggregateRepository, SnapshotStateAggregateFactory, StateAggregate,
    StateAggregateMetadata, StateAggregateRepository,
};
use event_store::{InMemoryEventStore, InMemorySnapshotStore, SnapshotStore};
use messaging::CommandMessage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Incremented {
    by: i64,
}

impl EventPayload for Incremented {
    fn event_name(&self) -> &'static str {
        "Incremented"
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Counter {
    value: i64,
}

#[derive(Debug, thiserror::Error)]
#[error("never")]
struct Never;

impl AggregateState for Counter {
    type Event = Incremented;
    type Error = Never;

    fn metadata() -> StateAggregateMetadata {
        StateAggregateMetadata::new("bench", "counter")
    }

    fn apply(&mut self, event: Self::Event) {
        self.value += event.by;
    }
}

fn increment(
    _counter: &StateAggregate<Counter>,
    _command: &CommandMessage,
) -> Result<Vec<Incremented>, Never> {
    Ok(vec![Incremented { by: 1 }])
}

fn command() -> CommandMessage {
    CommandMessage::new(
        Counter::metadata().aggregate_id("c-1"),
        "Increment",
        serde_json::json!({}),
    )
}

fn seeded_store(rt: &tokio::runtime::Runtime, versions: usize) -> InMemoryEventStore {
    let store = InMemoryEventStore::new();
    let processor = AggregateProcessor::new(EventStoreStateAggregateRepository::new(
        EmptyStateAggregateFactory,
        store.clone(),
    ));
    rt.block_on(async {
        for _ in 0..versions {
            processor.process(&command(), increment).await.unwrap();
        }
    });
    store
}

fn bench_process_command(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let processor = AggregateProcessor::new(EventStoreStateAggregateRepository::new(
        EmptyStateAggregateFactory,
        InMemoryEventStore::new(),
    ));

    c.bench_function("domain/process_fresh_aggregate", |b| {
        b.iter(|| {
            rt.block_on(async {
                let command = CommandMessage::new(
                    Counter::metadata().aggregate_id(uuid_like()),
                    "Increment",
                    serde_json::json!({}),
                );
                processor.process(&command, increment).await.unwrap();
            });
        });
    });
}

fn uuid_like() -> String {
    common::CommandId::new().to_string()
}

fn bench_load(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = seeded_store(&rt, 500);
    let id = Counter::metadata().aggregate_id("c-1");

    let full = EventStoreStateAggregateRepository::new(EmptyStateAggregateFactory, store.clone());
    c.bench_function("domain/load_500_full_replay", |b| {
        b.iter(|| {
            rt.block_on(async {
                full.load_latest::<Counter>(&id).await.unwrap();
            });
        });
    });

    let snapshots = InMemorySnapshotStore::new();
    rt.block_on(async {
        let at = full
            .load::<Counter>(&id, event_store::Version::new(490))
            .await
            .unwrap();
        snapshots.save(at.to_snapshot().unwrap().unwrap()).await.unwrap();
    });
    let seeded = EventStoreStateAggregateRepository::new(
        SnapshotStateAggregateFactory::new(snapshots),
        store,
    );
    c.bench_function("domain/load_500_from_snapshot", |b| {
        b.iter(|| {
            rt.block_on(async {
                seeded.load_latest::<Counter>(&id).await.unwrap();
            });
        });
    });
}

criterion_group!(benches, bench_process_command, bench_load);
criterion_main!(benches);
