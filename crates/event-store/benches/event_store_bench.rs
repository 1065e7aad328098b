use common::AggregateId;
use criterion::{Criterion, criterion_group, criterion_main};
use event_store::{DomainEventStream, EventStoreExt, InMemoryEventStore, Version, store::EventStore};

fn make_stream(aggregate_id: &AggregateId, version: i64) -> DomainEventStream {
    DomainEventStream::builder()
        .aggregate_id(aggregate_id.clone())
        .version(Version::new(version))
        .event(
            "ItemAdded",
            serde_json::json!({
                "order_id": aggregate_id.id,
                "sku": "SKU-1",
                "quantity": 1
            }),
        )
        .build()
}

fn populate(rt: &tokio::runtime::Runtime, store: &InMemoryEventStore, n: i64) -> AggregateId {
    let aggregate_id = AggregateId::generate("sales", "order");
    rt.block_on(async {
        for version in 1..=n {
            store
                .append(Version::new(version - 1), make_stream(&aggregate_id, version))
                .await
                .unwrap();
        }
    });
    aggregate_id
}

fn bench_append_first_stream(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_store/append_first_stream", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                let aggregate_id = AggregateId::generate("sales", "order");
                store
                    .append(Version::initial(), make_stream(&aggregate_id, 1))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_append_onto_history(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_store/append_onto_100_streams", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                let aggregate_id = AggregateId::generate("sales", "order");
                for version in 1..=100 {
                    store
                        .append(Version::new(version - 1), make_stream(&aggregate_id, version))
                        .await
                        .unwrap();
                }
            });
        });
    });
}

fn bench_load_all(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new();
    let aggregate_id = populate(&rt, &store, 1000);

    c.bench_function("event_store/load_1000_streams", |b| {
        b.iter(|| {
            rt.block_on(async {
                let streams = store.collect_all(&aggregate_id).await.unwrap();
                assert_eq!(streams.len(), 1000);
            });
        });
    });
}

fn bench_load_tail(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new().with_page_size(10);
    let aggregate_id = populate(&rt, &store, 1000);

    c.bench_function("event_store/load_after_version_990", |b| {
        b.iter(|| {
            rt.block_on(async {
                use futures_util::TryStreamExt;

                let streams: Vec<_> = store
                    .load(&aggregate_id, Version::new(991), Version::MAX)
                    .try_collect()
                    .await
                    .unwrap();
                assert_eq!(streams.len(), 10);
            });
        });
    });
}

criterion_group!(
    benches,
    bench_append_first_stream,
    bench_append_onto_history,
    bench_load_all,
    bench_load_tail,
);
criterion_main!(benches);
