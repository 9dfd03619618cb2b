// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use bytes::Bytes;
use chronicle_store::{
    AppendCoordinator, Event, EventId, ExpectedVersion, IndexConfig, Log, LogConfig, MetadataStore,
    StoreConfig, StoreMetrics, StreamId, StreamIndex,
};
use chronicle_store::append::commit_bus::CommitBus;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};

struct BenchFixture {
    _dir: tempfile::TempDir,
    coordinator: Arc<AppendCoordinator>,
}

impl BenchFixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Log::open(dir.path(), LogConfig::default()).unwrap());
        let index = Arc::new(StreamIndex::open(&dir.path().join("index"), IndexConfig::default()).unwrap());
        let metadata = Arc::new(MetadataStore::new());
        let commit_bus = CommitBus::new();
        let metrics = Arc::new(StoreMetrics::new_for_test());
        let coordinator = Arc::new(AppendCoordinator::new(
            log,
            index,
            metadata,
            commit_bus,
            StoreConfig::default(),
            metrics,
        ));
        BenchFixture {
            _dir: dir,
            coordinator,
        }
    }
}

fn make_events(count: usize, payload_len: usize) -> Vec<Event> {
    let data = Bytes::from(vec![b'x'; payload_len]);
    (0..count)
        .map(|_| Event::new(EventId::new_v4(), "Appended", data.clone()))
        .collect()
}

fn append_single_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_single_stream");
    for batch_size in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_function(format!("batch_{batch_size}"), |b| {
            b.iter_batched(
                || (BenchFixture::new(), StreamId::new("orders-1").unwrap()),
                |(fixture, stream_id)| {
                    let events = make_events(batch_size, 128);
                    fixture
                        .coordinator
                        .append(&stream_id, ExpectedVersion::Any, events)
                        .unwrap();
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn append_many_streams(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_many_streams");
    group.throughput(Throughput::Elements(1));
    group.bench_function("round_robin_1000_streams", |b| {
        b.iter_batched(
            || {
                let fixture = BenchFixture::new();
                let streams: Vec<StreamId> =
                    (0..1000).map(|i| StreamId::new(format!("stream-{i}")).unwrap()).collect();
                (fixture, streams)
            },
            |(fixture, streams)| {
                for stream_id in &streams {
                    fixture
                        .coordinator
                        .append(stream_id, ExpectedVersion::Any, make_events(1, 128))
                        .unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

criterion_group!(append_benches, append_single_stream, append_many_streams);
criterion_main!(append_benches);
