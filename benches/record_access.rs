//! Benchmarks for record field access and queue delivery
//!
//! Covers the hot paths of every handler:
//! - typed reads and writes through resolved fields
//! - dotted path resolution into nested batches
//! - serialization and zero-copy delivery through a message queue

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use trackline::icesat2::extent::{ATL03_REC_TYPE, Extent, PairExtent, Photon};
use trackline::msgq::{MsgQueues, Publisher, Subscriber, SubscriberKind, Timeout};
use trackline::record::{RecordObject, RecordRegistry, SerialMode};

fn photons(n: usize) -> Vec<Photon> {
    (0..n)
        .map(|i| Photon {
            delta_time: 1000.0 + i as f64 * 1.0e-4,
            latitude: 40.0 + i as f64 * 1.0e-6,
            longitude: -105.0,
            distance: i as f64 * 0.7 - 20.0,
            height: 100.0 + (i % 7) as f32,
            ..Photon::default()
        })
        .collect()
}

fn extent_record(registry: &RecordRegistry, n: usize) -> RecordObject {
    let pair = PairExtent { valid: true, photons: photons(n), ..PairExtent::default() };
    let extent = Extent {
        reference_pair_track: 1,
        spacecraft_orientation: 1,
        reference_ground_track: 123,
        cycle: 6,
        extent_id: 0,
        pairs: [pair.clone(), pair],
    };
    extent.to_record(registry).expect("extent record")
}

fn bench_field_access(c: &mut Criterion) {
    let registry = RecordRegistry::with_builtin_records().expect("registry");
    let mut rec = extent_record(&registry, 64);
    let field = rec.field("photons[32].height").expect("photon height");

    let mut group = c.benchmark_group("field_access");
    group.bench_function("typed_get", |b| b.iter(|| black_box(rec.get::<f32>(black_box(&field), 0).unwrap())));
    group.bench_function("value_at", |b| b.iter(|| black_box(rec.value_at(black_box(&field), 0).unwrap())));
    group.bench_function("resolve_path", |b| {
        b.iter(|| black_box(rec.definition().resolve(black_box("photons[17].latitude"))))
    });
    group.bench_function("typed_set", |b| b.iter(|| rec.set(black_box(&field), 0, black_box(101.5f32)).unwrap()));
    group.finish();
}

fn bench_extent_codec(c: &mut Criterion) {
    let registry = RecordRegistry::with_builtin_records().expect("registry");
    let rec = extent_record(&registry, 128);
    let wire = rec.serialize(SerialMode::Copy).into_owned();

    let mut group = c.benchmark_group("extent_codec");
    group.throughput(Throughput::Bytes(wire.len() as u64));
    group.bench_function("serialize", |b| b.iter(|| black_box(rec.serialize(SerialMode::Copy).len())));
    group.bench_function("deserialize", |b| {
        b.iter(|| black_box(RecordObject::deserialize(&registry, black_box(&wire)).unwrap()))
    });
    group.bench_function("decode_extent", |b| b.iter(|| black_box(Extent::from_record(black_box(&rec)).unwrap())));
    group.finish();
}

fn bench_queue_delivery(c: &mut Criterion) {
    let registry = RecordRegistry::with_builtin_records().expect("registry");
    let rec = extent_record(&registry, 128);
    let bytes = rec.to_bytes(rec.allocated_size());
    let queues = Arc::new(MsgQueues::new());
    let publisher = Publisher::new(&queues, "bench");
    let mut subscriber = Subscriber::new(&queues, "bench", SubscriberKind::Confidence);

    let mut group = c.benchmark_group("queue_delivery");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("post_ref_receive", |b| {
        b.iter(|| {
            publisher.post_ref(bytes.clone(), Timeout::Never).unwrap();
            let msg = subscriber.receive_ref(Timeout::Never).unwrap();
            black_box(RecordObject::interface(&registry, msg.into_bytes()).unwrap().is_type(ATL03_REC_TYPE))
        })
    });
    group.finish();
}

criterion_group!(benches, bench_field_access, bench_extent_codec, bench_queue_delivery);
criterion_main!(benches);
