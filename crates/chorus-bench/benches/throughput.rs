//! Throughput benchmarks for Chorus.
//!
//! These benchmarks measure fan-out cost at the room and hub level.

use chorus_bench::start_hub;
use chorus_core::{validate, ConnectionHandle, Room};
use chorus_protocol::Envelope;
use chorus_transport::ConnectionId;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::Receiver;

fn sample() -> Arc<Envelope> {
    Arc::new(Envelope::text("x".repeat(64)).with_origin("bench", "bench-user"))
}

fn members(count: usize, capacity: usize) -> (Vec<ConnectionHandle>, Vec<Receiver<Arc<Envelope>>>) {
    (0..count)
        .map(|i| {
            ConnectionHandle::new(
                ConnectionId::from(format!("conn-{i}").as_str()),
                format!("user-{i}"),
                "bench",
                capacity,
            )
        })
        .unzip()
}

/// Fan-out inside a single room, without the hub task.
fn bench_room_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("room_fan_out");

    for size in [10, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let (handles, mut queues) = members(size, 16);
            let mut room = Room::new("bench");
            for handle in handles {
                room.insert(handle);
            }
            let envelope = sample();

            b.iter(|| {
                let report = room.fan_out(black_box(&envelope));
                for queue in &mut queues {
                    let _ = queue.try_recv();
                }
                report.delivered
            });
        });
    }

    group.finish();
}

/// Broadcast through the hub task to every member of a room.
fn bench_hub_broadcast(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("hub_broadcast");

    for size in [10, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let (hub, mut queues) = runtime.block_on(async {
                let (hub, _task) = start_hub();
                // Room for every join event queued during registration.
                let (handles, mut queues) = members(size, size + 64);
                for handle in handles {
                    hub.register(handle).await.unwrap();
                }
                hub.stats().await.unwrap();
                for queue in &mut queues {
                    while queue.try_recv().is_ok() {}
                }
                (hub, queues)
            });

            b.iter_custom(|iters| {
                runtime.block_on(async {
                    let start = Instant::now();
                    for _ in 0..iters {
                        let envelope = Envelope::text("tick").with_origin("bench", "server");
                        hub.broadcast(envelope).unwrap();
                        for queue in &mut queues {
                            queue.recv().await.unwrap();
                        }
                    }
                    start.elapsed()
                })
            });

            hub.shutdown();
        });
    }

    group.finish();
}

/// Payload classification and field checks.
fn bench_validate(c: &mut Criterion) {
    let mut group = c.benchmark_group("validate");

    let text = Envelope::text("hello").with_origin("bench", "bench-user");
    group.bench_function("text", |b| b.iter(|| validate(black_box(&text)).is_valid()));

    let video = Envelope::new(
        "video",
        json!({ "video": {
            "url": "https://cdn.example/v.mp4",
            "name": "v.mp4",
            "format": "mp4",
            "size": 1024,
            "duration": 12.5
        } }),
    )
    .with_origin("bench", "bench-user");
    group.bench_function("video", |b| b.iter(|| validate(black_box(&video)).is_valid()));

    let unknown = Envelope::new("typing", json!({})).with_origin("bench", "bench-user");
    group.bench_function("unclassified", |b| {
        b.iter(|| validate(black_box(&unknown)).is_valid())
    });

    group.finish();
}

criterion_group!(benches, bench_room_fan_out, bench_hub_broadcast, bench_validate);
criterion_main!(benches);
