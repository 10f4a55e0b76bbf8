//! Latency benchmarks for Chorus.
//!
//! Measures a full round trip through the pumps and the hub over the
//! in-memory transport: peer send, inbound decode, fan-out, outbound write.

use chorus_bench::start_hub;
use chorus_core::{admit, PumpConfig};
use chorus_protocol::{codec, Envelope};
use chorus_transport::{memory, WireFrame};
use criterion::{criterion_group, criterion_main, Criterion};
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

fn payload(text: &str) -> String {
    let encoded = codec::encode(&Envelope::text(text)).unwrap();
    String::from_utf8(encoded.to_vec()).unwrap()
}

/// Echo latency for a room of `members` connections, measured at the sender.
fn round_trip(c: &mut Criterion, name: &str, members: usize) {
    let runtime = Runtime::new().unwrap();
    let text = payload(&"x".repeat(64));
    // Idle members never answer pings.
    let config = PumpConfig {
        read_timeout: Duration::from_secs(3600),
        ..PumpConfig::default()
    };

    let (hub, mut sender, mut others, _pumps) = runtime.block_on(async {
        let (hub, _task) = start_hub();
        let mut peers = Vec::new();
        let mut pumps = Vec::new();
        for i in 0..members {
            let (connection, peer) = memory::pair();
            let pump = admit(
                &hub,
                Box::new(connection),
                format!("user-{i}"),
                "bench",
                &config,
            )
            .await
            .unwrap();
            pumps.push(pump);
            peers.push(peer);
        }
        let mut sender = peers.remove(0);

        // Everything queued before the marker is a join event.
        sender.send_text(payload("warmup"));
        while let Some(WireFrame::Text(text)) = sender.recv_data().await {
            if text.contains("warmup") {
                break;
            }
        }
        (hub, sender, peers, pumps)
    });

    c.bench_function(name, |b| {
        b.iter_custom(|iters| {
            runtime.block_on(async {
                let start = Instant::now();
                for _ in 0..iters {
                    sender.send_text(text.clone());
                    while !matches!(sender.recv_data().await, Some(WireFrame::Text(_))) {}
                }
                let elapsed = start.elapsed();
                for peer in &mut others {
                    while peer.try_recv().is_some() {}
                }
                elapsed
            })
        });
    });

    hub.shutdown();
}

fn bench_echo_alone(c: &mut Criterion) {
    round_trip(c, "echo_1_member", 1);
}

fn bench_echo_small_room(c: &mut Criterion) {
    round_trip(c, "echo_10_members", 10);
}

criterion_group!(benches, bench_echo_alone, bench_echo_small_room);
criterion_main!(benches);
