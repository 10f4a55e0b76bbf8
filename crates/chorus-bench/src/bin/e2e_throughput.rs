//! End-to-end throughput benchmark for Chorus.
//!
//! Connects many WebSocket clients to one room of a running server and counts
//! delivered envelopes. Start the server first: `cargo run --release -p chorus-server`.
//!
//! Usage: `e2e_throughput [clients] [url]`

use chorus_protocol::{codec, Envelope};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";
const ROOM: &str = "benchmark";
const USER_HEADER: &str = "x-user-id";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = args.get(2).cloned().unwrap_or_else(|| DEFAULT_URL.to_string());

    println!("Chorus end-to-end throughput");
    println!("  server:  {url}");
    println!("  room:    {ROOM}");
    println!("  clients: {num_clients}");
    println!("  warmup {WARMUP_SECS}s, measurement {BENCH_SECS}s");
    println!();

    run_room_benchmark(&url, num_clients).await;
}

async fn run_room_benchmark(url: &str, num_clients: usize) {
    let message_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();
    for client_id in 0..num_clients {
        let msg_count = Arc::clone(&message_count);
        let barrier = Arc::clone(&barrier);
        let url = url.to_string();

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(&url, client_id, msg_count, barrier).await {
                eprintln!("Client {client_id} error: {e}");
            }
        }));
    }

    // Wait for all clients to join
    barrier.wait().await;
    println!("All {num_clients} clients joined");

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    message_count.store(0, Ordering::SeqCst);
    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_messages = message_count.load(Ordering::SeqCst);
    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();

    println!();
    println!("Results");
    println!("  duration:     {:>12.2}s", elapsed.as_secs_f64());
    println!("  delivered:    {:>12}", total_messages);
    println!("  throughput:   {:>12.0} msg/s", msgs_per_sec);
    println!("  per client:   {:>12.0} msg/s", msgs_per_sec / num_clients as f64);

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    url: &str,
    client_id: usize,
    message_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let mut request = format!("{url}?room_id={ROOM}").into_client_request()?;
    request
        .headers_mut()
        .insert(USER_HEADER, HeaderValue::from_str(&format!("bench-{client_id}"))?);

    let (ws, _) = connect_async(request).await?;
    let (mut sender, mut receiver) = ws.split();

    // The first frame carries our own join event.
    receiver.next().await;
    barrier.wait().await;

    let payload = String::from_utf8(codec::encode(&Envelope::text("x".repeat(64)))?.to_vec())?;

    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            if let Ok(Message::Text(text)) = result {
                if let Ok(batch) = codec::decode_batch(text.as_bytes()) {
                    message_count.fetch_add(batch.len() as u64, Ordering::Relaxed);
                }
            }
        }
    });

    // Send as fast as the server accepts
    loop {
        if sender.send(Message::text(payload.clone())).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
