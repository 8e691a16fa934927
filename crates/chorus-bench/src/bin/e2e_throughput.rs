//! End-to-end throughput benchmark for Chorus.
//!
//! Connects N WebSocket clients to a running server, joins them all to one
//! channel and has each send chat messages as fast as the server accepts
//! them. Client `i` authenticates with the token `bench-token-{i}`, so the
//! server needs matching `[[directory.users]]` entries.
//!
//! ```bash
//! e2e_throughput [clients] [url]
//! ```

use chorus_protocol::{codec, ClientIntent, Encoding, Frame, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";
const CHANNEL: &str = "benchmark";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = args.get(2).cloned().unwrap_or_else(|| DEFAULT_URL.to_string());

    println!("Chorus end-to-end throughput benchmark");
    println!("  Server: {url}");
    println!("  Clients: {num_clients}, warmup {WARMUP_SECS}s, measurement {BENCH_SECS}s");
    println!();

    let received = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();
    for client_id in 0..num_clients {
        let received = Arc::clone(&received);
        let barrier = Arc::clone(&barrier);
        let url = url.clone();

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(&url, client_id, received, barrier).await {
                eprintln!("Client {client_id} error: {e}");
            }
        }));
    }

    // Wait for all clients to join
    barrier.wait().await;
    println!("All {num_clients} clients joined #{CHANNEL}");

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    received.store(0, Ordering::SeqCst);
    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;
    let elapsed = start.elapsed();
    let total = received.load(Ordering::SeqCst);

    let per_sec = total as f64 / elapsed.as_secs_f64();
    println!();
    println!("Results");
    println!("  Duration:          {:>10.2}s", elapsed.as_secs_f64());
    println!("  Messages received: {total:>10}");
    println!("  Throughput:        {per_sec:>10.0} msg/s");
    println!("  Per client:        {:>10.0} msg/s", per_sec / num_clients as f64);

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    url: &str,
    client_id: usize,
    received: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(format!("{url}?token=bench-token-{client_id}")).await?;
    let (mut sender, mut receiver) = ws.split();

    let join = encode(&ClientIntent::join(CHANNEL))?;
    sender.send(join).await?;

    // Wait for the join to be confirmed
    while let Some(message) = receiver.next().await {
        if decode(&message?).is_some_and(|event| event.name() == "channel_joined") {
            break;
        }
    }

    barrier.wait().await;

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if decode(&message).is_some_and(|event| event.name() == "message_sent") {
                received.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    let chat = encode(&ClientIntent::send(CHANNEL, "x".repeat(64)))?;
    while sender.send(chat.clone()).await.is_ok() {
        // Small yield to not starve the receiver task
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}

fn encode(intent: &ClientIntent) -> Result<Message, BoxError> {
    match codec::encode(intent, Encoding::Json)? {
        Frame::Text(text) => Ok(Message::Text(text)),
        Frame::Binary(data) => Ok(Message::Binary(data.to_vec())),
    }
}

fn decode(message: &Message) -> Option<ServerEvent> {
    match message {
        Message::Text(text) => codec::decode(&Frame::Text(text.clone())).ok(),
        _ => None,
    }
}
