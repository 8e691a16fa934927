//! Latency benchmarks for Chorus.
//!
//! Measures intent-to-queue latency through the coordinator, and the same
//! path through a spawned hub.

use chorus_bench::Fixture;
use chorus_core::{Hub, HubConfig, InMemoryDirectory, NullMessageStore};
use chorus_protocol::ClientIntent;
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Instant;

/// Apply a message and take it from one recipient queue.
fn bench_state_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_latency");

    group.bench_function("two_members", |b| {
        let mut fixture = Fixture::channel("bench", 2);
        let sender = fixture.sender();

        b.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                fixture.state.handle(
                    sender,
                    ClientIntent::send("bench", "ping"),
                    tokio::time::Instant::now(),
                );
                let _ = fixture.sessions[1].1.try_recv();
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Submit through the intake and await delivery on the peer's queue.
fn bench_hub_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("hub_latency");
    let runtime = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("submit_to_receive", |b| {
        b.to_async(&runtime).iter_custom(|iters| async move {
            let hub = Hub::spawn(
                HubConfig::default(),
                Arc::new(InMemoryDirectory::new(true)),
                Arc::new(NullMessageStore),
            );
            let (alice, mut alice_rx) = hub.open("alice").await.unwrap();
            let (bob, mut bob_rx) = hub.open("bob").await.unwrap();
            alice.submit(ClientIntent::join("bench")).await.unwrap();
            bob.submit(ClientIntent::join("bench")).await.unwrap();
            // Ping is answered after the joins are applied.
            bob.submit(ClientIntent::Ping).await.unwrap();
            while bob_rx.recv().await.is_some_and(|event| event.name() != "pong") {}
            let _ = alice_rx.drain();

            let start = Instant::now();
            for _ in 0..iters {
                alice
                    .submit(ClientIntent::send("bench", "ping"))
                    .await
                    .unwrap();
                while bob_rx
                    .recv()
                    .await
                    .is_some_and(|event| event.name() != "message_sent")
                {}
            }
            let elapsed = start.elapsed();

            hub.shutdown().await.unwrap();
            elapsed
        });
    });

    group.finish();
}

criterion_group!(benches, bench_state_latency, bench_hub_latency);
criterion_main!(benches);
