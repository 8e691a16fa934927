//! Codec benchmarks for chorus-protocol.

use chorus_protocol::events::{ChatMessage, EventPayload};
use chorus_protocol::{codec, ClientIntent, Encoding, ServerEvent};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn chat_event(size: usize) -> ServerEvent {
    ServerEvent::new(EventPayload::MessageSent(ChatMessage {
        message_id: 1,
        channel_id: "bench:channel".into(),
        user_id: "bench-user".into(),
        content: "x".repeat(size),
        created_at: 0,
    }))
}

fn bench_encode_event(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_event");

    for size in [64, 256, 1024, 4096] {
        let event = chat_event(size);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("json", size), &event, |b, event| {
            b.iter(|| codec::encode_event(black_box(event), Encoding::Json))
        });
        group.bench_with_input(BenchmarkId::new("msgpack", size), &event, |b, event| {
            b.iter(|| codec::encode_event(black_box(event), Encoding::MessagePack))
        });
    }

    group.finish();
}

fn bench_decode_intent(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_intent");

    let intent = ClientIntent::send("bench:channel", "x".repeat(256));
    for encoding in [Encoding::Json, Encoding::MessagePack] {
        let frame = codec::encode(&intent, encoding).unwrap();
        group.bench_function(format!("{:?}", encoding), |b| {
            b.iter(|| codec::decode_intent(black_box(&frame)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode_event, bench_decode_intent);
criterion_main!(benches);
