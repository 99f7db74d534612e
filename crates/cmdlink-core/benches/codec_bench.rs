//! Criterion benchmarks for the envelope wire codec.
//!
//! Measures encoding and decoding latency for every payload kind, plus the
//! full encode+decode round trip for the shapes the runtimes send most.
//!
//! Run with:
//! ```bash
//! cargo bench --package cmdlink-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Map};

use cmdlink_core::protocol::codec::{decode_envelope, encode_envelope, encode_frame};
use cmdlink_core::protocol::envelope::{Command, CommandEnvelope, Payload};

// ── Envelope fixtures ─────────────────────────────────────────────────────────

fn make_no_data() -> CommandEnvelope {
    Command::new("ping", Payload::None).envelope()
}

fn make_short_text() -> CommandEnvelope {
    Command::new("print", Payload::Text("Hello".to_string())).envelope()
}

fn make_long_text() -> CommandEnvelope {
    Command::new("log-line", Payload::Text("x".repeat(4096))).envelope()
}

fn make_json_object() -> CommandEnvelope {
    let mut map = Map::new();
    map.insert("os_name".to_string(), json!("linux"));
    map.insert("os_user".to_string(), json!("bench"));
    map.insert("working_dir".to_string(), json!("/srv/cmdlink"));
    map.insert("home_dir".to_string(), json!("/home/bench"));
    map.insert("clock_nanos".to_string(), json!(1_700_000_000_000_000_000i64));
    Command::new("sys/introduce", Payload::JsonObject(map)).envelope()
}

fn make_json_array_10() -> CommandEnvelope {
    let items = (0..10).map(|i| json!({"index": i, "value": "item"})).collect();
    Command::new("batch", Payload::JsonArray(items)).envelope()
}

fn make_binary_1k() -> CommandEnvelope {
    let bytes: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
    Command::new("blob", Payload::Binary(bytes)).envelope()
}

fn fixtures() -> Vec<(&'static str, CommandEnvelope)> {
    vec![
        ("NoData", make_no_data()),
        ("Text(5)", make_short_text()),
        ("Text(4096)", make_long_text()),
        ("JsonObject", make_json_object()),
        ("JsonArray(10)", make_json_array_10()),
        ("Binary(1024)", make_binary_1k()),
    ]
}

// ── Benchmark groups ──────────────────────────────────────────────────────────

/// Benchmarks `encode_envelope` for every payload shape.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_envelope");
    for (name, envelope) in fixtures() {
        group.bench_with_input(BenchmarkId::new("payload", name), &envelope, |b, envelope| {
            b.iter(|| encode_envelope(black_box(envelope)).expect("encode must succeed"))
        });
    }
    group.finish();
}

/// Benchmarks `decode_envelope` from pre-encoded wire strings.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_envelope");
    for (name, envelope) in fixtures() {
        let text = encode_envelope(&envelope).expect("encode must succeed for benchmark setup");
        group.bench_with_input(BenchmarkId::new("payload", name), &text, |b, text| {
            b.iter(|| decode_envelope(black_box(text)).expect("decode must succeed"))
        });
    }
    group.finish();
}

/// Benchmarks the full encode+frame+decode path for the hot shapes.
fn bench_roundtrip_hot_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_decode_roundtrip");

    // Short text: the typical user command.
    let text_envelope = make_short_text();
    group.bench_function("Text(5)", |b| {
        b.iter(|| {
            let text = encode_envelope(black_box(&text_envelope)).unwrap();
            let _frame = encode_frame(black_box(&text)).unwrap();
            decode_envelope(black_box(&text)).unwrap()
        })
    });

    // The introduce handshake object: sent once per connection.
    let handshake_envelope = make_json_object();
    group.bench_function("JsonObject", |b| {
        b.iter(|| {
            let text = encode_envelope(black_box(&handshake_envelope)).unwrap();
            let _frame = encode_frame(black_box(&text)).unwrap();
            decode_envelope(black_box(&text)).unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_roundtrip_hot_path);
criterion_main!(benches);
