//! Criterion benchmarks for chunk splitting and reassembly.
//!
//! Images and instrument dumps go through base64 chunking on every send, and
//! consumers reassemble them on every receive, so both paths scale with
//! payload size.
//!
//! Run with: cargo bench --bench chunking

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mdml_client::chunk::{chunk, ChunkEnvelope, Reassembler};

const CHUNK_SIZE: usize = 64 * 1024;

fn payload_sizes() -> Vec<(&'static str, usize)> {
    vec![
        ("16KB", 16 * 1024),
        ("256KB", 256 * 1024),
        ("1MB", 1024 * 1024),
        ("4MB", 4 * 1024 * 1024),
    ]
}

/// Encoding plus slicing, collected the way a sender drains the iterator.
fn chunk_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_split");
    for (name, size) in payload_sizes() {
        let payload = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &payload, |b, payload| {
            b.iter(|| {
                let parts: Vec<ChunkEnvelope> = chunk(black_box(payload.as_slice()), CHUNK_SIZE, "bench")
                    .unwrap()
                    .collect();
                black_box(parts);
            });
        });
    }
    group.finish();
}

/// Reassembly with parts arriving in reverse order.
fn reassemble_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_reassemble");
    for (name, size) in payload_sizes() {
        let mut parts: Vec<ChunkEnvelope> = chunk(vec![0x5Au8; size], CHUNK_SIZE, "bench")
            .unwrap()
            .collect();
        parts.reverse();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &parts, |b, parts| {
            b.iter(|| {
                let mut reassembler = Reassembler::new();
                let mut done = None;
                for part in parts.iter().cloned() {
                    done = reassembler.ingest(part).unwrap().or(done);
                }
                black_box(done);
            });
        });
    }
    group.finish();
}

/// Wire round trip of a single chunk message.
fn chunk_json(c: &mut Criterion) {
    let part = chunk(vec![0u8; CHUNK_SIZE], CHUNK_SIZE * 2, "bench")
        .unwrap()
        .next()
        .unwrap();
    let line = part.to_json().unwrap();

    c.bench_function("chunk_to_json", |b| {
        b.iter(|| black_box(part.to_json().unwrap()));
    });
    c.bench_function("chunk_from_json", |b| {
        b.iter(|| black_box(ChunkEnvelope::from_json(black_box(&line)).unwrap()));
    });
}

criterion_group!(benches, chunk_throughput, reassemble_throughput, chunk_json);
criterion_main!(benches);
