//! Benchmarks for the packet codec and dedup cache.
//!
//! Run with: cargo bench --bench codec

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use weft::{dedup_key, DedupCache, Packet, PacketType, ShortId};

fn make_packet(payload_len: usize) -> Packet {
    Packet::broadcast(
        PacketType::Message,
        ShortId::from_bytes([7; 8]),
        1_700_000_000_000,
        vec![0xa5; payload_len],
    )
}

// ===== Packet Codec Benchmarks =====

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_encode");

    for &size in &[16usize, 180, 400, 4096] {
        let packet = make_packet(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &packet, |b, packet| {
            b.iter(|| black_box(packet.encode()))
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_decode");

    for &size in &[16usize, 180, 400, 4096] {
        let wire = make_packet(size).encode();
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, wire| {
            b.iter(|| black_box(Packet::decode(wire).unwrap()))
        });
    }

    group.finish();
}

// ===== Dedup Cache Benchmarks =====

fn populated_cache(n: u64) -> DedupCache {
    let mut cache = DedupCache::with_defaults();
    for i in 0..n {
        let packet = Packet::broadcast(
            PacketType::Message,
            ShortId::from_bytes([1; 8]),
            i,
            vec![],
        );
        cache.insert(dedup_key(&packet));
    }
    cache
}

fn bench_dedup(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup");

    let fresh = make_packet(0);

    // Insert into a cache with typical occupancy
    let base = populated_cache(2048);
    group.bench_function("insert_fresh", |b| {
        b.iter_batched(
            || populated_cache(2048),
            |mut cache| cache.insert(black_box(dedup_key(&fresh))),
            criterion::BatchSize::SmallInput,
        )
    });

    // The hot path: rejecting a duplicate
    let mut hot = populated_cache(2048);
    hot.insert(dedup_key(&fresh));
    group.bench_function("reject_duplicate", |b| {
        b.iter(|| hot.contains(black_box(&dedup_key(&fresh))))
    });

    let _ = base;
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_dedup);
criterion_main!(benches);
