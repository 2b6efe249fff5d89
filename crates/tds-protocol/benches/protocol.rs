//! Benchmarks for TDS header encoding and decoding.

#![allow(clippy::unwrap_used, missing_docs)]

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use tds_protocol::{
    PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType, SMP_HEADER_SIZE, SmpHeader,
    SmpType,
};

/// Benchmark packet header encoding.
fn bench_packet_header_encode(c: &mut Criterion) {
    let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 1000);

    c.bench_function("packet_header_encode", |b| {
        b.iter(|| {
            let mut raw = [0u8; PACKET_HEADER_SIZE];
            header.encode_into(&mut raw);
            black_box(raw)
        })
    });
}

/// Benchmark packet header decoding.
fn bench_packet_header_decode(c: &mut Criterion) {
    let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 1000);
    let mut raw = [0u8; PACKET_HEADER_SIZE];
    header.encode_into(&mut raw);

    c.bench_function("packet_header_decode", |b| {
        b.iter(|| {
            let mut cursor = &raw[..];
            let decoded = PacketHeader::decode(&mut cursor).unwrap();
            black_box(decoded)
        })
    });
}

/// Benchmark SMP header encode/decode, paid once per MARS frame.
fn bench_smp_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("smp_header");
    let header = SmpHeader::new(SmpType::Data, 3, 4096 + 16, 42, 46);

    group.bench_function("encode", |b| {
        b.iter(|| {
            let mut raw = [0u8; SMP_HEADER_SIZE];
            header.encode_into(&mut raw);
            black_box(raw)
        })
    });

    let mut raw = [0u8; SMP_HEADER_SIZE];
    header.encode_into(&mut raw);
    group.bench_function("decode", |b| {
        b.iter(|| {
            let decoded = SmpHeader::decode(&mut &raw[..]).unwrap();
            black_box(decoded)
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_packet_header_encode,
    bench_packet_header_decode,
    bench_smp_header,
);
criterion_main!(benches);
