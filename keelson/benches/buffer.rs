//! Buffer hot-path micro-benchmarks: the append/consume cycle every
//! connection runs per readiness event, and the CRLF scan protocol
//! decoders lean on.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use keelson::Buffer;

fn bench_append_retrieve(c: &mut Criterion) {
    let payload = vec![0xabu8; 16 * 1024];
    let mut group = c.benchmark_group("buffer");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("append_retrieve_16k", |b| {
        let mut buf = Buffer::with_capacity(64 * 1024);
        b.iter(|| {
            buf.append(black_box(&payload));
            buf.retrieve(payload.len());
        });
    });
    group.finish();
}

fn bench_find_crlf(c: &mut Criterion) {
    let mut buf = Buffer::new();
    buf.append(&vec![b'x'; 4096]);
    buf.append(b"\r\n");
    c.bench_function("find_crlf_4k", |b| {
        b.iter(|| black_box(buf.find_crlf()));
    });
}

criterion_group!(benches, bench_append_retrieve, bench_find_crlf);
criterion_main!(benches);
