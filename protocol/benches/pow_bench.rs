// Proof-of-work benchmarks for the murmur admission puzzle.
//
// Covers mining at the difficulties an experiment actually uses and
// verification, which runs on every HELLO a node receives.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use murmur_protocol::pow::{produce, verify};

fn bench_produce(c: &mut Criterion) {
    let mut group = c.benchmark_group("pow/produce");
    for k in [1u32, 2, 3] {
        group.bench_with_input(BenchmarkId::from_parameter(k), &k, |b, &k| {
            b.iter(|| produce("bench-node-id", k));
        });
    }
    group.finish();
}

fn bench_verify(c: &mut Criterion) {
    let proof = produce("bench-node-id", 3);
    c.bench_function("pow/verify", |b| {
        b.iter(|| verify(&proof, "bench-node-id", 3));
    });
}

criterion_group!(benches, bench_produce, bench_verify);
criterion_main!(benches);
