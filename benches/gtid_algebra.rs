use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ers_coordinator::Position;

fn wide_position(n: usize) -> Position {
    let body: Vec<String> = (0..n)
        .map(|i| format!("{:08x}-0000-0000-0000-{:012x}:1-{}", i, i, 1000 + i))
        .collect();
    Position::parse(&format!("MySQL56/{}", body.join(","))).unwrap()
}

fn union_benchmark(c: &mut Criterion) {
    let a = wide_position(64);
    let b = wide_position(64);
    c.bench_function("position_union_64_sources", |bencher| {
        bencher.iter(|| Position::union(black_box(&a), black_box(&b)).unwrap())
    });
}

fn subset_benchmark(c: &mut Criterion) {
    let a = wide_position(64);
    let b = wide_position(64);
    c.bench_function("position_subset_64_sources", |bencher| {
        bencher.iter(|| Position::subset(black_box(&a), black_box(&b)).unwrap())
    });
}

fn subtract_benchmark(c: &mut Criterion) {
    let a = wide_position(64);
    let b = wide_position(32);
    c.bench_function("position_subtract_64_vs_32_sources", |bencher| {
        bencher.iter(|| Position::subtract(black_box(&a), black_box(&b)).unwrap())
    });
}

criterion_group!(benches, union_benchmark, subset_benchmark, subtract_benchmark);
criterion_main!(benches);
