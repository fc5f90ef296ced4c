//! Tile kernel micro-benchmarks
//!
//! Usage: cargo bench --bench tile_kernels

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;

use tilr::driver::{getrf_nopiv, Options};
use tilr::matrix::Matrix;
use tilr::prelude::ProcessGrid;

fn filled(n: i64, mb: i64) -> Matrix<f64> {
    let a = Matrix::<f64>::new(n, n, mb, ProcessGrid::solo()).unwrap();
    for c in 0..n {
        for r in 0..n {
            // Diagonally dominant so no pivot degenerates.
            let v = if r == c { n as f64 } else { 1.0 / (1.0 + (r - c).abs() as f64) };
            a.set(r, c, v).unwrap();
        }
    }
    a
}

fn bench_getrf_nopiv(c: &mut Criterion) {
    let mut group = c.benchmark_group("getrf_nopiv");
    for &n in &[128i64, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_with_setup(
                || filled(n, 32),
                |a| {
                    let report = getrf_nopiv(&a, &Options::new()).unwrap();
                    black_box(report);
                },
            );
        });
    }
    group.finish();
}

fn bench_lookahead(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookahead");
    for &l in &[0i64, 1, 2] {
        group.bench_with_input(BenchmarkId::from_parameter(l), &l, |b, &l| {
            b.iter_with_setup(
                || filled(256, 32),
                |a| {
                    let opts = Options::new().with_lookahead(l);
                    black_box(getrf_nopiv(&a, &opts).unwrap());
                },
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_getrf_nopiv, bench_lookahead);
criterion_main!(benches);
