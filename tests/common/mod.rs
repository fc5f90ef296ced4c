//! Common test utilities
#![allow(dead_code)]

use std::sync::Arc;
use std::thread;

use tilr::comm::{LocalCluster, ProcessGrid};
use tilr::matrix::Matrix;
use tilr::scalar::Scalar;

/// Run one closure per rank of a p x q grid over an in-process cluster,
/// one thread per rank, and collect the per-rank results in rank order.
pub fn run_on_grid<F, T>(p: usize, q: usize, f: F) -> Vec<T>
where
    F: Fn(ProcessGrid) -> T + Send + Sync,
    T: Send,
{
    let cluster = LocalCluster::new(p * q);
    thread::scope(|s| {
        let handles: Vec<_> = (0..p * q)
            .map(|r| {
                let grid = ProcessGrid::new(p, q, Arc::new(cluster.transport(r))).unwrap();
                let f = &f;
                s.spawn(move || f(grid))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Fill this rank's local elements of `a` from a row-major global array.
pub fn fill_local<S: Scalar>(a: &Matrix<S>, global: &[Vec<S>]) {
    let (m, n) = (a.m(), a.n());
    for r in 0..m {
        for c in 0..n {
            // Ignore non-resident elements; each rank fills what it owns.
            let _ = a.set(r, c, global[r as usize][c as usize]);
        }
    }
}

/// This rank's local tiles as (i, j, mb, nb, column-major payload).
pub fn gather_local(a: &Matrix<f64>) -> Vec<(i64, i64, i64, i64, Vec<f64>)> {
    a.local_tiles()
        .into_iter()
        .map(|(i, j)| {
            let t = a.tile(i, j).unwrap();
            (i, j, t.mb(), t.nb(), t.pack())
        })
        .collect()
}

/// Reassemble a row-major global matrix from every rank's local tiles.
pub fn assemble(
    parts: &[Vec<(i64, i64, i64, i64, Vec<f64>)>],
    m: usize,
    n: usize,
    mb: usize,
) -> Vec<Vec<f64>> {
    let mut out = vec![vec![0.0; n]; m];
    for rank_tiles in parts {
        for (i, j, tmb, tnb, payload) in rank_tiles {
            for c in 0..*tnb {
                for r in 0..*tmb {
                    let gr = *i as usize * mb + r as usize;
                    let gc = *j as usize * mb + c as usize;
                    out[gr][gc] = payload[(r + c * tmb) as usize];
                }
            }
        }
    }
    out
}

/// L * U from an overwritten factor (L unit lower, U upper).
pub fn lu_reconstruct(lu: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let m = lu.len();
    let n = lu[0].len();
    let mut out = vec![vec![0.0; n]; m];
    for r in 0..m {
        for c in 0..n {
            let mut acc = 0.0;
            for l in 0..=r.min(c) {
                let lv = if l == r { 1.0 } else { lu[r][l] };
                acc += lv * lu[l][c];
            }
            out[r][c] = acc;
        }
    }
    out
}

/// Matrix 1-norm (maximum absolute column sum).
pub fn one_norm(a: &[Vec<f64>]) -> f64 {
    let n = a[0].len();
    (0..n)
        .map(|c| a.iter().map(|row| row[c].abs()).sum::<f64>())
        .fold(0.0, f64::max)
}

/// Largest absolute elementwise difference.
pub fn max_abs_diff(a: &[Vec<f64>], b: &[Vec<f64>]) -> f64 {
    let mut worst: f64 = 0.0;
    for (ra, rb) in a.iter().zip(b) {
        for (x, y) in ra.iter().zip(rb) {
            worst = worst.max((x - y).abs());
        }
    }
    worst
}

/// Assert two global matrices agree within `tol` elementwise.
pub fn assert_allclose(a: &[Vec<f64>], b: &[Vec<f64>], tol: f64, msg: &str) {
    let diff = max_abs_diff(a, b);
    assert!(diff <= tol, "{msg}: max |diff| = {diff:e} > {tol:e}");
}
