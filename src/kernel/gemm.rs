//! Tile-local matrix multiply and its view-level adapter

use super::{Priority, Target};
use crate::error::Result;
use crate::matrix::Matrix;
use crate::scalar::Scalar;
use crate::tile::{Tile, TileLayout, HOST_DEVICE};

/// C <- alpha * A * B + beta * C on column-major host tiles
pub(crate) fn gemm_tile<S: Scalar>(alpha: S, a: &Tile<S>, b: &Tile<S>, beta: S, c: &Tile<S>) {
    debug_assert_eq!(a.layout(), TileLayout::ColMajor);
    debug_assert_eq!(b.layout(), TileLayout::ColMajor);
    debug_assert_eq!(c.layout(), TileLayout::ColMajor);
    let (m, n, k) = (c.mb(), c.nb(), a.nb());
    debug_assert_eq!(a.mb(), m);
    debug_assert_eq!(b.mb(), k);
    debug_assert_eq!(b.nb(), n);

    let (lda, ldb, ldc) = (
        a.stride() as usize,
        b.stride() as usize,
        c.stride() as usize,
    );
    let av = a.as_slice();
    let bv = b.as_slice();
    let cv = c.as_mut_slice();

    for j in 0..n as usize {
        for i in 0..m as usize {
            let mut acc = S::zero();
            for l in 0..k as usize {
                acc = acc + av[i + l * lda] * bv[l + j * ldb];
            }
            cv[i + j * ldc] = alpha * acc + beta * cv[i + j * ldc];
        }
    }
}

/// C <- alpha * A * B + beta * C over tile views
///
/// `a` is a column of tiles (mt x 1), `b` a row of tiles (1 x nt), and
/// `c` their mt x nt product view. Only the local tiles of `c` are
/// updated; the required `a` and `b` replicas must already be resident
/// (delivered by the panel and trailing broadcasts).
pub fn internal_gemm<S: Scalar>(
    alpha: S,
    a: &Matrix<S>,
    b: &Matrix<S>,
    beta: S,
    c: &Matrix<S>,
    target: Target,
    priority: Priority,
) -> Result<()> {
    let _ = priority;
    let work = c.local_tiles();
    if work.is_empty() {
        return Ok(());
    }

    #[cfg(feature = "cuda")]
    if target == Target::Devices
        && !S::TYPE.is_complex()
        && !crate::cuda::visible_devices().is_empty()
    {
        return crate::cuda::batch_gemm(alpha, a, b, beta, c, &work);
    }

    let run_one = |&(i, j): &(i64, i64)| -> Result<()> {
        c.tile_update_origin(i, j)?;
        let at = a.tile(i, 0)?;
        let bt = b.tile(0, j)?;
        let ct = c.tile(i, j)?;
        gemm_tile(alpha, &at, &bt, beta, &ct);
        c.tile_mark_modified(i, j, HOST_DEVICE);
        Ok(())
    };

    match target {
        Target::HostTask => work.iter().try_for_each(run_one),
        #[cfg(feature = "rayon")]
        Target::HostNest => {
            use rayon::prelude::*;
            work.par_iter().try_for_each(run_one)
        }
        #[cfg(feature = "rayon")]
        Target::HostBatch | Target::Devices => {
            // Batched dispatch: fixed-size groups, one batch per task.
            use rayon::prelude::*;
            work.par_chunks(8)
                .try_for_each(|chunk| chunk.iter().try_for_each(run_one))
        }
        #[cfg(not(feature = "rayon"))]
        _ => work.iter().try_for_each(run_one),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ProcessGrid;

    fn filled(m: i64, n: i64, mb: i64, f: impl Fn(i64, i64) -> f64) -> Matrix<f64> {
        let a = Matrix::new(m, n, mb, ProcessGrid::solo()).unwrap();
        for c in 0..n {
            for r in 0..m {
                a.set(r, c, f(r, c)).unwrap();
            }
        }
        a
    }

    #[test]
    fn test_gemm_tile_small() {
        let a = filled(2, 2, 2, |r, c| (r * 2 + c) as f64 + 1.0); // [[1,2],[3,4]]
        let b = filled(2, 2, 2, |r, c| if r == c { 1.0 } else { 2.0 }); // [[1,2],[2,1]]
        let c = filled(2, 2, 2, |_, _| 1.0);

        let at = a.tile(0, 0).unwrap();
        let bt = b.tile(0, 0).unwrap();
        let ct = c.tile(0, 0).unwrap();
        // C = -1 * A*B + 2*C
        gemm_tile(-1.0, &at, &bt, 2.0, &ct);
        // A*B = [[5,4],[11,10]]; C = 2 - A*B elementwise
        assert_eq!(c.get(0, 0).unwrap(), -3.0);
        assert_eq!(c.get(0, 1).unwrap(), -2.0);
        assert_eq!(c.get(1, 0).unwrap(), -9.0);
        assert_eq!(c.get(1, 1).unwrap(), -8.0);
    }

    #[test]
    fn test_internal_gemm_rank_update() {
        // 4x4 with 2x2 tiles: C(1:, 1:) -= A(1:, 0) * B(0, 1:)
        let a = filled(4, 4, 2, |r, c| if c < 2 { (r + c) as f64 } else { 0.0 });
        let col = a.sub(1, 1, 0, 0).unwrap();
        let row = a.sub(0, 0, 1, 1).unwrap();
        let trail = a.sub(1, 1, 1, 1).unwrap();

        // Fill the row block and trailing block with knowns.
        for c in 2..4 {
            for r in 0..2 {
                a.set(r, c, 1.0).unwrap();
            }
            for r in 2..4 {
                a.set(r, c, 10.0).unwrap();
            }
        }

        internal_gemm(-1.0, &col, &row, 1.0, &trail, Target::HostTask, Priority::Normal)
            .unwrap();

        // A(2:, 0:1) rows are [2,3] and [3,4]; row block is all ones, so
        // each trailing element loses the row sum.
        assert_eq!(a.get(2, 2).unwrap(), 10.0 - 5.0);
        assert_eq!(a.get(3, 3).unwrap(), 10.0 - 7.0);
    }
}
