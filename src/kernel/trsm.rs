//! Tile-local triangular solve and its view-level adapter

use super::{Priority, Side, Target};
use crate::error::Result;
use crate::matrix::{Diag, Matrix, Uplo};
use crate::scalar::Scalar;
use crate::tile::{Tile, TileLayout, HOST_DEVICE};

/// In-place triangular solve on column-major host tiles
///
/// Side::Left solves op(T) * X = alpha * B; Side::Right solves
/// X * op(T) = alpha * B. B is overwritten with X. A zero stored diagonal
/// produces infinities rather than a fault, matching the engine's
/// run-to-completion treatment of singular factors.
pub(crate) fn trsm_tile<S: Scalar>(
    side: Side,
    uplo: Uplo,
    diag: Diag,
    alpha: S,
    t: &Tile<S>,
    b: &Tile<S>,
) {
    debug_assert_eq!(t.layout(), TileLayout::ColMajor);
    debug_assert_eq!(b.layout(), TileLayout::ColMajor);
    let (m, n) = (b.mb() as usize, b.nb() as usize);
    let ldt = t.stride() as usize;
    let ldb = b.stride() as usize;
    let tv = t.as_slice();
    let bv = b.as_mut_slice();

    if alpha != S::one() {
        for j in 0..n {
            for i in 0..m {
                bv[i + j * ldb] = alpha * bv[i + j * ldb];
            }
        }
    }

    match (side, uplo) {
        // Forward substitution down each column.
        (Side::Left, Uplo::Lower) => {
            for j in 0..n {
                for r in 0..m {
                    let mut x = bv[r + j * ldb];
                    for c in 0..r {
                        x = x - tv[r + c * ldt] * bv[c + j * ldb];
                    }
                    if diag == Diag::NonUnit {
                        x = x / tv[r + r * ldt];
                    }
                    bv[r + j * ldb] = x;
                }
            }
        }
        // Backward substitution up each column.
        (Side::Left, Uplo::Upper) => {
            for j in 0..n {
                for r in (0..m).rev() {
                    let mut x = bv[r + j * ldb];
                    for c in (r + 1)..m {
                        x = x - tv[r + c * ldt] * bv[c + j * ldb];
                    }
                    if diag == Diag::NonUnit {
                        x = x / tv[r + r * ldt];
                    }
                    bv[r + j * ldb] = x;
                }
            }
        }
        // Columns left to right: X[:, c] depends on earlier columns.
        (Side::Right, Uplo::Upper) => {
            for c in 0..n {
                for l in 0..c {
                    let u = tv[l + c * ldt];
                    for r in 0..m {
                        bv[r + c * ldb] = bv[r + c * ldb] - bv[r + l * ldb] * u;
                    }
                }
                if diag == Diag::NonUnit {
                    let d = tv[c + c * ldt];
                    for r in 0..m {
                        bv[r + c * ldb] = bv[r + c * ldb] / d;
                    }
                }
            }
        }
        // Columns right to left.
        (Side::Right, Uplo::Lower) => {
            for c in (0..n).rev() {
                for l in (c + 1)..n {
                    let u = tv[l + c * ldt];
                    for r in 0..m {
                        bv[r + c * ldb] = bv[r + c * ldb] - bv[r + l * ldb] * u;
                    }
                }
                if diag == Diag::NonUnit {
                    let d = tv[c + c * ldt];
                    for r in 0..m {
                        bv[r + c * ldb] = bv[r + c * ldb] / d;
                    }
                }
            }
        }
    }
}

/// Triangular solve over a tile view
///
/// `t` is a 1 x 1 view holding the triangular tile (replicated where
/// needed by an earlier broadcast); every local stored tile of `b` is
/// solved in place against it.
pub fn internal_trsm<S: Scalar>(
    side: Side,
    uplo: Uplo,
    diag: Diag,
    alpha: S,
    t: &Matrix<S>,
    b: &Matrix<S>,
    target: Target,
    priority: Priority,
) -> Result<()> {
    let _ = priority;
    let work = b.local_tiles();
    if work.is_empty() {
        return Ok(());
    }
    let tt = t.tile(0, 0)?;

    let run_one = |&(i, j): &(i64, i64)| -> Result<()> {
        b.tile_update_origin(i, j)?;
        let bt = b.tile(i, j)?;
        trsm_tile(side, uplo, diag, alpha, &tt, &bt);
        b.tile_mark_modified(i, j, HOST_DEVICE);
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

    fn filled(m: i64, n: i64, mb: i64, vals: &[f64]) -> Matrix<f64> {
        let a = Matrix::new(m, n, mb, ProcessGrid::solo()).unwrap();
        for r in 0..m {
            for c in 0..n {
                a.set(r, c, vals[(r * n + c) as usize]).unwrap();
            }
        }
        a
    }

    #[test]
    fn test_left_lower_unit() {
        // L = [[1,0],[2,1]] (unit diagonal stored as junk on/above)
        let t = filled(2, 2, 2, &[1.0, 0.0, 2.0, 1.0]);
        let b = filled(2, 1, 2, &[3.0, 8.0]);
        let tt = t.tile(0, 0).unwrap();
        let bt = b.tile(0, 0).unwrap();
        trsm_tile(Side::Left, Uplo::Lower, Diag::Unit, 1.0, &tt, &bt);
        // x0 = 3; x1 = 8 - 2*3 = 2
        assert_eq!(b.get(0, 0).unwrap(), 3.0);
        assert_eq!(b.get(1, 0).unwrap(), 2.0);
    }

    #[test]
    fn test_right_upper_nonunit() {
        // Solve X * U = B with U = [[2,1],[0,4]]
        let t = filled(2, 2, 2, &[2.0, 1.0, 0.0, 4.0]);
        let b = filled(1, 2, 2, &[4.0, 10.0]);
        let tt = t.tile(0, 0).unwrap();
        let bt = b.tile(0, 0).unwrap();
        trsm_tile(Side::Right, Uplo::Upper, Diag::NonUnit, 1.0, &tt, &bt);
        // x0 = 4/2 = 2; x1 = (10 - 2*1)/4 = 2
        assert_eq!(b.get(0, 0).unwrap(), 2.0);
        assert_eq!(b.get(0, 1).unwrap(), 2.0);
    }

    #[test]
    fn test_left_upper_nonunit_backward() {
        // U = [[2,1],[0,4]], solve U x = [4, 8] -> x1 = 2, x0 = 1
        let t = filled(2, 2, 2, &[2.0, 1.0, 0.0, 4.0]);
        let b = filled(2, 1, 2, &[4.0, 8.0]);
        let tt = t.tile(0, 0).unwrap();
        let bt = b.tile(0, 0).unwrap();
        trsm_tile(Side::Left, Uplo::Upper, Diag::NonUnit, 1.0, &tt, &bt);
        assert_eq!(b.get(1, 0).unwrap(), 2.0);
        assert_eq!(b.get(0, 0).unwrap(), 1.0);
    }

    #[test]
    fn test_alpha_scaling() {
        let t = filled(1, 1, 1, &[2.0]);
        let b = filled(1, 1, 1, &[6.0]);
        let tt = t.tile(0, 0).unwrap();
        let bt = b.tile(0, 0).unwrap();
        trsm_tile(Side::Left, Uplo::Lower, Diag::NonUnit, 0.5, &tt, &bt);
        // 0.5 * 6 / 2
        assert_eq!(b.get(0, 0).unwrap(), 1.5);
    }

    #[test]
    fn test_internal_trsm_over_column() {
        // A(1:, 0) <- A(1:, 0) * U^{-1} with U = A(0, 0) upper non-unit.
        let a = Matrix::<f64>::new(4, 2, 2, ProcessGrid::solo()).unwrap();
        for r in 0..4 {
            for c in 0..2 {
                a.set(r, c, ((r + 1) * (c + 2)) as f64).unwrap();
            }
        }
        // Make the diagonal tile upper-triangular-ish: [[2,0],[_,4]]
        a.set(0, 0, 2.0).unwrap();
        a.set(0, 1, 0.0).unwrap();
        a.set(1, 1, 4.0).unwrap();

        let t = a.sub(0, 0, 0, 0).unwrap();
        let below = a.sub(1, 1, 0, 0).unwrap();
        internal_trsm(
            Side::Right,
            Uplo::Upper,
            Diag::NonUnit,
            1.0,
            &t,
            &below,
            Target::HostTask,
            Priority::High,
        )
        .unwrap();
        // Row 2 was [6, 9]: x0 = 6/2 = 3, x1 = (9 - 3*0)/4 = 2.25.
        assert_eq!(a.get(2, 0).unwrap(), 3.0);
        assert_eq!(a.get(2, 1).unwrap(), 2.25);
    }
}
