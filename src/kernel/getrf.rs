//! Tile-local LU panel factorization (no pivoting) and its adapter

use super::Priority;
use crate::error::Result;
use crate::matrix::Matrix;
use crate::scalar::Scalar;
use crate::tile::{Tile, TileLayout, HOST_DEVICE};
use smallvec::SmallVec;

/// Factor a column-major host tile in place, A = L * U, without pivoting
///
/// Blocked right-looking elimination with inner blocking `ib`. Returns
/// the tile-local column indices whose diagonal was exactly zero; those
/// columns keep their unscaled sub-diagonal (the LAPACK convention), the
/// factorization continues, and the result is singular.
pub(crate) fn getrf_nopiv_tile<S: Scalar>(a: &Tile<S>, ib: i64) -> SmallVec<[i64; 2]> {
    debug_assert_eq!(a.layout(), TileLayout::ColMajor);
    debug_assert!(ib > 0);
    let (m, n) = (a.mb() as usize, a.nb() as usize);
    let lda = a.stride() as usize;
    let av = a.as_mut_slice();
    let kmin = m.min(n);
    let ib = ib as usize;
    let mut singular: SmallVec<[i64; 2]> = SmallVec::new();

    let mut s = 0;
    while s < kmin {
        let w = ib.min(kmin - s);

        // Unblocked elimination of the panel columns s..s+w over all rows.
        for c in s..s + w {
            let pivot = av[c + c * lda];
            if pivot.is_zero() {
                singular.push(c as i64);
            } else {
                for r in c + 1..m {
                    av[r + c * lda] = av[r + c * lda] / pivot;
                }
            }
            for j in c + 1..s + w {
                let u = av[c + j * lda];
                for r in c + 1..m {
                    av[r + j * lda] = av[r + j * lda] - av[r + c * lda] * u;
                }
            }
        }

        // Row block: A(s..s+w, s+w..n) <- L11^{-1} * A(s..s+w, s+w..n),
        // L11 unit lower from the freshly factored panel.
        for j in s + w..n {
            for c in s..s + w {
                let x = av[c + j * lda];
                for r in c + 1..s + w {
                    av[r + j * lda] = av[r + j * lda] - av[r + c * lda] * x;
                }
            }
        }

        // Trailing update: A(s+w.., s+w..) -= A(s+w.., s..s+w) * A(s..s+w, s+w..).
        for j in s + w..n {
            for r in s + w..m {
                let mut acc = S::zero();
                for l in s..s + w {
                    acc = acc + av[r + l * lda] * av[l + j * lda];
                }
                av[r + j * lda] = av[r + j * lda] - acc;
            }
        }

        s += w;
    }

    singular
}

/// Factor the diagonal tile of a 1 x 1 view in place
///
/// Returns the tile-local singular column indices on the owning process;
/// other processes see an empty list.
pub fn internal_getrf_nopiv<S: Scalar>(
    a: &Matrix<S>,
    ib: i64,
    priority: Priority,
) -> Result<SmallVec<[i64; 2]>> {
    let _ = priority;
    if !a.tile_is_local(0, 0) {
        return Ok(SmallVec::new());
    }
    a.tile_update_origin(0, 0)?;
    let tile = a.tile(0, 0)?;
    let singular = getrf_nopiv_tile(&tile, ib);
    a.tile_mark_modified(0, 0, HOST_DEVICE);
    Ok(singular)
}
