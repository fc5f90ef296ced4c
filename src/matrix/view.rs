//! Sub-matrix views and transposition
//!
//! Views are constant-time: they narrow the tile range or flip the
//! transposition flag on a cheap handle sharing the parent's replica
//! table. All compositions preserve the invariants
//! `transpose(transpose(A)) == A` and
//! `conj_transpose(conj_transpose(A)) == A`.

use super::{Matrix, Op};
use crate::error::{Error, Result};
use crate::scalar::Scalar;
use crate::tile::DeviceId;
use smallvec::SmallVec;

impl<S: Scalar> Matrix<S> {
    /// Select the tile range [i0..=i1] x [j0..=j1] of this view
    ///
    /// Constant time; the result aliases this matrix's storage and
    /// composes with the current transposition state. An empty range
    /// (`i1 == i0 - 1` or `j1 == j0 - 1`) yields an empty view;
    /// contradictory bounds beyond that are rejected.
    pub fn sub(&self, i0: i64, i1: i64, j0: i64, j1: i64) -> Result<Matrix<S>> {
        if i0 < 0 || j0 < 0 || i1 >= self.mt || j1 >= self.nt || i1 < i0 - 1 || j1 < j0 - 1 {
            return Err(Error::invalid_argument(
                "sub",
                format!(
                    "range [{i0}..={i1}] x [{j0}..={j1}] of {} x {} tiles",
                    self.mt, self.nt
                ),
            ));
        }
        let (row0, col0) = match self.op {
            Op::NoTrans => (self.row0 + i0, self.col0 + j0),
            Op::Trans | Op::ConjTrans => (self.row0 + j0, self.col0 + i0),
        };
        Ok(Matrix {
            inner: self.inner.clone(),
            row0,
            col0,
            mt: (i1 - i0 + 1).max(0),
            nt: (j1 - j0 + 1).max(0),
            op: self.op,
        })
    }

    /// Transposed view of this matrix, O(1)
    ///
    /// Panics when applied to a conjugate-transposed view: the engine does
    /// not represent an unconjugated-transpose-of-conjugate state.
    pub fn transpose(&self) -> Matrix<S> {
        let op = match self.op {
            Op::NoTrans => Op::Trans,
            Op::Trans => Op::NoTrans,
            Op::ConjTrans => panic!("transpose of a conj-transposed view is unsupported"),
        };
        self.flipped(op)
    }

    /// Conjugate-transposed view of this matrix, O(1)
    ///
    /// For real scalar types this is semantically `transpose`. Panics when
    /// applied to a plain-transposed view.
    pub fn conj_transpose(&self) -> Matrix<S> {
        let op = match self.op {
            Op::NoTrans => Op::ConjTrans,
            Op::ConjTrans => Op::NoTrans,
            Op::Trans => panic!("conj_transpose of a transposed view is unsupported"),
        };
        self.flipped(op)
    }

    fn flipped(&self, op: Op) -> Matrix<S> {
        Matrix {
            inner: self.inner.clone(),
            row0: self.row0,
            col0: self.col0,
            mt: self.nt,
            nt: self.mt,
            op,
        }
    }

    /// True when the view selects no tiles
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mt == 0 || self.nt == 0
    }

    /// View-coordinate indices of the stored tiles this process owns
    pub fn local_tiles(&self) -> Vec<(i64, i64)> {
        let mut out = Vec::new();
        for j in 0..self.nt {
            for i in 0..self.mt {
                if self.tile_is_stored(i, j) && self.tile_is_local(i, j) {
                    out.push((i, j));
                }
            }
        }
        out
    }

    /// Ranks owning at least one stored tile of this view
    ///
    /// This is the destination set of a broadcast whose `dest` is this
    /// view; empty views produce an empty set.
    pub(crate) fn ranks(&self) -> SmallVec<[usize; 8]> {
        let mut out: SmallVec<[usize; 8]> = SmallVec::new();
        for j in 0..self.nt {
            for i in 0..self.mt {
                if self.tile_is_stored(i, j) {
                    let r = self.tile_rank(i, j);
                    if !out.contains(&r) {
                        out.push(r);
                    }
                }
            }
        }
        out
    }

    /// Devices holding a replica of any local tile of this view
    /// (the host is not included)
    pub fn local_devices(&self) -> SmallVec<[DeviceId; 4]> {
        #[cfg(feature = "cuda")]
        {
            let mut out: SmallVec<[DeviceId; 4]> = SmallVec::new();
            for (i, j) in self.local_tiles() {
                for d in self.replica_devices(i, j) {
                    if !out.contains(&d) {
                        out.push(d);
                    }
                }
            }
            return out;
        }
        #[cfg(not(feature = "cuda"))]
        SmallVec::new()
    }
}
