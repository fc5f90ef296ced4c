//! Right-looking LU factorization without pivoting, with lookahead
//!
//! The task graph per panel column k:
//!
//! - factor A(k, k) and broadcast it down its column and across its row
//!   (writes `column[k]`, `diag[k]`, high priority);
//! - solve the panel below the diagonal against U(k, k) (writes
//!   `column[k]`, reads `diag[k]`, high);
//! - broadcast every panel tile A(i, k) across its trailing row, tag i
//!   (writes `column[k]` and the bandwidth token, high);
//! - for each lookahead column j: solve A(k, j) against unit-lower
//!   L(k, k) and broadcast it down column j with tag j, then apply the
//!   rank update to column j (reads `diag[k]` / `column[k]`, writes
//!   `column[j]`, high);
//! - for the remaining trailing block: the same solve, a broadcast of
//!   row k with tags j + mt (disjoint from the panel-row tag space),
//!   and the trailing rank update (normal priority, anchored on the
//!   boundary and last column tokens).
//!
//! Splitting `diag[k]` from `column[k]` lets the lookahead solves start
//! as soon as the diagonal tile is factored, overlapping the panel-row
//! broadcast.

use crate::error::Result;
use crate::kernel::{
    internal_gemm, internal_getrf_nopiv, internal_trsm, BlasThreadGuard, Priority, Side, Target,
};
use crate::matrix::{BcastList, BcastListTag, Diag, Matrix, Uplo};
use crate::scalar::Scalar;
use crate::schedule::{Access, TaskPool};
use crate::tile::TileLayout;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::{resolve, Diagnostics, Options};

/// Distributed parallel LU factorization without pivoting
///
/// Computes A = L * U for a general matrix of tiles, overwriting A with
/// the unit-lower factor L (unit diagonal not stored) and the upper
/// factor U. Every process of the matrix's grid must call this with the
/// same matrix and options.
///
/// Options consulted: `Target` (default HostTask), `Lookahead`
/// (default 1), `InnerBlocking` (default 16), `MaxPanelThreads`
/// (default half the runtime threads). Invalid values fail with
/// `InvalidArgument` before any work is submitted.
///
/// A zero diagonal is not an error: it is recorded in the returned
/// [`Diagnostics`], a warning is emitted, and the factorization
/// completes against the singular factor.
pub fn getrf_nopiv<S: Scalar>(a: &Matrix<S>, opts: &Options) -> Result<Diagnostics> {
    let resolved = resolve(opts)?;
    let target = resolved.target;
    let lookahead = resolved.lookahead;
    let ib = resolved.inner_blocking;

    let (mt, nt) = (a.mt(), a.nt());
    let min_mt_nt = mt.min(nt);
    let mut diagnostics = Diagnostics {
        singular_columns: Vec::new(),
        pivots: vec![Vec::new(); min_mt_nt as usize],
    };
    if min_mt_nt == 0 {
        return Ok(diagnostics);
    }

    // Tile kernels run single-threaded for the whole call; restored on
    // every exit path.
    let _blas = BlasThreadGuard::clamp_single();

    if target == Target::Devices {
        // Two batch array sets plus one per lookahead column.
        a.allocate_batch_arrays(0, 2 + lookahead);
        a.reserve_device_workspace()?;
    }

    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(lookahead as usize + 2);
    let pool = TaskPool::new(workers);
    let column = pool.tokens(nt as usize);
    let diag = pool.tokens(nt as usize);
    let mpi_bandwidth = pool.token();

    let singular: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let nb = a.tile_nb(0);

    debug!(
        mt,
        nt, lookahead, ib, ?target, workers, "starting getrf_nopiv"
    );

    for k in 0..min_mt_nt {
        // Panel: factor A(k, k), then feed its column and row.
        {
            let a = a.clone();
            let singular = Arc::clone(&singular);
            pool.submit(
                Priority::High,
                &[
                    (column[k as usize], Access::Write),
                    (diag[k as usize], Access::Write),
                ],
                move || {
                    let akk = a.sub(k, k, k, k)?;
                    let zeros = internal_getrf_nopiv(&akk, ib, Priority::High)?;
                    if !zeros.is_empty() {
                        let mut cols = singular.lock().unwrap();
                        for c in zeros {
                            let col = k * nb + c;
                            warn!(column = col, "exact zero diagonal; factor is singular");
                            cols.push(col);
                        }
                    }

                    let below = a.sub(k + 1, a.mt() - 1, k, k)?;
                    let right = a.sub(k, k, k + 1, a.nt() - 1)?;
                    let list: BcastList<S> = vec![(k, k, vec![below, right])];
                    a.list_bcast(&list, TileLayout::ColMajor, k as u64)
                },
            );
        }

        // Panel solve: A(k+1:, k) <- A(k+1:, k) * U(k, k)^{-1}.
        {
            let a = a.clone();
            pool.submit(
                Priority::High,
                &[
                    (column[k as usize], Access::Write),
                    (diag[k as usize], Access::Read),
                ],
                move || {
                    let akk = a.sub(k, k, k, k)?;
                    let below = a.sub(k + 1, a.mt() - 1, k, k)?;
                    internal_trsm(
                        Side::Right,
                        Uplo::Upper,
                        Diag::NonUnit,
                        S::one(),
                        &akk,
                        &below,
                        target,
                        Priority::High,
                    )
                },
            );
        }

        // Panel-row broadcast: A(i, k) across row i's trailing portion,
        // tag i.
        {
            let a = a.clone();
            pool.submit(
                Priority::High,
                &[
                    (column[k as usize], Access::Write),
                    (mpi_bandwidth, Access::Write),
                ],
                move || {
                    let mut list: BcastListTag<S> = Vec::new();
                    for i in k + 1..a.mt() {
                        list.push((i, k, vec![a.sub(i, i, k + 1, a.nt() - 1)?], i as u64));
                    }
                    a.list_bcast_mt(&list, TileLayout::ColMajor)
                },
            );
        }

        // Lookahead columns, high priority.
        for j in k + 1..(k + 1 + lookahead).min(nt) {
            {
                let a = a.clone();
                pool.submit(
                    Priority::High,
                    &[
                        (diag[k as usize], Access::Read),
                        (column[j as usize], Access::Write),
                    ],
                    move || {
                        let akk = a.sub(k, k, k, k)?;
                        let akj = a.sub(k, k, j, j)?;
                        internal_trsm(
                            Side::Left,
                            Uplo::Lower,
                            Diag::Unit,
                            S::one(),
                            &akk,
                            &akj,
                            target,
                            Priority::High,
                        )?;

                        let down = a.sub(k + 1, a.mt() - 1, j, j)?;
                        a.tile_bcast(k, j, &down, TileLayout::ColMajor, j as u64)
                    },
                );
            }
            {
                let a = a.clone();
                pool.submit(
                    Priority::High,
                    &[
                        (column[k as usize], Access::Read),
                        (column[j as usize], Access::Write),
                    ],
                    move || {
                        // A(k+1:, j) -= A(k+1:, k) * A(k, j)
                        internal_gemm(
                            -S::one(),
                            &a.sub(k + 1, a.mt() - 1, k, k)?,
                            &a.sub(k, k, j, j)?,
                            S::one(),
                            &a.sub(k + 1, a.mt() - 1, j, j)?,
                            target,
                            Priority::High,
                        )
                    },
                );
            }
        }

        // Trailing submatrix, normal priority.
        if k + 1 + lookahead < nt {
            let kl = k + 1 + lookahead;
            {
                let a = a.clone();
                pool.submit(
                    Priority::Normal,
                    &[
                        (diag[k as usize], Access::Read),
                        (column[kl as usize], Access::Write),
                        (column[nt as usize - 1], Access::Write),
                    ],
                    move || {
                        let akk = a.sub(k, k, k, k)?;
                        let row = a.sub(k, k, kl, a.nt() - 1)?;
                        internal_trsm(
                            Side::Left,
                            Uplo::Lower,
                            Diag::Unit,
                            S::one(),
                            &akk,
                            &row,
                            target,
                            Priority::Normal,
                        )
                    },
                );
            }
            {
                let a = a.clone();
                pool.submit(
                    Priority::Normal,
                    &[
                        (column[kl as usize], Access::Write),
                        (column[nt as usize - 1], Access::Write),
                        (mpi_bandwidth, Access::Write),
                    ],
                    move || {
                        // Tags offset by mt keep these disjoint from the
                        // panel-row broadcast space.
                        let mut list: BcastListTag<S> = Vec::new();
                        for j in kl..a.nt() {
                            list.push((
                                k,
                                j,
                                vec![a.sub(k + 1, a.mt() - 1, j, j)?],
                                (j + a.mt()) as u64,
                            ));
                        }
                        a.list_bcast_mt(&list, TileLayout::ColMajor)
                    },
                );
            }
            {
                let a = a.clone();
                pool.submit(
                    Priority::Normal,
                    &[
                        (column[k as usize], Access::Read),
                        (column[kl as usize], Access::Write),
                        (column[nt as usize - 1], Access::Write),
                    ],
                    move || {
                        // A(k+1:, kl:) -= A(k+1:, k) * A(k, kl:)
                        internal_gemm(
                            -S::one(),
                            &a.sub(k + 1, a.mt() - 1, k, k)?,
                            &a.sub(k, k, kl, a.nt() - 1)?,
                            S::one(),
                            &a.sub(k + 1, a.mt() - 1, kl, a.nt() - 1)?,
                            target,
                            Priority::Normal,
                        )
                    },
                );
            }
        }

        // Device replica releases; host targets have nothing staged.
        if target == Target::Devices {
            {
                let a = a.clone();
                pool.submit(
                    Priority::Normal,
                    &[(diag[k as usize], Access::Write)],
                    move || {
                        if a.tile_is_local(k, k) && k + 1 < a.nt() {
                            for d in a.sub(k, k, k, k)?.local_devices() {
                                a.tile_unset_hold(k, k, d);
                                a.tile_release(k, k, d);
                            }
                        }
                        Ok(())
                    },
                );
            }
            {
                let a = a.clone();
                pool.submit(
                    Priority::Normal,
                    &[(column[k as usize], Access::Write)],
                    move || {
                        for i in k + 1..a.mt() {
                            if a.tile_is_local(i, k) {
                                a.tile_update_origin(i, k)?;
                                for d in a.sub(i, i, k, k)?.local_devices() {
                                    a.tile_unset_hold(i, k, d);
                                    a.tile_release(i, k, d);
                                }
                            }
                        }
                        Ok(())
                    },
                );
            }
        }
    }

    pool.wait_all()?;
    a.tile_update_all_origin()?;
    a.clear_workspace();

    let mut cols = singular.lock().unwrap().clone();
    cols.sort_unstable();
    cols.dedup();
    diagnostics.singular_columns = cols;

    debug!(
        singular = diagnostics.singular_columns.len(),
        "getrf_nopiv finished"
    );
    Ok(diagnostics)
}
