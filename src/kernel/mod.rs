//! Kernel adapters: per-tile math dispatched by execution target
//!
//! Adapters take sub-matrix views, iterate the local tiles of their
//! output view, and run the tile-local kernels under the engine's
//! single-threaded BLAS discipline. The four targets share one adapter
//! body and differ only in how the tile loop is driven.

mod getrf;
mod gemm;
mod trsm;

pub use getrf::internal_getrf_nopiv;
pub use gemm::internal_gemm;
pub use trsm::internal_trsm;

pub use crate::schedule::Priority;

use std::sync::atomic::{AtomicUsize, Ordering};

/// Execution location for a kernel adapter
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// One host thread per task, scalar kernel calls
    HostTask,
    /// Host, nested parallelism across the tiles of a view
    HostNest,
    /// Host, batched dispatch over many small tiles
    HostBatch,
    /// Accelerator-batched kernels, round-robined across visible devices
    Devices,
}

/// Which side a triangular factor multiplies from
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    /// op(T) * X = alpha * B
    Left,
    /// X * op(T) = alpha * B
    Right,
}

/// Process-wide BLAS thread-count setting
///
/// Initialized to the runtime's available parallelism; the driver clamps
/// it to 1 for the duration of each top-level call so tile kernels never
/// oversubscribe the worker team.
static BLAS_THREADS: AtomicUsize = AtomicUsize::new(0);

/// Current BLAS thread-count setting
pub fn blas_threads() -> usize {
    let v = BLAS_THREADS.load(Ordering::Relaxed);
    if v == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        v
    }
}

/// Scoped clamp of the BLAS thread count
///
/// Saves the current setting, installs the clamp, and restores the saved
/// value when dropped, on every exit path of the enclosing call.
pub struct BlasThreadGuard {
    saved: usize,
}

impl BlasThreadGuard {
    /// Clamp the process-wide BLAS thread count to one
    pub fn clamp_single() -> Self {
        let saved = BLAS_THREADS.swap(1, Ordering::Relaxed);
        Self { saved }
    }
}

impl Drop for BlasThreadGuard {
    fn drop(&mut self) {
        BLAS_THREADS.store(self.saved, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blas_guard_restores_on_drop() {
        let before = blas_threads();
        {
            let _guard = BlasThreadGuard::clamp_single();
            assert_eq!(blas_threads(), 1);
        }
        assert_eq!(blas_threads(), before);
    }
}
