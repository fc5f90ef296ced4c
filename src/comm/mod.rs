//! Process grid and the transport seam
//!
//! Inter-process traffic goes through the object-safe [`Transport`] trait:
//! tagged point-to-point messages with FIFO matching per
//! (source, destination, tag), the semantics every MPI implementation
//! provides. The crate ships an in-process backend ([`LocalTransport`])
//! used by the multi-rank tests and as the single-rank default; a real
//! MPI binding slots in behind the same trait.

pub mod local;

pub use local::{LocalCluster, LocalTransport};

use crate::error::{Error, Result};
use std::sync::Arc;

/// Point-to-point transport between the processes of one engine instance
///
/// Messages are matched by (source rank, destination rank, tag) and
/// delivered FIFO per triple. Both sides of a transfer name the tag; the
/// broadcast layer's tag discipline guarantees that concurrent transfers
/// between the same pair never share one.
pub trait Transport: Send + Sync {
    /// This process's rank in [0, size)
    fn rank(&self) -> usize;

    /// Number of participating processes
    fn size(&self) -> usize;

    /// Send `data` to `dest` under `tag`
    fn send(&self, dest: usize, tag: u64, data: &[u8]) -> Result<()>;

    /// Receive the next message from `src` under `tag`, blocking
    fn recv(&self, src: usize, tag: u64) -> Result<Vec<u8>>;

    /// Block until every rank has entered the barrier
    fn barrier(&self) -> Result<()>;
}

/// A logical P x Q arrangement of processes
///
/// Ranks are numbered column-major: `rank(pi, pj) = pi + pj * p`. This is
/// the ambient convention of the numerical ecosystem and is fixed here;
/// tile (i, j) of a block-cyclic matrix lives on grid coordinate
/// `(i mod p, j mod q)`.
#[derive(Clone)]
pub struct ProcessGrid {
    p: usize,
    q: usize,
    transport: Arc<dyn Transport>,
}

impl ProcessGrid {
    /// Build a P x Q grid over a transport
    ///
    /// Fails with `InvalidArgument` unless `p * q` equals the transport's
    /// world size.
    pub fn new(p: usize, q: usize, transport: Arc<dyn Transport>) -> Result<Self> {
        if p == 0 || q == 0 {
            return Err(Error::invalid_argument("grid", "grid dimensions must be positive"));
        }
        if p * q != transport.size() {
            return Err(Error::invalid_argument(
                "grid",
                format!("{}x{} grid over {} processes", p, q, transport.size()),
            ));
        }
        Ok(Self { p, q, transport })
    }

    /// A 1 x 1 grid over the trivial in-process transport
    pub fn solo() -> Self {
        Self {
            p: 1,
            q: 1,
            transport: Arc::new(LocalTransport::solo()),
        }
    }

    /// Grid rows
    #[inline]
    pub fn p(&self) -> usize {
        self.p
    }

    /// Grid columns
    #[inline]
    pub fn q(&self) -> usize {
        self.q
    }

    /// This process's rank
    #[inline]
    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    /// Total processes in the grid
    #[inline]
    pub fn size(&self) -> usize {
        self.p * self.q
    }

    /// This process's (row, column) grid coordinates
    #[inline]
    pub fn coords(&self) -> (usize, usize) {
        let r = self.rank();
        (r % self.p, r / self.p)
    }

    /// Rank of grid coordinate (pi, pj)
    #[inline]
    pub fn rank_of(&self, pi: usize, pj: usize) -> usize {
        debug_assert!(pi < self.p && pj < self.q);
        pi + pj * self.p
    }

    /// The underlying transport
    #[inline]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

impl std::fmt::Debug for ProcessGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ProcessGrid {{ {}x{}, rank {} }}",
            self.p,
            self.q,
            self.rank()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solo_grid() {
        let grid = ProcessGrid::solo();
        assert_eq!(grid.size(), 1);
        assert_eq!(grid.rank(), 0);
        assert_eq!(grid.coords(), (0, 0));
        assert_eq!(grid.rank_of(0, 0), 0);
    }

    #[test]
    fn test_column_major_rank_numbering() {
        let cluster = LocalCluster::new(6);
        let grid = ProcessGrid::new(2, 3, Arc::new(cluster.transport(3))).unwrap();
        // rank 3 in a 2x3 column-major grid sits at (1, 1)
        assert_eq!(grid.coords(), (1, 1));
        assert_eq!(grid.rank_of(1, 1), 3);
        assert_eq!(grid.rank_of(0, 2), 4);
    }

    #[test]
    fn test_grid_size_mismatch_rejected() {
        let cluster = LocalCluster::new(4);
        let err = ProcessGrid::new(3, 2, Arc::new(cluster.transport(0)));
        assert!(matches!(err, Err(Error::InvalidArgument { .. })));
    }
}
