//! Tile broadcasts: one-to-many transfers driven by destination views
//!
//! A broadcast sends a tile from its owner to every process owning at
//! least one stored tile of the destination view(s). All ranks of the
//! grid call the same broadcast; the role each plays (sender, receiver,
//! bystander) falls out of ownership and membership. Within one driver
//! iteration, callers keep tags disjoint for transfers that could
//! otherwise collide on the same (source, destination) pair; single-tag
//! list broadcasts rely on FIFO matching and identical record order on
//! every rank.

use super::Matrix;
use crate::error::Result;
use crate::scalar::Scalar;
use crate::tile::TileLayout;
use smallvec::SmallVec;

/// Broadcast records sharing one tag: (tile row, tile col, dest views)
pub type BcastList<S> = Vec<(i64, i64, Vec<Matrix<S>>)>;

/// Broadcast records carrying per-record tags:
/// (tile row, tile col, dest views, tag)
pub type BcastListTag<S> = Vec<(i64, i64, Vec<Matrix<S>>, u64)>;

impl<S: Scalar> Matrix<S> {
    /// Broadcast view tile (i, j) from its owner to every process owning
    /// a stored tile of `dest`
    ///
    /// An empty destination view is a no-op. Receivers place the payload
    /// in a workspace replica created with `layout`.
    pub fn tile_bcast(
        &self,
        i: i64,
        j: i64,
        dest: &Matrix<S>,
        layout: TileLayout,
        tag: u64,
    ) -> Result<()> {
        self.bcast_one(i, j, std::slice::from_ref(dest), layout, tag)
    }

    /// Coalesced multicast: every record shares `tag`
    ///
    /// Records are processed in list order on every rank, so FIFO
    /// matching keeps same-pair transfers within the list unambiguous.
    pub fn list_bcast(
        &self,
        list: &BcastList<S>,
        layout: TileLayout,
        tag: u64,
    ) -> Result<()> {
        for (i, j, dests) in list {
            self.bcast_one(*i, *j, dests, layout, tag)?;
        }
        Ok(())
    }

    /// Multithreaded multicast with per-record tags
    ///
    /// Individual broadcasts may be reordered or overlapped; the
    /// per-record tags make that safe. Each tile is still delivered
    /// intact. Send-role records flush before any receive blocks, so
    /// every rank's outgoing traffic for this call is on the wire before
    /// its threads park in receives.
    pub fn list_bcast_mt(&self, list: &BcastListTag<S>, layout: TileLayout) -> Result<()> {
        let my_rank = self.grid().rank();
        let (sends, recvs): (Vec<_>, Vec<_>) = list
            .iter()
            .partition(|(i, j, _, _)| self.tile_rank(*i, *j) == my_rank);

        for (i, j, dests, tag) in sends {
            self.bcast_one(*i, *j, dests, layout, *tag)?;
        }

        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            return recvs
                .par_iter()
                .try_for_each(|(i, j, dests, tag)| self.bcast_one(*i, *j, dests, layout, *tag));
        }
        #[cfg(not(feature = "rayon"))]
        {
            for (i, j, dests, tag) in recvs {
                self.bcast_one(*i, *j, dests, layout, *tag)?;
            }
            Ok(())
        }
    }

    fn bcast_one(
        &self,
        i: i64,
        j: i64,
        dests: &[Matrix<S>],
        _layout: TileLayout,
        tag: u64,
    ) -> Result<()> {
        let grid = self.grid();
        let my_rank = grid.rank();
        let owner = self.tile_rank(i, j);

        let mut dest_ranks: SmallVec<[usize; 8]> = SmallVec::new();
        for dest in dests {
            for r in dest.ranks() {
                if r != owner && !dest_ranks.contains(&r) {
                    dest_ranks.push(r);
                }
            }
        }
        if dest_ranks.is_empty() {
            return Ok(());
        }

        let transport = grid.transport();
        if my_rank == owner {
            // The origin may be stale behind a device-resident update.
            self.tile_update_origin(i, j)?;
            let payload = self.tile(i, j)?.pack();
            let bytes: &[u8] = bytemuck::cast_slice(&payload);
            for &r in &dest_ranks {
                transport.send(r, tag, bytes)?;
            }
        } else if dest_ranks.contains(&my_rank) {
            let bytes = transport.recv(owner, tag)?;
            let payload: Vec<S> = bytemuck::pod_collect_to_vec(&bytes);
            let tile = self.tile_insert_workspace(i, j)?;
            tile.unpack(&payload);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LocalCluster, ProcessGrid};
    use std::sync::Arc;
    use std::thread;

    /// Run one closure per rank of a 1 x `q` grid over a local cluster.
    fn on_grid<F, T>(q: usize, f: F) -> Vec<T>
    where
        F: Fn(ProcessGrid) -> T + Send + Sync,
        T: Send,
    {
        let cluster = LocalCluster::new(q);
        thread::scope(|s| {
            let handles: Vec<_> = (0..q)
                .map(|r| {
                    let grid =
                        ProcessGrid::new(1, q, Arc::new(cluster.transport(r))).unwrap();
                    let f = &f;
                    s.spawn(move || f(grid))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_bcast_delivers_bit_identical_payload() {
        on_grid(2, |grid| {
            let a = Matrix::<f64>::new(4, 4, 2, grid).unwrap();
            // Owner of tile (0, 0) is rank 0; fill it there.
            if a.tile_is_local(0, 0) {
                let t = a.tile(0, 0).unwrap();
                t.set(0, 0, 1.25);
                t.set(1, 1, -3.5);
            }
            // Destination: tile row 0, columns 1.. (owned by rank 1).
            let dest = a.sub(0, 0, 1, 1).unwrap();
            a.tile_bcast(0, 0, &dest, TileLayout::ColMajor, 17).unwrap();

            if !a.tile_is_local(0, 0) {
                let t = a.tile(0, 0).unwrap();
                assert_eq!(t.get(0, 0), 1.25);
                assert_eq!(t.get(1, 1), -3.5);
            }
        });
    }

    #[test]
    fn test_bcast_empty_dest_is_noop() {
        on_grid(2, |grid| {
            let a = Matrix::<f64>::new(4, 4, 2, grid).unwrap();
            let empty = a.sub(1, 0, 0, 1).unwrap();
            a.tile_bcast(0, 0, &empty, TileLayout::ColMajor, 5).unwrap();
            // No receive was posted anywhere; nothing to drain.
        });
    }

    #[test]
    fn test_list_bcast_mt_distinct_tags() {
        on_grid(2, |grid| {
            let a = Matrix::<f64>::new(4, 4, 2, grid.clone()).unwrap();
            for i in 0..2 {
                if a.tile_is_local(i, 0) {
                    a.tile(i, 0).unwrap().set(0, 0, 10.0 + i as f64);
                }
            }
            // Send column-0 tiles across their rows, one tag per row.
            let list: BcastListTag<f64> = (0..2)
                .map(|i| (i, 0, vec![a.sub(i, i, 1, 1).unwrap()], i as u64))
                .collect();
            a.list_bcast_mt(&list, TileLayout::ColMajor).unwrap();

            if grid.rank() == 1 {
                assert_eq!(a.tile(0, 0).unwrap().get(0, 0), 10.0);
                assert_eq!(a.tile(1, 0).unwrap().get(0, 0), 11.0);
            }
        });
    }
}
