//! Distributed tiled matrices
//!
//! A [`Matrix`] is a 2-D grid of tiles distributed block-cyclically over a
//! process grid. Each process stores the tiles it owns (the *origin*
//! replicas) plus any workspace replicas delivered by broadcasts or staged
//! to devices. All replicas live in one table keyed by
//! (tile row, tile column, device); views share the table through an
//! `Arc`, so a view can never outlive its parent's storage.

mod bcast;
mod view;

pub use bcast::{BcastList, BcastListTag};

use crate::comm::ProcessGrid;
use crate::error::{Error, Result};
use crate::scalar::Scalar;
use crate::tile::{Arena, DeviceId, Tile, TileLayout, HOST_DEVICE};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Which triangle of a matrix is stored or referenced
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Uplo {
    /// Upper triangle
    Upper,
    /// Lower triangle
    Lower,
}

/// Whether a triangular matrix has an implicit unit diagonal
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Diag {
    /// Diagonal elements are implicitly one
    Unit,
    /// Diagonal elements are stored
    NonUnit,
}

/// Transposition state carried by a view
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    /// As stored
    NoTrans,
    /// Transposed
    Trans,
    /// Conjugate-transposed
    ConjTrans,
}

/// Storage specialization of a matrix
///
/// The kind restricts which tiles are materially stored: a triangular or
/// Hermitian matrix only stores tiles on or inside its `uplo` triangle, a
/// band matrix only tiles within the band.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MatrixKind {
    /// Dense rectangular matrix; every tile is stored
    General,
    /// Triangular matrix
    Triangular {
        /// Stored triangle
        uplo: Uplo,
        /// Unit or stored diagonal
        diag: Diag,
    },
    /// Hermitian (symmetric for real scalars) matrix
    Hermitian {
        /// Stored triangle
        uplo: Uplo,
    },
    /// Band matrix with `kl` sub- and `ku` super-diagonals (in elements)
    Band {
        /// Sub-diagonals
        kl: i64,
        /// Super-diagonals
        ku: i64,
    },
}

/// One replica in the table
struct Entry<S: Scalar> {
    tile: Tile<S>,
    origin: bool,
    modified: bool,
    hold: u32,
    /// Buffer came from an arena (as opposed to a wrapped user buffer)
    arena_owned: bool,
}

/// Bookkeeping for device batch dispatch, sized by the driver before the
/// first trailing update
#[derive(Default, Clone, Copy)]
pub(crate) struct BatchState {
    pub batch_size: i64,
    pub num_arrays: i64,
    pub workspace_reserved: bool,
}

pub(crate) struct Inner<S: Scalar> {
    m: i64,
    n: i64,
    mb: i64,
    nb: i64,
    mt: i64,
    nt: i64,
    grid: ProcessGrid,
    kind: MatrixKind,
    host_arena: Arena,
    tiles: Mutex<HashMap<(i64, i64, DeviceId), Entry<S>>>,
    pub(crate) batch: Mutex<BatchState>,
    #[cfg(feature = "cuda")]
    pub(crate) devices: Vec<std::sync::Arc<crate::cuda::CudaContext>>,
    #[cfg(feature = "cuda")]
    device_arenas: Vec<Arena>,
}

/// A distributed tiled matrix, or a view into one
///
/// `Matrix` values are cheap handles: cloning shares the storage plane.
/// [`sub`](Matrix::sub), [`transpose`](Matrix::transpose), and
/// [`conj_transpose`](Matrix::conj_transpose) are O(1) and alias the same
/// tiles.
pub struct Matrix<S: Scalar> {
    pub(crate) inner: Arc<Inner<S>>,
    /// View origin, in global tile coordinates
    pub(crate) row0: i64,
    pub(crate) col0: i64,
    /// View extent, in view tile coordinates
    pub(crate) mt: i64,
    pub(crate) nt: i64,
    pub(crate) op: Op,
}

impl<S: Scalar> Clone for Matrix<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            row0: self.row0,
            col0: self.col0,
            mt: self.mt,
            nt: self.nt,
            op: self.op,
        }
    }
}

impl<S: Scalar> Matrix<S> {
    /// Create a matrix owning its local tiles
    ///
    /// Local origin tiles are allocated from the host arena and
    /// zero-initialized. `mb` is used for both tile dimensions.
    pub fn new(m: i64, n: i64, mb: i64, grid: ProcessGrid) -> Result<Self> {
        Self::with_kind(m, n, mb, grid, MatrixKind::General)
    }

    /// Create a matrix of a given storage kind
    pub fn with_kind(
        m: i64,
        n: i64,
        mb: i64,
        grid: ProcessGrid,
        kind: MatrixKind,
    ) -> Result<Self> {
        if m < 0 || n < 0 {
            return Err(Error::invalid_argument("dims", format!("{m} x {n}")));
        }
        if mb <= 0 {
            return Err(Error::invalid_argument("mb", format!("{mb}")));
        }
        let inner = Inner::new(m, n, mb, mb, grid, kind);
        let matrix = Self::whole(Arc::new(inner));
        matrix.allocate_origin_tiles()?;
        Ok(matrix)
    }

    /// Wrap an externally allocated column-major block-cyclic buffer
    ///
    /// The buffer holds this process's local tiles in the standard
    /// block-cyclic layout with leading dimension `lld`; element (r, c) of
    /// the global matrix lives at local offset
    /// `((r/mb/P)*mb + r%mb, (c/mb/Q)*mb + c%mb)`. No data is copied and
    /// the matrix never frees `ptr`.
    ///
    /// # Safety
    /// `ptr` must point to a buffer covering every local tile at leading
    /// dimension `lld`, valid and unaliased for the matrix's lifetime.
    pub unsafe fn from_user_layout(
        m: i64,
        n: i64,
        ptr: *mut S,
        lld: i64,
        mb: i64,
        grid: ProcessGrid,
    ) -> Result<Self> {
        if m < 0 || n < 0 {
            return Err(Error::invalid_argument("dims", format!("{m} x {n}")));
        }
        if mb <= 0 {
            return Err(Error::invalid_argument("mb", format!("{mb}")));
        }
        let inner = Inner::new(m, n, mb, mb, grid, MatrixKind::General);
        let matrix = Self::whole(Arc::new(inner));
        matrix.register_user_tiles(ptr as u64, lld)?;
        Ok(matrix)
    }

    fn whole(inner: Arc<Inner<S>>) -> Self {
        let (mt, nt) = (inner.mt, inner.nt);
        Self {
            inner,
            row0: 0,
            col0: 0,
            mt,
            nt,
            op: Op::NoTrans,
        }
    }

    fn allocate_origin_tiles(&self) -> Result<()> {
        let inner = &self.inner;
        let mut tiles = inner.tiles.lock().unwrap();
        for j in 0..inner.nt {
            for i in 0..inner.mt {
                if !inner.stored(i, j) || inner.tile_rank(i, j) != inner.grid.rank() {
                    continue;
                }
                let (mb, nb) = (inner.tile_mb(i), inner.tile_nb(j));
                let bytes = (mb * nb) as usize * std::mem::size_of::<S>();
                let ptr = inner.host_arena.allocate(bytes)?;
                let tile = unsafe {
                    Tile::from_raw(mb, nb, ptr, mb, HOST_DEVICE, TileLayout::ColMajor)
                };
                tiles.insert(
                    (i, j, HOST_DEVICE),
                    Entry {
                        tile,
                        origin: true,
                        modified: false,
                        hold: 0,
                        arena_owned: true,
                    },
                );
            }
        }
        Ok(())
    }

    fn register_user_tiles(&self, base: u64, lld: i64) -> Result<()> {
        let inner = &self.inner;
        let (p, q) = (inner.grid.p() as i64, inner.grid.q() as i64);
        let mut tiles = inner.tiles.lock().unwrap();
        for j in 0..inner.nt {
            for i in 0..inner.mt {
                if !inner.stored(i, j) || inner.tile_rank(i, j) != inner.grid.rank() {
                    continue;
                }
                let (mb, nb) = (inner.tile_mb(i), inner.tile_nb(j));
                if lld < (i / p + 1) * inner.mb {
                    return Err(Error::invalid_argument(
                        "lld",
                        format!("{lld} too small for local tile row {i}"),
                    ));
                }
                let local_row = (i / p) * inner.mb;
                let local_col = (j / q) * inner.nb;
                let offset = (local_row + local_col * lld) as usize;
                let ptr = base + (offset * std::mem::size_of::<S>()) as u64;
                let tile = unsafe {
                    Tile::from_raw(mb, nb, ptr, lld, HOST_DEVICE, TileLayout::ColMajor)
                };
                tiles.insert(
                    (i, j, HOST_DEVICE),
                    Entry {
                        tile,
                        origin: true,
                        modified: false,
                        hold: 0,
                        arena_owned: false,
                    },
                );
            }
        }
        Ok(())
    }

    /// Tile rows in this view
    #[inline]
    pub fn mt(&self) -> i64 {
        self.mt
    }

    /// Tile columns in this view
    #[inline]
    pub fn nt(&self) -> i64 {
        self.nt
    }

    /// Global rows covered by this view
    pub fn m(&self) -> i64 {
        (0..self.mt).map(|i| self.tile_mb(i)).sum()
    }

    /// Global columns covered by this view
    pub fn n(&self) -> i64 {
        (0..self.nt).map(|j| self.tile_nb(j)).sum()
    }

    /// The process grid this matrix is distributed over
    #[inline]
    pub fn grid(&self) -> &ProcessGrid {
        &self.inner.grid
    }

    /// Storage kind
    #[inline]
    pub fn kind(&self) -> MatrixKind {
        self.inner.kind
    }

    /// Transposition state of this view
    #[inline]
    pub fn op(&self) -> Op {
        self.op
    }

    /// Map view tile coordinates to global tile coordinates
    #[inline]
    pub(crate) fn global_tile(&self, i: i64, j: i64) -> (i64, i64) {
        match self.op {
            Op::NoTrans => (self.row0 + i, self.col0 + j),
            Op::Trans | Op::ConjTrans => (self.row0 + j, self.col0 + i),
        }
    }

    /// Rows of view tile row `i`
    pub fn tile_mb(&self, i: i64) -> i64 {
        let (gi, gj) = self.global_tile(i, 0);
        match self.op {
            Op::NoTrans => self.inner.tile_mb(gi),
            Op::Trans | Op::ConjTrans => self.inner.tile_nb(gj),
        }
    }

    /// Columns of view tile column `j`
    pub fn tile_nb(&self, j: i64) -> i64 {
        let (gi, gj) = self.global_tile(0, j);
        match self.op {
            Op::NoTrans => self.inner.tile_nb(gj),
            Op::Trans | Op::ConjTrans => self.inner.tile_mb(gi),
        }
    }

    /// Rank owning view tile (i, j)
    pub fn tile_rank(&self, i: i64, j: i64) -> usize {
        let (gi, gj) = self.global_tile(i, j);
        self.inner.tile_rank(gi, gj)
    }

    /// Whether view tile (i, j) is owned by this process
    pub fn tile_is_local(&self, i: i64, j: i64) -> bool {
        self.tile_rank(i, j) == self.inner.grid.rank()
    }

    /// Whether view tile (i, j) lies in the stored region of the kind
    pub fn tile_is_stored(&self, i: i64, j: i64) -> bool {
        let (gi, gj) = self.global_tile(i, j);
        self.inner.stored(gi, gj)
    }

    fn check_tile_index(&self, i: i64, j: i64) -> Result<()> {
        if i < 0 || i >= self.mt || j < 0 || j >= self.nt {
            return Err(Error::TileOutOfBounds {
                i,
                j,
                mt: self.mt,
                nt: self.nt,
            });
        }
        Ok(())
    }

    /// Host tile handle for view tile (i, j): the origin if this process
    /// owns it, otherwise a workspace replica delivered by a broadcast
    pub fn tile(&self, i: i64, j: i64) -> Result<Tile<S>> {
        self.check_tile_index(i, j)?;
        let (gi, gj) = self.global_tile(i, j);
        let tiles = self.inner.tiles.lock().unwrap();
        tiles
            .get(&(gi, gj, HOST_DEVICE))
            .map(|e| e.tile)
            .ok_or_else(|| {
                Error::Internal(format!(
                    "tile ({gi}, {gj}) has no host replica on rank {}",
                    self.inner.grid.rank()
                ))
            })
    }

    /// Insert (or reuse) a host workspace replica for view tile (i, j)
    pub fn tile_insert_workspace(&self, i: i64, j: i64) -> Result<Tile<S>> {
        self.check_tile_index(i, j)?;
        let (gi, gj) = self.global_tile(i, j);
        let inner = &self.inner;
        let mut tiles = inner.tiles.lock().unwrap();
        if let Some(entry) = tiles.get(&(gi, gj, HOST_DEVICE)) {
            return Ok(entry.tile);
        }
        let (mb, nb) = (inner.tile_mb(gi), inner.tile_nb(gj));
        let bytes = (mb * nb) as usize * std::mem::size_of::<S>();
        let ptr = inner.host_arena.allocate(bytes)?;
        let tile = unsafe { Tile::from_raw(mb, nb, ptr, mb, HOST_DEVICE, TileLayout::ColMajor) };
        tiles.insert(
            (gi, gj, HOST_DEVICE),
            Entry {
                tile,
                origin: false,
                modified: false,
                hold: 0,
                arena_owned: true,
            },
        );
        Ok(tile)
    }

    /// Mark view tile (i, j) modified on `device`
    ///
    /// The replica on `device` becomes the freshest copy; other replicas
    /// are stale until an explicit origin update.
    pub fn tile_mark_modified(&self, i: i64, j: i64, device: DeviceId) {
        let (gi, gj) = self.global_tile(i, j);
        let mut tiles = self.inner.tiles.lock().unwrap();
        if let Some(entry) = tiles.get_mut(&(gi, gj, device)) {
            entry.modified = true;
        }
    }

    /// Stack a hold on the replica of view tile (i, j) on `device`
    pub fn tile_hold(&self, i: i64, j: i64, device: DeviceId) {
        let (gi, gj) = self.global_tile(i, j);
        let mut tiles = self.inner.tiles.lock().unwrap();
        if let Some(entry) = tiles.get_mut(&(gi, gj, device)) {
            entry.hold += 1;
        }
    }

    /// Drop one hold from the replica of view tile (i, j) on `device`
    pub fn tile_unset_hold(&self, i: i64, j: i64, device: DeviceId) {
        let (gi, gj) = self.global_tile(i, j);
        let mut tiles = self.inner.tiles.lock().unwrap();
        if let Some(entry) = tiles.get_mut(&(gi, gj, device)) {
            entry.hold = entry.hold.saturating_sub(1);
        }
    }

    /// Release the replica of view tile (i, j) on `device`
    ///
    /// A no-op while holds remain or for the origin replica; otherwise the
    /// buffer returns to its arena.
    pub fn tile_release(&self, i: i64, j: i64, device: DeviceId) {
        let (gi, gj) = self.global_tile(i, j);
        let mut tiles = self.inner.tiles.lock().unwrap();
        let remove = match tiles.get(&(gi, gj, device)) {
            Some(entry) => entry.hold == 0 && !entry.origin,
            None => false,
        };
        if remove {
            let entry = tiles.remove(&(gi, gj, device)).unwrap();
            self.inner.release_entry(entry);
        }
    }

    /// Transfer the origin of view tile (i, j) to its replica on `device`
    ///
    /// Idempotent when the origin already lives there. If the current
    /// origin carries modifications, its bytes are copied to `device`
    /// synchronously before the flag moves, so kernels on the new origin
    /// device observe the freshest payload.
    pub fn tile_set_origin(&self, i: i64, j: i64, device: DeviceId) -> Result<()> {
        self.check_tile_index(i, j)?;
        let (gi, gj) = self.global_tile(i, j);
        let inner = &self.inner;
        let mut tiles = inner.tiles.lock().unwrap();

        let origin_dev = tiles
            .iter()
            .find(|((ti, tj, _), e)| *ti == gi && *tj == gj && e.origin)
            .map(|((_, _, d), _)| *d)
            .ok_or_else(|| {
                Error::Internal(format!("tile ({gi}, {gj}) has no origin on this rank"))
            })?;
        if origin_dev == device {
            return Ok(());
        }
        if !tiles.contains_key(&(gi, gj, device)) {
            return Err(Error::DeviceMismatch {
                expected: device,
                got: origin_dev,
            });
        }

        let src = tiles[&(gi, gj, origin_dev)].tile;
        let modified = tiles[&(gi, gj, origin_dev)].modified;
        let dst = tiles[&(gi, gj, device)].tile;
        if modified {
            match (origin_dev, device) {
                (HOST_DEVICE, HOST_DEVICE) => unreachable!("distinct devices"),
                #[cfg(feature = "cuda")]
                (HOST_DEVICE, d) => inner.devices[d as usize].copy_to_device(&src, &dst)?,
                #[cfg(feature = "cuda")]
                (d, HOST_DEVICE) => inner.devices[d as usize].copy_to_host(&src, &dst)?,
                _ => {
                    return Err(Error::Internal(format!(
                        "origin transfer {origin_dev} -> {device} is not supported"
                    )))
                }
            }
        }
        let _ = (src, dst);

        tiles.get_mut(&(gi, gj, origin_dev)).unwrap().origin = false;
        let entry = tiles.get_mut(&(gi, gj, device)).unwrap();
        entry.origin = true;
        entry.modified = modified;
        Ok(())
    }

    /// Pull the device replica of view tile (i, j) back to its host origin
    ///
    /// A no-op when no device replica is modified.
    pub fn tile_update_origin(&self, i: i64, j: i64) -> Result<()> {
        self.check_tile_index(i, j)?;
        #[cfg(feature = "cuda")]
        {
            let (gi, gj) = self.global_tile(i, j);
            return self.inner.update_origin_from_devices(gi, gj);
        }
        #[cfg(not(feature = "cuda"))]
        Ok(())
    }

    /// Pull every local tile's device replica back to its host origin
    pub fn tile_update_all_origin(&self) -> Result<()> {
        for j in 0..self.nt {
            for i in 0..self.mt {
                if self.tile_is_stored(i, j) && self.tile_is_local(i, j) {
                    self.tile_update_origin(i, j)?;
                }
            }
        }
        Ok(())
    }

    /// Release every non-origin replica with no outstanding holds
    pub fn clear_workspace(&self) {
        let mut tiles = self.inner.tiles.lock().unwrap();
        let keys: Vec<_> = tiles
            .iter()
            .filter(|(_, e)| !e.origin && e.hold == 0)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            let entry = tiles.remove(&key).unwrap();
            self.inner.release_entry(entry);
        }
    }

    /// Preallocate device batch descriptors for the trailing updates
    ///
    /// Sizing follows the driver: one array set per concurrent kernel
    /// (two plus one per lookahead column). Without accelerator support
    /// this only records the request.
    pub fn allocate_batch_arrays(&self, batch_size: i64, num_arrays: i64) {
        let mut batch = self.inner.batch.lock().unwrap();
        batch.batch_size = batch_size.max(batch.batch_size);
        batch.num_arrays = num_arrays.max(batch.num_arrays);
    }

    /// Reserve device workspace for staged tiles
    pub fn reserve_device_workspace(&self) -> Result<()> {
        let mut batch = self.inner.batch.lock().unwrap();
        batch.workspace_reserved = true;
        Ok(())
    }

    /// Read element (r, c) of this view (requires a local or replicated
    /// tile); intended for assembly and tests, not kernels
    pub fn get(&self, r: i64, c: i64) -> Result<S> {
        let (gr, gc) = self.global_element(r, c);
        let inner = &self.inner;
        let (i, j) = (gr / inner.mb, gc / inner.nb);
        let tiles = inner.tiles.lock().unwrap();
        let entry = tiles.get(&(i, j, HOST_DEVICE)).ok_or_else(|| {
            Error::Internal(format!("element ({gr}, {gc}) not resident on this rank"))
        })?;
        let v = entry.tile.get(gr % inner.mb, gc % inner.nb);
        Ok(if self.op == Op::ConjTrans { v.conj() } else { v })
    }

    /// Write element (r, c) of this view (local tiles only)
    pub fn set(&self, r: i64, c: i64, value: S) -> Result<()> {
        let (gr, gc) = self.global_element(r, c);
        let inner = &self.inner;
        let (i, j) = (gr / inner.mb, gc / inner.nb);
        let tiles = inner.tiles.lock().unwrap();
        let entry = tiles.get(&(i, j, HOST_DEVICE)).ok_or_else(|| {
            Error::Internal(format!("element ({gr}, {gc}) not resident on this rank"))
        })?;
        let value = if self.op == Op::ConjTrans {
            value.conj()
        } else {
            value
        };
        entry.tile.set(gr % inner.mb, gc % inner.nb, value);
        Ok(())
    }

    fn global_element(&self, r: i64, c: i64) -> (i64, i64) {
        let inner = &self.inner;
        match self.op {
            Op::NoTrans => (self.row0 * inner.mb + r, self.col0 * inner.nb + c),
            Op::Trans | Op::ConjTrans => (self.row0 * inner.mb + c, self.col0 * inner.nb + r),
        }
    }
}

impl<S: Scalar> Inner<S> {
    fn new(m: i64, n: i64, mb: i64, nb: i64, grid: ProcessGrid, kind: MatrixKind) -> Self {
        let mt = if m == 0 { 0 } else { (m + mb - 1) / mb };
        let nt = if n == 0 { 0 } else { (n + nb - 1) / nb };
        #[cfg(feature = "cuda")]
        let devices = crate::cuda::visible_devices();
        Self {
            m,
            n,
            mb,
            nb,
            mt,
            nt,
            grid,
            kind,
            host_arena: Arena::host(),
            tiles: Mutex::new(HashMap::new()),
            batch: Mutex::new(BatchState::default()),
            #[cfg(feature = "cuda")]
            device_arenas: devices.iter().map(|c| Arena::cuda(c.clone())).collect(),
            #[cfg(feature = "cuda")]
            devices,
        }
    }

    #[inline]
    fn tile_mb(&self, i: i64) -> i64 {
        (self.m - i * self.mb).min(self.mb)
    }

    #[inline]
    fn tile_nb(&self, j: i64) -> i64 {
        (self.n - j * self.nb).min(self.nb)
    }

    /// Block-cyclic owner: tile (i, j) lives on grid coordinate
    /// (i mod p, j mod q)
    #[inline]
    fn tile_rank(&self, i: i64, j: i64) -> usize {
        let p = self.grid.p() as i64;
        let q = self.grid.q() as i64;
        self.grid.rank_of((i % p) as usize, (j % q) as usize)
    }

    /// Whether tile (i, j) is materially stored under this kind
    fn stored(&self, i: i64, j: i64) -> bool {
        match self.kind {
            MatrixKind::General => true,
            MatrixKind::Triangular { uplo, .. } | MatrixKind::Hermitian { uplo } => match uplo {
                Uplo::Lower => i >= j,
                Uplo::Upper => i <= j,
            },
            MatrixKind::Band { kl, ku } => {
                let kl_t = (kl + self.mb - 1) / self.mb;
                let ku_t = (ku + self.nb - 1) / self.nb;
                j - i <= ku_t && i - j <= kl_t
            }
        }
    }

    fn release_entry(&self, entry: Entry<S>) {
        if entry.arena_owned {
            let arena = match entry.tile.device() {
                HOST_DEVICE => &self.host_arena,
                #[cfg(feature = "cuda")]
                d => &self.device_arenas[d as usize],
                #[cfg(not(feature = "cuda"))]
                _ => return,
            };
            let bytes = entry.tile.buffer_len() * std::mem::size_of::<S>();
            arena.release(entry.tile.ptr(), bytes);
        }
    }

    #[cfg(feature = "cuda")]
    fn update_origin_from_devices(&self, gi: i64, gj: i64) -> Result<()> {
        let mut tiles = self.tiles.lock().unwrap();
        let modified_dev = tiles
            .iter()
            .find(|((i, j, d), e)| *i == gi && *j == gj && *d != HOST_DEVICE && e.modified)
            .map(|((_, _, d), _)| *d);
        let Some(dev) = modified_dev else {
            return Ok(());
        };
        let src = tiles.get(&(gi, gj, dev)).unwrap().tile;
        let dst = tiles
            .get(&(gi, gj, HOST_DEVICE))
            .ok_or_else(|| Error::Internal(format!("tile ({gi}, {gj}) has no host origin")))?
            .tile;
        self.devices[dev as usize].copy_to_host(&src, &dst)?;
        tiles.get_mut(&(gi, gj, dev)).unwrap().modified = false;
        if let Some(host) = tiles.get_mut(&(gi, gj, HOST_DEVICE)) {
            host.modified = true;
        }
        Ok(())
    }
}

#[cfg(feature = "cuda")]
impl<S: Scalar> Matrix<S> {
    /// Stage view tile (i, j) onto `device`, copying the host replica if
    /// no device replica exists yet
    ///
    /// With `hold` set, a hold is stacked on the device replica so
    /// workspace clearing cannot reclaim it before the release tasks run.
    pub(crate) fn tile_to_device(
        &self,
        i: i64,
        j: i64,
        device: DeviceId,
        hold: bool,
    ) -> Result<Tile<S>> {
        self.check_tile_index(i, j)?;
        let (gi, gj) = self.global_tile(i, j);
        let inner = &self.inner;
        let ctx = inner
            .devices
            .get(device as usize)
            .ok_or(Error::DeviceMismatch {
                expected: device,
                got: HOST_DEVICE,
            })?
            .clone();

        let mut tiles = inner.tiles.lock().unwrap();
        if let Some(entry) = tiles.get(&(gi, gj, device)) {
            // One hold per staged replica; reuse within an iteration does
            // not stack further.
            let dev_tile = entry.tile;
            let dev_modified = entry.modified;
            let host_modified = tiles
                .get(&(gi, gj, HOST_DEVICE))
                .map(|e| e.modified)
                .unwrap_or(false);
            // A host-side kernel may have rewritten the tile since it was
            // staged; refresh the device copy before reuse.
            if host_modified && !dev_modified {
                let host = tiles.get(&(gi, gj, HOST_DEVICE)).unwrap().tile;
                ctx.copy_to_device(&host, &dev_tile)?;
            }
            return Ok(dev_tile);
        }
        let host = tiles
            .get(&(gi, gj, HOST_DEVICE))
            .ok_or_else(|| {
                Error::Internal(format!("tile ({gi}, {gj}) has no host replica to stage"))
            })?
            .tile;
        let (mb, nb) = (host.mb(), host.nb());
        let bytes = (mb * nb) as usize * std::mem::size_of::<S>();
        let ptr = inner.device_arenas[device as usize].allocate(bytes)?;
        let tile = unsafe { Tile::from_raw(mb, nb, ptr, mb, device, TileLayout::ColMajor) };
        ctx.copy_to_device(&host, &tile)?;
        tiles.insert(
            (gi, gj, device),
            Entry {
                tile,
                origin: false,
                modified: false,
                hold: u32::from(hold),
                arena_owned: true,
            },
        );
        Ok(tile)
    }

    /// Devices (excluding the host) holding a replica of view tile (i, j)
    pub(crate) fn replica_devices(&self, i: i64, j: i64) -> smallvec::SmallVec<[DeviceId; 4]> {
        let (gi, gj) = self.global_tile(i, j);
        let tiles = self.inner.tiles.lock().unwrap();
        tiles
            .keys()
            .filter(|(ti, tj, d)| *ti == gi && *tj == gj && *d != HOST_DEVICE)
            .map(|(_, _, d)| *d)
            .collect()
    }
}

impl<S: Scalar> Drop for Inner<S> {
    fn drop(&mut self) {
        let mut tiles = self.tiles.lock().unwrap();
        for (_, entry) in tiles.drain() {
            self.release_entry(entry);
        }
    }
}

impl<S: Scalar> std::fmt::Debug for Matrix<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Matrix {{ {}x{} tiles of {}x{}, at ({}, {}), {:?}, {:?} }}",
            self.mt, self.nt, self.inner.mb, self.inner.nb, self.row0, self.col0, self.op,
            self.inner.kind
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ProcessGrid;

    fn dense(m: i64, n: i64, mb: i64) -> Matrix<f64> {
        Matrix::new(m, n, mb, ProcessGrid::solo()).unwrap()
    }

    #[test]
    fn test_tile_grid_shape() {
        let a = dense(10, 6, 4);
        assert_eq!((a.mt(), a.nt()), (3, 2));
        assert_eq!(a.tile_mb(2), 2, "ragged last tile row");
        assert_eq!(a.tile_nb(1), 2, "ragged last tile column");
        assert_eq!((a.m(), a.n()), (10, 6));
    }

    #[test]
    fn test_single_owner_per_tile() {
        let a = dense(8, 8, 2);
        for j in 0..a.nt() {
            for i in 0..a.mt() {
                assert_eq!(a.tile_rank(i, j), 0);
                assert!(a.tile_is_local(i, j));
            }
        }
    }

    #[test]
    fn test_element_roundtrip() {
        let a = dense(6, 6, 2);
        a.set(4, 5, 2.5).unwrap();
        assert_eq!(a.get(4, 5).unwrap(), 2.5);
        // The element landed in tile (2, 2) at offset (0, 1).
        assert_eq!(a.tile(2, 2).unwrap().get(0, 1), 2.5);
    }

    #[test]
    fn test_triangular_stored_region() {
        let grid = ProcessGrid::solo();
        let a = Matrix::<f64>::with_kind(
            8,
            8,
            2,
            grid,
            MatrixKind::Triangular {
                uplo: Uplo::Lower,
                diag: Diag::NonUnit,
            },
        )
        .unwrap();
        assert!(a.tile_is_stored(3, 0));
        assert!(a.tile_is_stored(2, 2));
        assert!(!a.tile_is_stored(0, 3));
    }

    #[test]
    fn test_workspace_insert_and_clear() {
        let a = dense(4, 4, 2);
        // Pretend tile (0, 1) arrived from a peer: replace is idempotent.
        let w1 = a.tile_insert_workspace(0, 1).unwrap();
        let w2 = a.tile_insert_workspace(0, 1).unwrap();
        assert_eq!(w1.ptr(), w2.ptr());
        // Origin tiles survive clear_workspace; on a solo grid every tile
        // is an origin, so nothing is dropped.
        a.clear_workspace();
        assert!(a.tile(0, 1).is_ok());
    }

    #[test]
    fn test_hold_defers_release() {
        // Rank 0 of a 1x2 grid: tile column 1 is remote, so its replica
        // here is workspace, not origin.
        let cluster = crate::comm::LocalCluster::new(2);
        let grid = ProcessGrid::new(1, 2, std::sync::Arc::new(cluster.transport(0))).unwrap();
        let a = Matrix::<f64>::new(4, 4, 2, grid).unwrap();
        assert!(!a.tile_is_local(0, 1));

        a.tile_insert_workspace(0, 1).unwrap();
        a.tile_hold(0, 1, HOST_DEVICE);
        a.tile_release(0, 1, HOST_DEVICE);
        assert!(a.tile(0, 1).is_ok(), "held replica must survive release");

        a.tile_unset_hold(0, 1, HOST_DEVICE);
        a.tile_release(0, 1, HOST_DEVICE);
        assert!(a.tile(0, 1).is_err(), "released replica is gone");
    }

    #[test]
    fn test_set_origin_idempotent_and_checked() {
        let a = dense(4, 4, 2);
        // Origin already on the host.
        a.tile_set_origin(0, 0, HOST_DEVICE).unwrap();
        // No replica exists on an accelerator to take the origin.
        assert!(matches!(
            a.tile_set_origin(0, 0, 0),
            Err(Error::DeviceMismatch { .. })
        ));
    }

    #[test]
    fn test_from_user_layout_aliases_buffer() {
        let grid = ProcessGrid::solo();
        let mut buf = vec![0.0f64; 6 * 6];
        let a = unsafe {
            Matrix::from_user_layout(6, 6, buf.as_mut_ptr(), 6, 3, grid).unwrap()
        };
        a.set(4, 4, 9.0).unwrap();
        // Element (4, 4) of a column-major buffer with lld 6.
        assert_eq!(buf[4 + 4 * 6], 9.0);
    }

    #[test]
    fn test_out_of_bounds_tile() {
        let a = dense(4, 4, 2);
        assert!(matches!(
            a.tile(2, 0),
            Err(Error::TileOutOfBounds { .. })
        ));
    }
}
