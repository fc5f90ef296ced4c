//! Tile: the unit of storage, placement, and communication
//!
//! A tile is a rectangular block of scalars with a leading dimension, a
//! device placement, and a layout. Tiles do not own their buffers; the
//! [`Arena`](arena::Arena) vends them and the matrix replica table governs
//! their lifetime (origin flag, modified flag, hold count).

pub mod arena;

pub use arena::Arena;

use crate::scalar::Scalar;
use std::fmt;
use std::marker::PhantomData;

/// Identifies the device a buffer is resident on
///
/// The host is `-1`; accelerators are numbered from `0`.
pub type DeviceId = i32;

/// The host device id
pub const HOST_DEVICE: DeviceId = -1;

/// Element order within a tile
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TileLayout {
    /// Column-major (Fortran order); stride is the column stride
    ColMajor,
    /// Row-major (C order); stride is the row stride
    RowMajor,
}

/// A rectangular block of scalars with a known stride and placement
///
/// `Tile` is a thin, copyable handle: the raw buffer address is stored as
/// `u64` (a host pointer or an accelerator address), so handles cross
/// thread and task boundaries freely. Dereferencing accessors are only
/// legal for host-resident tiles; device payloads move through the staging
/// paths in the matrix and cuda modules.
#[derive(Copy, Clone)]
pub struct Tile<S: Scalar> {
    mb: i64,
    nb: i64,
    stride: i64,
    ptr: u64,
    device: DeviceId,
    layout: TileLayout,
    _marker: PhantomData<S>,
}

impl<S: Scalar> Tile<S> {
    /// Wrap an existing buffer as a tile
    ///
    /// # Safety
    /// - `ptr` must point to a buffer of at least `stride * nb` elements
    ///   (ColMajor) or `mb * stride` elements (RowMajor) on `device`
    /// - The buffer must remain valid for the lifetime of every copy of
    ///   this handle; the matrix replica table upholds this
    pub unsafe fn from_raw(
        mb: i64,
        nb: i64,
        ptr: u64,
        stride: i64,
        device: DeviceId,
        layout: TileLayout,
    ) -> Self {
        debug_assert!(mb >= 0 && nb >= 0);
        debug_assert!(match layout {
            TileLayout::ColMajor => stride >= mb,
            TileLayout::RowMajor => stride >= nb,
        });
        Self {
            mb,
            nb,
            stride,
            ptr,
            device,
            layout,
            _marker: PhantomData,
        }
    }

    /// Number of rows
    #[inline]
    pub fn mb(&self) -> i64 {
        self.mb
    }

    /// Number of columns
    #[inline]
    pub fn nb(&self) -> i64 {
        self.nb
    }

    /// Leading dimension
    #[inline]
    pub fn stride(&self) -> i64 {
        self.stride
    }

    /// Raw buffer address
    #[inline]
    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    /// Device this tile is resident on
    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Element order
    #[inline]
    pub fn layout(&self) -> TileLayout {
        self.layout
    }

    /// Number of stored elements including stride padding
    #[inline]
    pub fn buffer_len(&self) -> usize {
        match self.layout {
            TileLayout::ColMajor => (self.stride * self.nb) as usize,
            TileLayout::RowMajor => (self.mb * self.stride) as usize,
        }
    }

    /// Payload size in bytes (without stride padding)
    #[inline]
    pub fn payload_bytes(&self) -> usize {
        (self.mb * self.nb) as usize * std::mem::size_of::<S>()
    }

    #[inline]
    fn element_index(&self, i: i64, j: i64) -> usize {
        debug_assert!(i >= 0 && i < self.mb && j >= 0 && j < self.nb);
        match self.layout {
            TileLayout::ColMajor => (i + j * self.stride) as usize,
            TileLayout::RowMajor => (i * self.stride + j) as usize,
        }
    }

    /// Borrow the backing buffer (host tiles only)
    #[inline]
    pub fn as_slice(&self) -> &[S] {
        assert_eq!(self.device, HOST_DEVICE, "as_slice on a device tile");
        unsafe { std::slice::from_raw_parts(self.ptr as *const S, self.buffer_len()) }
    }

    /// Mutably borrow the backing buffer (host tiles only)
    ///
    /// Exclusivity is enforced by the scheduler's token graph, not by the
    /// borrow checker; two tasks writing the same tile must conflict on a
    /// token.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub fn as_mut_slice(&self) -> &mut [S] {
        assert_eq!(self.device, HOST_DEVICE, "as_mut_slice on a device tile");
        unsafe { std::slice::from_raw_parts_mut(self.ptr as *mut S, self.buffer_len()) }
    }

    /// Read element (i, j) of a host tile
    #[inline]
    pub fn get(&self, i: i64, j: i64) -> S {
        self.as_slice()[self.element_index(i, j)]
    }

    /// Write element (i, j) of a host tile
    #[inline]
    pub fn set(&self, i: i64, j: i64, value: S) {
        let idx = self.element_index(i, j);
        self.as_mut_slice()[idx] = value;
    }

    /// Pack the payload into a contiguous column-major buffer
    ///
    /// This is the wire format for broadcasts: stride padding is dropped
    /// and row-major tiles are transposed into column order.
    pub fn pack(&self) -> Vec<S> {
        let src = self.as_slice();
        let mut out = Vec::with_capacity((self.mb * self.nb) as usize);
        for j in 0..self.nb {
            for i in 0..self.mb {
                out.push(src[self.element_index(i, j)]);
            }
        }
        out
    }

    /// Fill the tile from a contiguous column-major payload
    pub fn unpack(&self, data: &[S]) {
        assert_eq!(data.len(), (self.mb * self.nb) as usize);
        let dst = self.as_mut_slice();
        let mut it = data.iter();
        for j in 0..self.nb {
            for i in 0..self.mb {
                dst[self.element_index(i, j)] = *it.next().unwrap();
            }
        }
    }

    /// Copy another host tile's payload into this one
    ///
    /// Shapes must match; strides and layouts may differ.
    pub fn copy_from(&self, src: &Tile<S>) {
        assert_eq!((self.mb, self.nb), (src.mb, src.nb), "tile shape mismatch");
        let s = src.as_slice();
        let d = self.as_mut_slice();
        for j in 0..self.nb {
            for i in 0..self.mb {
                d[self.element_index(i, j)] = s[src.element_index(i, j)];
            }
        }
    }
}

impl<S: Scalar> fmt::Debug for Tile<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tile")
            .field("mb", &self.mb)
            .field("nb", &self.nb)
            .field("stride", &self.stride)
            .field("ptr", &format!("0x{:x}", self.ptr))
            .field("device", &self.device)
            .field("layout", &self.layout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_tile(mb: i64, nb: i64, stride: i64, buf: &mut Vec<f64>) -> Tile<f64> {
        buf.resize((stride * nb) as usize, 0.0);
        unsafe {
            Tile::from_raw(
                mb,
                nb,
                buf.as_mut_ptr() as u64,
                stride,
                HOST_DEVICE,
                TileLayout::ColMajor,
            )
        }
    }

    #[test]
    fn test_get_set_col_major() {
        let mut buf = Vec::new();
        let t = host_tile(2, 3, 4, &mut buf);
        t.set(1, 2, 42.0);
        assert_eq!(t.get(1, 2), 42.0);
        // element (1, 2) with stride 4 lands at 1 + 2*4
        assert_eq!(buf[9], 42.0);
    }

    #[test]
    fn test_pack_drops_stride_padding() {
        let mut buf = Vec::new();
        let t = host_tile(2, 2, 5, &mut buf);
        t.set(0, 0, 1.0);
        t.set(1, 0, 2.0);
        t.set(0, 1, 3.0);
        t.set(1, 1, 4.0);
        assert_eq!(t.pack(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_unpack_roundtrip() {
        let mut buf = Vec::new();
        let t = host_tile(3, 2, 3, &mut buf);
        let payload = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        t.unpack(&payload);
        assert_eq!(t.get(2, 0), 3.0);
        assert_eq!(t.get(0, 1), 4.0);
        assert_eq!(t.pack(), payload);
    }

    #[test]
    fn test_copy_from_different_strides() {
        let mut a_buf = Vec::new();
        let mut b_buf = Vec::new();
        let a = host_tile(2, 2, 2, &mut a_buf);
        let b = host_tile(2, 2, 7, &mut b_buf);
        a.set(0, 0, 1.0);
        a.set(1, 1, -1.0);
        b.copy_from(&a);
        assert_eq!(b.get(0, 0), 1.0);
        assert_eq!(b.get(1, 1), -1.0);
    }
}
