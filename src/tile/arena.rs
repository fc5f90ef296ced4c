//! Per-device memory arenas
//!
//! An arena vends tile-sized buffers and reclaims them through a freelist
//! keyed by allocation size. Tile buffers are all the same few sizes, so
//! recycling hits almost always once the first driver iteration has run.

use crate::error::{Error, Result};
use crate::tile::{DeviceId, HOST_DEVICE};
use std::alloc::{alloc_zeroed, dealloc, Layout as AllocLayout};
use std::collections::HashMap;
use std::sync::Mutex;

/// Alignment for host tile buffers (AVX-512 friendly, matches pinned
/// staging requirements)
const HOST_ALIGN: usize = 64;

enum Backend {
    Host,
    #[cfg(feature = "cuda")]
    Cuda(std::sync::Arc<crate::cuda::CudaContext>),
}

/// A pool of reusable buffers for one device
///
/// `allocate` prefers the freelist; `release` returns a buffer to it.
/// With a capacity cap, `allocate` fails with [`Error::OutOfMemory`] when
/// the cap would be exceeded and no freelist buffer of the right size
/// exists. Buffers are zero-initialized on first allocation only.
pub struct Arena {
    device: DeviceId,
    backend: Backend,
    capacity: Option<usize>,
    inner: Mutex<ArenaInner>,
}

#[derive(Default)]
struct ArenaInner {
    free: HashMap<usize, Vec<u64>>,
    /// Bytes currently handed out or parked on the freelist
    allocated: usize,
    /// Bytes parked on the freelist
    parked: usize,
}

impl Arena {
    /// Create an uncapped host arena
    pub fn host() -> Self {
        Self {
            device: HOST_DEVICE,
            backend: Backend::Host,
            capacity: None,
            inner: Mutex::new(ArenaInner::default()),
        }
    }

    /// Create a host arena with a byte capacity
    pub fn host_with_capacity(capacity: usize) -> Self {
        Self {
            device: HOST_DEVICE,
            backend: Backend::Host,
            capacity: Some(capacity),
            inner: Mutex::new(ArenaInner::default()),
        }
    }

    /// Create an arena over an accelerator context
    #[cfg(feature = "cuda")]
    pub fn cuda(ctx: std::sync::Arc<crate::cuda::CudaContext>) -> Self {
        Self {
            device: ctx.device_id(),
            backend: Backend::Cuda(ctx),
            capacity: None,
            inner: Mutex::new(ArenaInner::default()),
        }
    }

    /// The device this arena serves
    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Bytes currently allocated (in use plus parked)
    pub fn allocated_bytes(&self) -> usize {
        self.inner.lock().unwrap().allocated
    }

    /// Vend a buffer of exactly `size_bytes`
    pub fn allocate(&self, size_bytes: usize) -> Result<u64> {
        if size_bytes == 0 {
            return Ok(0);
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(ptr) = inner.free.get_mut(&size_bytes).and_then(Vec::pop) {
            inner.parked -= size_bytes;
            return Ok(ptr);
        }

        if let Some(cap) = self.capacity {
            if inner.allocated - inner.parked + size_bytes > cap {
                // Spill the freelist before giving up; parked buffers of
                // other sizes are freeable.
                self.drain_freelist(&mut inner);
                if inner.allocated + size_bytes > cap {
                    return Err(Error::OutOfMemory {
                        size: size_bytes,
                        device: self.device,
                    });
                }
            }
        }

        let ptr = self.raw_alloc(size_bytes)?;
        inner.allocated += size_bytes;
        Ok(ptr)
    }

    /// Return a buffer to the freelist for reuse
    pub fn release(&self, ptr: u64, size_bytes: usize) {
        if ptr == 0 || size_bytes == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.parked += size_bytes;
        inner.free.entry(size_bytes).or_default().push(ptr);
    }

    /// Free every parked buffer back to the underlying allocator
    pub fn trim(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.drain_freelist(&mut inner);
    }

    fn drain_freelist(&self, inner: &mut ArenaInner) {
        for (size, ptrs) in inner.free.drain() {
            for ptr in ptrs {
                self.raw_free(ptr, size);
                inner.allocated -= size;
            }
        }
        inner.parked = 0;
    }

    fn raw_alloc(&self, size_bytes: usize) -> Result<u64> {
        match &self.backend {
            Backend::Host => {
                let layout = AllocLayout::from_size_align(size_bytes, HOST_ALIGN)
                    .map_err(|e| Error::Internal(format!("bad allocation layout: {e}")))?;
                let ptr = unsafe { alloc_zeroed(layout) };
                if ptr.is_null() {
                    return Err(Error::OutOfMemory {
                        size: size_bytes,
                        device: self.device,
                    });
                }
                Ok(ptr as u64)
            }
            #[cfg(feature = "cuda")]
            Backend::Cuda(ctx) => ctx.malloc(size_bytes),
        }
    }

    fn raw_free(&self, ptr: u64, size_bytes: usize) {
        match &self.backend {
            Backend::Host => {
                let layout = AllocLayout::from_size_align(size_bytes, HOST_ALIGN)
                    .expect("layout validated at allocation");
                unsafe { dealloc(ptr as *mut u8, layout) };
            }
            #[cfg(feature = "cuda")]
            Backend::Cuda(ctx) => ctx.free(ptr, size_bytes),
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        self.drain_freelist(inner);
        // Buffers still in use belong to live tiles; the replica table
        // releases them before the matrix drops its arenas.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_release_reuse() {
        let arena = Arena::host();
        let a = arena.allocate(256).unwrap();
        assert_ne!(a, 0);
        arena.release(a, 256);
        let b = arena.allocate(256).unwrap();
        assert_eq!(a, b, "freelist buffer should be recycled");
        arena.release(b, 256);
    }

    #[test]
    fn test_zero_size_is_null() {
        let arena = Arena::host();
        assert_eq!(arena.allocate(0).unwrap(), 0);
    }

    #[test]
    fn test_capacity_exhaustion() {
        let arena = Arena::host_with_capacity(1024);
        let a = arena.allocate(512).unwrap();
        let b = arena.allocate(512).unwrap();
        match arena.allocate(64) {
            Err(Error::OutOfMemory { size: 64, .. }) => {}
            other => panic!("expected OutOfMemory, got {other:?}"),
        }
        // Releasing makes room again.
        arena.release(b, 512);
        let c = arena.allocate(512).unwrap();
        arena.release(a, 512);
        arena.release(c, 512);
    }

    #[test]
    fn test_capacity_reclaims_parked_other_sizes() {
        let arena = Arena::host_with_capacity(1024);
        let a = arena.allocate(1024).unwrap();
        arena.release(a, 1024);
        // A differently sized request must evict the parked 1024-byte
        // buffer rather than fail.
        let b = arena.allocate(256).unwrap();
        assert_ne!(b, 0);
        arena.release(b, 256);
    }

    #[test]
    fn test_allocated_accounting() {
        let arena = Arena::host();
        assert_eq!(arena.allocated_bytes(), 0);
        let a = arena.allocate(128).unwrap();
        assert_eq!(arena.allocated_bytes(), 128);
        arena.release(a, 128);
        assert_eq!(arena.allocated_bytes(), 128);
        arena.trim();
        assert_eq!(arena.allocated_bytes(), 0);
    }
}
