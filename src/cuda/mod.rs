//! CUDA accelerator support for the `Devices` target
//!
//! One [`CudaContext`] per visible device owns the driver context, the
//! stream every tilr kernel launches on, and the lazily loaded PTX
//! module compiled by `build.rs`. Tiles are staged to devices packed
//! (stride equal to the row count); the replica table tracks device
//! copies exactly like host workspace replicas.

use crate::error::{Error, Result};
use crate::matrix::Matrix;
use crate::scalar::{Scalar, ScalarType};
use crate::tile::{DeviceId, Tile};
use cudarc::driver::safe::{CudaModule, CudaStream, LaunchConfig};
use cudarc::driver::PushKernelArg;
use cudarc::nvrtc::Ptx;
use std::sync::{Arc, Mutex, OnceLock};

/// Directory containing compiled PTX files (set by build.rs)
const KERNEL_DIR: &str = env!("CUDA_KERNEL_DIR");

/// Thread block edge for the tile gemm kernel
const GEMM_BLOCK: u32 = 16;

/// Driver context, stream, and kernel module for one device
pub struct CudaContext {
    id: DeviceId,
    ctx: Arc<cudarc::driver::safe::CudaContext>,
    stream: Arc<CudaStream>,
    gemm_module: OnceLock<Arc<CudaModule>>,
    /// Serializes sys-level allocation against staging copies
    mem_lock: Mutex<()>,
}

impl CudaContext {
    fn new(ordinal: usize) -> Result<Arc<Self>> {
        let ctx = cudarc::driver::safe::CudaContext::new(ordinal)
            .map_err(|e| Error::Internal(format!("CUDA device {ordinal} init failed: {e:?}")))?;
        let stream = ctx.default_stream();
        Ok(Arc::new(Self {
            id: ordinal as DeviceId,
            ctx,
            stream,
            gemm_module: OnceLock::new(),
            mem_lock: Mutex::new(()),
        }))
    }

    /// Device ordinal as a tilr device id
    pub fn device_id(&self) -> DeviceId {
        self.id
    }

    /// Allocate raw device memory
    pub(crate) fn malloc(&self, size_bytes: usize) -> Result<u64> {
        let _guard = self.mem_lock.lock().unwrap();
        self.ctx.bind_to_thread().map_err(ctx_err)?;
        unsafe {
            cudarc::driver::result::malloc_sync(size_bytes).map_err(|_| Error::OutOfMemory {
                size: size_bytes,
                device: self.id,
            })
        }
    }

    /// Free raw device memory
    pub(crate) fn free(&self, ptr: u64, _size_bytes: usize) {
        let _guard = self.mem_lock.lock().unwrap();
        if self.ctx.bind_to_thread().is_err() {
            // Context already torn down; the driver reclaims the memory.
            return;
        }
        unsafe {
            let _ = cudarc::driver::result::free_sync(ptr);
        }
    }

    /// Copy a host tile's payload into a packed device tile
    pub(crate) fn copy_to_device<S: Scalar>(&self, host: &Tile<S>, dev: &Tile<S>) -> Result<()> {
        let payload = host.pack();
        let bytes: &[u8] = bytemuck::cast_slice(&payload);
        self.ctx.bind_to_thread().map_err(ctx_err)?;
        unsafe {
            cudarc::driver::result::memcpy_htod_sync(dev.ptr(), bytes)
                .map_err(|e| Error::Internal(format!("H2D copy failed: {e:?}")))
        }
    }

    /// Copy a packed device tile back into a host tile
    pub(crate) fn copy_to_host<S: Scalar>(&self, dev: &Tile<S>, host: &Tile<S>) -> Result<()> {
        let len = (dev.mb() * dev.nb()) as usize * std::mem::size_of::<S>();
        let mut bytes = vec![0u8; len];
        self.ctx.bind_to_thread().map_err(ctx_err)?;
        unsafe {
            cudarc::driver::result::memcpy_dtoh_sync(&mut bytes, dev.ptr())
                .map_err(|e| Error::Internal(format!("D2H copy failed: {e:?}")))?;
        }
        let payload: Vec<S> = bytemuck::pod_collect_to_vec(&bytes);
        host.unpack(&payload);
        Ok(())
    }

    /// Block until every launch on this context's stream has completed
    pub(crate) fn synchronize(&self) -> Result<()> {
        self.stream
            .synchronize()
            .map_err(|e| Error::Internal(format!("CUDA stream sync failed: {e:?}")))
    }

    fn gemm_module(&self) -> Result<Arc<CudaModule>> {
        if let Some(m) = self.gemm_module.get() {
            return Ok(m.clone());
        }
        let ptx = Ptx::from_file(format!("{KERNEL_DIR}/gemm.ptx"));
        let module = self.ctx.load_module(ptx).map_err(|e| {
            Error::Internal(format!(
                "failed to load CUDA gemm module: {e:?}; \
                 check that build.rs compiled the kernels"
            ))
        })?;
        let _ = self.gemm_module.set(module.clone());
        Ok(module)
    }

    /// Enqueue one tile gemm on this device's stream
    ///
    /// # Safety
    /// The tiles must be packed device-resident buffers on this device
    /// with the dimensions implied by c (m x n) and a (m x k).
    pub(crate) unsafe fn launch_gemm<S: Scalar>(
        &self,
        alpha: S,
        a: &Tile<S>,
        b: &Tile<S>,
        beta: S,
        c: &Tile<S>,
    ) -> Result<()> {
        let module = self.gemm_module()?;
        let name = match S::TYPE {
            ScalarType::F32 => "gemm_f32",
            ScalarType::F64 => "gemm_f64",
            other => {
                return Err(Error::kernel(
                    "gemm",
                    format!("no device kernel for scalar type {other}"),
                ))
            }
        };
        let func = module
            .load_function(name)
            .map_err(|e| Error::kernel("gemm", format!("function {name} missing: {e:?}")))?;

        let (m, n, k) = (c.mb() as i32, c.nb() as i32, a.nb() as i32);
        let (lda, ldb, ldc) = (a.stride() as i32, b.stride() as i32, c.stride() as i32);
        let (a_ptr, b_ptr, c_ptr) = (a.ptr(), b.ptr(), c.ptr());
        let grid = (
            (m as u32 + GEMM_BLOCK - 1) / GEMM_BLOCK,
            (n as u32 + GEMM_BLOCK - 1) / GEMM_BLOCK,
            1,
        );
        let cfg = LaunchConfig {
            grid_dim: grid,
            block_dim: (GEMM_BLOCK, GEMM_BLOCK, 1),
            shared_mem_bytes: 0,
        };

        let mut builder = self.stream.launch_builder(&func);
        builder.arg(&a_ptr);
        builder.arg(&b_ptr);
        builder.arg(&c_ptr);
        builder.arg(&m);
        builder.arg(&n);
        builder.arg(&k);
        builder.arg(&lda);
        builder.arg(&ldb);
        builder.arg(&ldc);
        match S::TYPE {
            ScalarType::F32 => {
                let alpha = bytemuck::cast::<S, f32>(alpha);
                let beta = bytemuck::cast::<S, f32>(beta);
                builder.arg(&alpha);
                builder.arg(&beta);
                unsafe { builder.launch(cfg) }
            }
            _ => {
                let alpha = bytemuck::cast::<S, f64>(alpha);
                let beta = bytemuck::cast::<S, f64>(beta);
                builder.arg(&alpha);
                builder.arg(&beta);
                unsafe { builder.launch(cfg) }
            }
        }
        .map_err(|e| Error::kernel("gemm", format!("device launch failed: {e:?}")))?;
        Ok(())
    }
}

/// Contexts for every visible CUDA device, initialized once
pub fn visible_devices() -> Vec<Arc<CudaContext>> {
    static DEVICES: OnceLock<Vec<Arc<CudaContext>>> = OnceLock::new();
    DEVICES
        .get_or_init(|| {
            let count = cudarc::driver::safe::CudaContext::device_count().unwrap_or(0);
            (0..count as usize)
                .filter_map(|i| CudaContext::new(i).ok())
                .collect()
        })
        .clone()
}

fn ctx_err(e: cudarc::driver::DriverError) -> Error {
    Error::Internal(format!("CUDA context bind failed: {e:?}"))
}

/// Batched trailing gemm across the visible devices
///
/// Each output tile is assigned round-robin by its grid coordinates;
/// inputs are staged (and held) on the tile's device, the launches are
/// enqueued per stream, and every stream is synchronized once at the
/// end. Output tiles stay device-resident and modified until the driver
/// pulls origins back.
pub(crate) fn batch_gemm<S: Scalar>(
    alpha: S,
    a: &Matrix<S>,
    b: &Matrix<S>,
    beta: S,
    c: &Matrix<S>,
    work: &[(i64, i64)],
) -> Result<()> {
    let devices = visible_devices();
    debug_assert!(!devices.is_empty());

    for &(i, j) in work {
        let dev = ((i + j) as usize % devices.len()) as DeviceId;
        let ctx = &devices[dev as usize];
        let at = a.tile_to_device(i, 0, dev, true)?;
        let bt = b.tile_to_device(0, j, dev, false)?;
        let ct = c.tile_to_device(i, j, dev, false)?;
        unsafe { ctx.launch_gemm(alpha, &at, &bt, beta, &ct)? };
        c.tile_mark_modified(i, j, dev);
    }
    for ctx in &devices {
        ctx.synchronize()?;
    }
    Ok(())
}
