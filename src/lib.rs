//! # tilr
//!
//! **Tiled distributed dense linear algebra for Rust.**
//!
//! tilr executes dense matrix factorizations on matrices distributed
//! block-cyclically over a grid of processes, overlapping communication,
//! CPU panel work, and accelerator trailing updates through a
//! token-dataflow scheduler with configurable lookahead.
//!
//! ## Architecture
//!
//! ```text
//! driver (getrf_nopiv: right-looking LU with lookahead)
//! ├── schedule (token-dataflow task pool, two priorities)
//! ├── kernel (tile gemm/trsm/getrf adapters, four targets)
//! ├── matrix (block-cyclic tiles, views, replica table, broadcasts)
//! │   ├── tile (tile handles + per-device arenas)
//! │   └── comm (process grid, tagged transport)
//! └── scalar (f32 / f64 / Complex64 / Complex128)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tilr::prelude::*;
//!
//! let grid = ProcessGrid::solo();
//! let a = Matrix::<f64>::new(1024, 1024, 128, grid)?;
//! // ... fill local tiles ...
//! let report = getrf_nopiv(&a, &Options::new().with_lookahead(2))?;
//! assert!(!report.is_singular());
//! ```
//!
//! ## Feature Flags
//!
//! - `rayon` (default): multi-threaded host kernel targets
//! - `cuda`: NVIDIA accelerator support for the `Devices` target

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]

pub mod comm;
pub mod driver;
pub mod error;
pub mod kernel;
pub mod matrix;
pub mod scalar;
pub mod schedule;
pub mod tile;

#[cfg(feature = "cuda")]
pub mod cuda;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::comm::{LocalCluster, ProcessGrid, Transport};
    pub use crate::driver::{getrf_nopiv, Diagnostics, OptionKey, OptionValue, Options};
    pub use crate::error::{Error, Result};
    pub use crate::kernel::Target;
    pub use crate::matrix::{Matrix, MatrixKind, Op, Uplo};
    pub use crate::scalar::{Complex128, Complex64, Scalar, ScalarType};
    pub use crate::tile::{Tile, TileLayout, HOST_DEVICE};
}
