//! Error types for tilr

use crate::tile::DeviceId;
use thiserror::Error;

/// Result type alias using tilr's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tilr operations
///
/// The taxonomy follows the engine contract: `InvalidArgument` is surfaced
/// at entry points before any work is submitted, `OutOfMemory` and
/// `KernelFailure` abort the enclosing driver call after in-flight tasks
/// drain, and `CommunicationFailure` leaves remote replicas undefined.
/// Singular diagonals are *not* an error; they are reported through the
/// diagnostics channel (see [`crate::driver::Diagnostics`]).
#[derive(Error, Debug)]
pub enum Error {
    /// Bad dimensions, enum values, view bounds, or option values
    #[error("Invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// The argument name
        arg: &'static str,
        /// Reason for invalidity
        reason: String,
    },

    /// Memory arena exhaustion
    #[error("Out of memory: failed to allocate {size} bytes on device {device}")]
    OutOfMemory {
        /// Requested size in bytes
        size: usize,
        /// Device whose arena is exhausted
        device: DeviceId,
    },

    /// Transport error; remote replicas of this matrix are undefined
    #[error("Communication failure ({op}): {reason}")]
    CommunicationFailure {
        /// The transport operation that failed
        op: &'static str,
        /// Transport-level detail
        reason: String,
    },

    /// Underlying numerical kernel returned a fatal code
    #[error("Kernel '{kernel}' failed: {reason}")]
    KernelFailure {
        /// The kernel name
        kernel: &'static str,
        /// Failure detail
        reason: String,
    },

    /// Tile index outside the stored region of a matrix or view
    #[error("Tile index ({i}, {j}) out of bounds for {mt} x {nt} tiles")]
    TileOutOfBounds {
        /// Tile row index
        i: i64,
        /// Tile column index
        j: i64,
        /// Tile rows in the view
        mt: i64,
        /// Tile columns in the view
        nt: i64,
    },

    /// Operands live on different devices
    #[error("Device mismatch: expected {expected}, got {got}")]
    DeviceMismatch {
        /// Device required by the operation
        expected: DeviceId,
        /// Device the tile is resident on
        got: DeviceId,
    },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid-argument error
    pub fn invalid_argument(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }

    /// Create a communication failure
    pub fn comm(op: &'static str, reason: impl Into<String>) -> Self {
        Self::CommunicationFailure {
            op,
            reason: reason.into(),
        }
    }

    /// Create a kernel failure
    pub fn kernel(kernel: &'static str, reason: impl Into<String>) -> Self {
        Self::KernelFailure {
            kernel,
            reason: reason.into(),
        }
    }
}
