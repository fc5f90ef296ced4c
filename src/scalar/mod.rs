//! Scalar type system for tilr matrices
//!
//! Every engine operation is generic over [`Scalar`], which connects the
//! four supported element types (f32, f64, [`Complex64`], [`Complex128`])
//! to the runtime [`ScalarType`] tag used for wire headers and arena
//! sizing. The real projection used for norms and pivot magnitude checks
//! is expressed through [`RealScalar`].

pub mod complex;

pub use complex::{Complex128, Complex64};

use bytemuck::{Pod, Zeroable};
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Runtime tag for the element type of a matrix
///
/// Using an enum alongside the `Scalar` generic lets tile payload headers
/// and batch descriptors name their element type without monomorphization.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ScalarType {
    /// 32-bit real
    F32 = 0,
    /// 64-bit real
    F64 = 1,
    /// 64-bit complex (two f32)
    C64 = 2,
    /// 128-bit complex (two f64)
    C128 = 3,
}

impl ScalarType {
    /// Size of one element in bytes
    #[inline]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F64 | Self::C64 => 8,
            Self::C128 => 16,
        }
    }

    /// Returns true for the complex types
    #[inline]
    pub const fn is_complex(self) -> bool {
        matches!(self, Self::C64 | Self::C128)
    }

    /// Short name for display (e.g. "f64", "c128")
    pub const fn short_name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::C64 => "c64",
            Self::C128 => "c128",
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Trait for types that can be elements of a tiled matrix
///
/// Implemented for f32, f64, `Complex64`, and `Complex128`. The `Pod`
/// bound lets tile payloads cross the transport as raw bytes.
pub trait Scalar:
    Copy
    + Clone
    + Send
    + Sync
    + PartialEq
    + fmt::Debug
    + Pod
    + Zeroable
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + 'static
{
    /// The real projection of this scalar (f32 or f64)
    type Real: RealScalar;

    /// The corresponding runtime tag
    const TYPE: ScalarType;

    /// Additive identity
    fn zero() -> Self;

    /// Multiplicative identity
    fn one() -> Self;

    /// Complex conjugate; identity for real types
    fn conj(self) -> Self;

    /// Magnitude as the real projection
    fn abs(self) -> Self::Real;

    /// Embed a real value
    fn from_real(r: Self::Real) -> Self;

    /// Convert from f64 (real part only for complex types)
    fn from_f64(v: f64) -> Self;

    /// Machine epsilon of the real projection
    fn epsilon() -> Self::Real;

    /// Exact-zero test, used for singularity detection
    #[inline]
    fn is_zero(self) -> bool {
        self == Self::zero()
    }
}

/// Real scalar types (the `Real` projection of every `Scalar`)
pub trait RealScalar: Scalar<Real = Self> + PartialOrd {
    /// Square root
    fn sqrt(self) -> Self;

    /// Widen to f64
    fn to_f64(self) -> f64;
}

impl Scalar for f32 {
    type Real = f32;
    const TYPE: ScalarType = ScalarType::F32;

    #[inline]
    fn zero() -> Self {
        0.0
    }

    #[inline]
    fn one() -> Self {
        1.0
    }

    #[inline]
    fn conj(self) -> Self {
        self
    }

    #[inline]
    fn abs(self) -> f32 {
        f32::abs(self)
    }

    #[inline]
    fn from_real(r: f32) -> Self {
        r
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }

    #[inline]
    fn epsilon() -> f32 {
        f32::EPSILON
    }
}

impl RealScalar for f32 {
    #[inline]
    fn sqrt(self) -> Self {
        f32::sqrt(self)
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Scalar for f64 {
    type Real = f64;
    const TYPE: ScalarType = ScalarType::F64;

    #[inline]
    fn zero() -> Self {
        0.0
    }

    #[inline]
    fn one() -> Self {
        1.0
    }

    #[inline]
    fn conj(self) -> Self {
        self
    }

    #[inline]
    fn abs(self) -> f64 {
        f64::abs(self)
    }

    #[inline]
    fn from_real(r: f64) -> Self {
        r
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }

    #[inline]
    fn epsilon() -> f64 {
        f64::EPSILON
    }
}

impl RealScalar for f64 {
    #[inline]
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_type_sizes() {
        assert_eq!(ScalarType::F32.size_in_bytes(), 4);
        assert_eq!(ScalarType::F64.size_in_bytes(), 8);
        assert_eq!(ScalarType::C64.size_in_bytes(), 8);
        assert_eq!(ScalarType::C128.size_in_bytes(), 16);
        assert_eq!(f64::TYPE, ScalarType::F64);
        assert_eq!(Complex64::TYPE, ScalarType::C64);
    }

    #[test]
    fn test_real_conj_is_identity() {
        assert_eq!(3.5f64.conj(), 3.5);
        assert_eq!((-2.0f32).conj(), -2.0);
    }

    #[test]
    fn test_abs_projection() {
        assert_eq!((-4.0f64).abs(), 4.0);
        let z = Complex128::new(3.0, 4.0);
        assert_eq!(Scalar::abs(z), 5.0);
    }
}
