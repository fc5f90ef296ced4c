//! Complex number types for the complex-valued factorizations
//!
//! Complex numbers are stored in interleaved format (re, im), matching the
//! convention of every numerical library this engine may exchange tiles
//! with. Both types are `Pod`, so tile payloads cast to bytes for the
//! transport without copying.

use super::{RealScalar, Scalar, ScalarType};
use bytemuck::{Pod, Zeroable};
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

#[cfg(feature = "cuda")]
use cudarc::driver::DeviceRepr;

/// Macro to implement a complex number type with all operations
///
/// Avoids code duplication between Complex64 and Complex128.
macro_rules! impl_complex {
    ($name:ident, $float:ty, $scalar_type:expr, $doc_bits:literal) => {
        #[doc = concat!($doc_bits, "-bit complex number, interleaved (re, im) layout")]
        #[repr(C)]
        #[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
        pub struct $name {
            /// Real part
            pub re: $float,
            /// Imaginary part
            pub im: $float,
        }

        impl $name {
            /// Zero complex number
            pub const ZERO: Self = Self { re: 0.0, im: 0.0 };

            /// One (real unit)
            pub const ONE: Self = Self { re: 1.0, im: 0.0 };

            /// Imaginary unit i
            pub const I: Self = Self { re: 0.0, im: 1.0 };

            /// Create a new complex number
            #[inline]
            pub const fn new(re: $float, im: $float) -> Self {
                Self { re, im }
            }

            /// Magnitude: |z| = sqrt(re^2 + im^2)
            #[inline]
            pub fn magnitude(self) -> $float {
                (self.re * self.re + self.im * self.im).sqrt()
            }

            /// Squared magnitude: |z|^2
            #[inline]
            pub fn magnitude_squared(self) -> $float {
                self.re * self.re + self.im * self.im
            }

            /// Complex conjugate: conj(a + bi) = a - bi
            #[inline]
            pub fn conj(self) -> Self {
                Self {
                    re: self.re,
                    im: -self.im,
                }
            }
        }

        impl Add for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: Self) -> Self {
                Self {
                    re: self.re + rhs.re,
                    im: self.im + rhs.im,
                }
            }
        }

        impl Sub for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: Self) -> Self {
                Self {
                    re: self.re - rhs.re,
                    im: self.im - rhs.im,
                }
            }
        }

        impl Mul for $name {
            type Output = Self;

            #[inline]
            fn mul(self, rhs: Self) -> Self {
                Self {
                    re: self.re * rhs.re - self.im * rhs.im,
                    im: self.re * rhs.im + self.im * rhs.re,
                }
            }
        }

        impl Div for $name {
            type Output = Self;

            #[inline]
            fn div(self, rhs: Self) -> Self {
                let denom = rhs.magnitude_squared();
                Self {
                    re: (self.re * rhs.re + self.im * rhs.im) / denom,
                    im: (self.im * rhs.re - self.re * rhs.im) / denom,
                }
            }
        }

        impl Neg for $name {
            type Output = Self;

            #[inline]
            fn neg(self) -> Self {
                Self {
                    re: -self.re,
                    im: -self.im,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.im < 0.0 {
                    write!(f, "{}{}i", self.re, self.im)
                } else {
                    write!(f, "{}+{}i", self.re, self.im)
                }
            }
        }

        impl Scalar for $name {
            type Real = $float;
            const TYPE: ScalarType = $scalar_type;

            #[inline]
            fn zero() -> Self {
                Self::ZERO
            }

            #[inline]
            fn one() -> Self {
                Self::ONE
            }

            #[inline]
            fn conj(self) -> Self {
                $name::conj(self)
            }

            #[inline]
            fn abs(self) -> $float {
                self.magnitude()
            }

            #[inline]
            fn from_real(r: $float) -> Self {
                Self { re: r, im: 0.0 }
            }

            #[inline]
            fn from_f64(v: f64) -> Self {
                Self {
                    re: v as $float,
                    im: 0.0,
                }
            }

            #[inline]
            fn epsilon() -> $float {
                <$float>::EPSILON
            }
        }

        #[cfg(feature = "cuda")]
        unsafe impl DeviceRepr for $name {}
    };
}

impl_complex!(Complex64, f32, ScalarType::C64, "64");
impl_complex!(Complex128, f64, ScalarType::C128, "128");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic() {
        let z = Complex128::new(3.0, 4.0);
        let w = Complex128::new(1.0, 2.0);

        assert_eq!(z + w, Complex128::new(4.0, 6.0));
        assert_eq!(z - w, Complex128::new(2.0, 2.0));
        // (3+4i)(1+2i) = 3 + 6i + 4i - 8 = -5 + 10i
        assert_eq!(z * w, Complex128::new(-5.0, 10.0));

        let r = (z / w) * w;
        assert!((r.re - 3.0).abs() < 1e-14);
        assert!((r.im - 4.0).abs() < 1e-14);
    }

    #[test]
    fn test_conj_involution() {
        let z = Complex64::new(1.5, -2.5);
        assert_eq!(z.conj().conj(), z);
    }

    #[test]
    fn test_magnitude() {
        assert_eq!(Complex128::new(3.0, 4.0).magnitude(), 5.0);
        assert_eq!(Complex64::ZERO.magnitude(), 0.0);
    }

    #[test]
    fn test_div_by_self_is_one() {
        let z = Complex128::new(2.0, -7.0);
        let q = z / z;
        assert!((q.re - 1.0).abs() < 1e-15);
        assert!(q.im.abs() < 1e-15);
    }
}
