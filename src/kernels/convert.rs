// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Numeric conversion layer.
//!
//! Bit-exact conversions between `f32`, the 16-bit compute dtypes
//! ([`f16`], [`bf16`]) and the 8-bit KV-cache storage dtype ([`Fp8E4M3`]).
//!
//! ## Rounding
//!
//! - `f32 -> f16 / bf16`: round-to-nearest-even, matching the accelerator's
//!   packing instructions.
//! - `f32 -> fp8 e4m3`: the mantissa is **truncated** toward zero (no
//!   rounding), magnitudes at or above 448 saturate to ±448, NaN maps to the
//!   e4m3 NaN encoding. Every e4m3 value is exactly representable in both
//!   16-bit dtypes, so `fp8 -> f16 / bf16` is lossless.
//!
//! ## Scales
//!
//! Quantized values carry an external multiplicative scale:
//! `q = fp8(x / scale)` and `x ≈ f32(q) * scale`. Full-precision formats
//! ignore the scale entirely.
//!
//! The scalar traits are sealed: instantiating a kernel with any other element
//! type is a compile error, never a runtime one.

use candle_core::{DType, WithDType};
use half::{bf16, f16};

mod sealed {
    pub trait Sealed {}
    impl Sealed for half::f16 {}
    impl Sealed for half::bf16 {}
    impl Sealed for super::Fp8E4M3 {}
}

/// 16-bit compute dtype used for queries, dequantized K/V and partial outputs.
pub trait ComputeScalar:
    WithDType + Copy + Default + Send + Sync + std::fmt::Debug + 'static + sealed::Sealed
{
    /// Candle dtype of this scalar.
    const DTYPE: DType;

    /// Round-to-nearest-even conversion from `f32`.
    fn from_f32(v: f32) -> Self;

    /// Exact widening conversion to `f32`.
    fn to_f32(self) -> f32;
}

impl ComputeScalar for f16 {
    const DTYPE: DType = DType::F16;

    #[inline]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }

    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
}

impl ComputeScalar for bf16 {
    const DTYPE: DType = DType::BF16;

    #[inline]
    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }

    #[inline]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }
}

/// 8-bit floating point, OCP e4m3 ("fn") encoding: 1 sign, 4 exponent
/// (bias 7) and 3 mantissa bits, no infinities, `0x7F`/`0xFF` are NaN.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Fp8E4M3(pub u8);

impl Fp8E4M3 {
    /// Largest finite magnitude.
    pub const MAX: f32 = 448.0;
    /// Smallest positive normal value (2^-6).
    pub const MIN_POSITIVE: f32 = 0.015_625;
    /// Spacing of the subnormal range (2^-9).
    pub const SUBNORMAL_STEP: f32 = 0.001_953_125;
    /// Canonical NaN.
    pub const NAN: Self = Self(0x7F);

    const MAX_FINITE_BITS: u8 = 0x7E;

    /// Truncating, saturating conversion from `f32`.
    #[must_use]
    pub fn from_f32(v: f32) -> Self {
        let sign = ((v.to_bits() >> 24) & 0x80) as u8;
        if v.is_nan() {
            return Self(sign | 0x7F);
        }

        let abs = v.abs();
        if abs >= Self::MAX {
            return Self(sign | Self::MAX_FINITE_BITS);
        }
        if abs < Self::MIN_POSITIVE {
            // Exact: scaling by a power of two, result is below 8.
            let mant = (abs / Self::SUBNORMAL_STEP) as u8;
            return Self(sign | mant);
        }

        let bits = abs.to_bits();
        let exp = ((bits >> 23) & 0xFF) as i32 - 127;
        let mant = ((bits >> 20) & 0x7) as u8;
        Self(sign | (((exp + 7) as u8) << 3) | mant)
    }

    /// Exact conversion to `f32`.
    #[must_use]
    pub fn to_f32(self) -> f32 {
        let negative = self.0 & 0x80 != 0;
        let exp = u32::from((self.0 >> 3) & 0x0F);
        let mant = u32::from(self.0 & 0x07);

        if exp == 0x0F && mant == 0x07 {
            return f32::NAN;
        }

        let magnitude = if exp == 0 {
            mant as f32 * Self::SUBNORMAL_STEP
        } else {
            f32::from_bits(((exp + 120) << 23) | (mant << 20))
        };
        if negative {
            -magnitude
        } else {
            magnitude
        }
    }

    /// Raw storage bits.
    #[must_use]
    pub const fn to_bits(self) -> u8 {
        self.0
    }

    /// Reinterpret raw storage bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Whether this encodes NaN.
    #[must_use]
    pub const fn is_nan(self) -> bool {
        self.0 & 0x7F == 0x7F
    }
}

/// Quantize `x` with a multiplicative scale: `fp8(x / scale)`.
#[inline]
#[must_use]
pub fn quantize_fp8(x: f32, scale: f32) -> Fp8E4M3 {
    Fp8E4M3::from_f32(x / scale)
}

/// Dequantize with a multiplicative scale: `f32(q) * scale`.
#[inline]
#[must_use]
pub fn dequantize_fp8(q: Fp8E4M3, scale: f32) -> f32 {
    q.to_f32() * scale
}

/// Storage element of the paged KV cache, for a given compute dtype `T`.
///
/// Implemented for `T` itself (full precision, `kv_cache_dtype = "auto"`) and
/// for [`Fp8E4M3`] (quantized cache).
pub trait CacheScalar<T: ComputeScalar>: Copy + Default + Send + Sync + 'static + sealed::Sealed {
    /// Whether values are stored quantized and need `k_scale` / `v_scale`.
    const QUANTIZED: bool;

    /// Candle dtype of the storage tensor.
    const STORAGE_DTYPE: DType;

    /// Unscaled conversion into the compute dtype. The kernel folds the cache
    /// scale into the softmax scale (keys) and the accumulated output (values).
    fn to_compute(self) -> T;

    /// Store a compute value. `scale` is ignored for full-precision storage.
    fn from_compute(v: T, scale: f32) -> Self;
}

macro_rules! impl_cache_scalar {
    ($t:ty) => {
        impl CacheScalar<$t> for $t {
            const QUANTIZED: bool = false;
            const STORAGE_DTYPE: DType = <$t as ComputeScalar>::DTYPE;

            #[inline]
            fn to_compute(self) -> $t {
                self
            }

            #[inline]
            fn from_compute(v: $t, _scale: f32) -> Self {
                v
            }
        }

        impl CacheScalar<$t> for Fp8E4M3 {
            const QUANTIZED: bool = true;
            const STORAGE_DTYPE: DType = DType::U8;

            #[inline]
            fn to_compute(self) -> $t {
                <$t as ComputeScalar>::from_f32(self.to_f32())
            }

            #[inline]
            fn from_compute(v: $t, scale: f32) -> Self {
                quantize_fp8(v.to_f32(), scale)
            }
        }
    };
}

impl_cache_scalar!(f16);
impl_cache_scalar!(bf16);

/// Element of the final attention output buffer.
pub trait OutputScalar: Copy + Default + Send + Sync + 'static + sealed::Sealed {
    /// Candle dtype of the output tensor.
    const STORAGE_DTYPE: DType;

    /// Convert a normalized `f32` result. `scale` is ignored unless quantized.
    fn store(v: f32, scale: f32) -> Self;
}

impl OutputScalar for f16 {
    const STORAGE_DTYPE: DType = DType::F16;

    fn store(v: f32, _scale: f32) -> Self {
        f16::from_f32(v)
    }
}

impl OutputScalar for bf16 {
    const STORAGE_DTYPE: DType = DType::BF16;

    fn store(v: f32, _scale: f32) -> Self {
        bf16::from_f32(v)
    }
}

impl OutputScalar for Fp8E4M3 {
    const STORAGE_DTYPE: DType = DType::U8;

    fn store(v: f32, scale: f32) -> Self {
        quantize_fp8(v, scale)
    }
}

/// Four `f32` accumulator lanes, the result register of one MFMA row.
pub type F32x4 = [f32; 4];

/// Element-wise add of two accumulator quads.
#[inline]
#[must_use]
pub fn addx4(a: F32x4, b: F32x4) -> F32x4 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2], a[3] + b[3]]
}

/// Four 16-bit values packed the way the MFMA operand registers hold them.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Packed4<T>(pub [T; 4]);

impl<T: ComputeScalar> Packed4<T> {
    /// Pack four `f32` values (round-to-nearest-even per element).
    #[must_use]
    pub fn from_f32x4(v: F32x4) -> Self {
        Self([
            T::from_f32(v[0]),
            T::from_f32(v[1]),
            T::from_f32(v[2]),
            T::from_f32(v[3]),
        ])
    }

    /// Load four consecutive elements starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4 > src.len()`.
    #[must_use]
    pub fn load(src: &[T], offset: usize) -> Self {
        Self([src[offset], src[offset + 1], src[offset + 2], src[offset + 3]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fp8_known_encodings() {
        assert_eq!(Fp8E4M3::from_f32(0.0).to_bits(), 0x00);
        assert_eq!(Fp8E4M3::from_f32(-0.0).to_bits(), 0x80);
        assert_eq!(Fp8E4M3::from_f32(1.0).to_bits(), 0x38);
        assert_eq!(Fp8E4M3::from_f32(-2.0).to_bits(), 0xC0);
        assert_eq!(Fp8E4M3::from_f32(448.0).to_bits(), 0x7E);
        assert_eq!(Fp8E4M3::from_f32(Fp8E4M3::MIN_POSITIVE).to_bits(), 0x08);
        assert_eq!(Fp8E4M3::from_f32(Fp8E4M3::SUBNORMAL_STEP).to_bits(), 0x01);
    }

    #[test]
    fn test_fp8_truncates_mantissa() {
        // 1.124 lies between 1.0 and 1.125; truncation keeps 1.0.
        assert_eq!(Fp8E4M3::from_f32(1.124).to_f32(), 1.0);
        assert_eq!(Fp8E4M3::from_f32(1.125).to_f32(), 1.125);
        assert_eq!(Fp8E4M3::from_f32(-1.249).to_f32(), -1.125);
    }

    #[test]
    fn test_fp8_saturates() {
        assert_eq!(Fp8E4M3::from_f32(1.0e6).to_f32(), 448.0);
        assert_eq!(Fp8E4M3::from_f32(f32::NEG_INFINITY).to_f32(), -448.0);
        assert_eq!(Fp8E4M3::from_f32(479.0).to_f32(), 448.0);
    }

    #[test]
    fn test_fp8_nan() {
        assert!(Fp8E4M3::from_f32(f32::NAN).is_nan());
        assert!(Fp8E4M3::NAN.to_f32().is_nan());
        assert!(Fp8E4M3::from_bits(0xFF).to_f32().is_nan());
        assert!(!Fp8E4M3::from_bits(0x7E).is_nan());
    }

    #[test]
    fn test_fp8_decode_every_finite_code_is_exact_in_16bit() {
        for bits in 0u8..=255 {
            let q = Fp8E4M3::from_bits(bits);
            if q.is_nan() {
                continue;
            }
            let v = q.to_f32();
            assert_eq!(f16::from_f32(v).to_f32(), v, "f16 code {bits:#04x}");
            assert_eq!(bf16::from_f32(v).to_f32(), v, "bf16 code {bits:#04x}");
            // Re-encoding an exact value reproduces the code (modulo -0.0).
            if v != 0.0 {
                assert_eq!(Fp8E4M3::from_f32(v).to_bits(), bits);
            }
        }
    }

    #[test]
    fn test_scaled_round_trip() {
        let scale = 0.05;
        for &x in &[0.3f32, -1.7, 12.5, 0.0009, -20.0] {
            let back = dequantize_fp8(quantize_fp8(x, scale), scale);
            let tol = x.abs() * 0.125 + Fp8E4M3::SUBNORMAL_STEP * scale;
            assert!((back - x).abs() <= tol, "x={x} back={back}");
        }
    }

    #[test]
    fn test_compute_rounding_is_nearest_even() {
        // 1 + 2^-11 is exactly halfway between two f16 values; ties go to even.
        let halfway = 1.0 + f32::powi(2.0, -11);
        assert_eq!(<f16 as ComputeScalar>::from_f32(halfway).to_f32(), 1.0);
        let above = 1.0 + 3.0 * f32::powi(2.0, -11);
        assert_eq!(
            <f16 as ComputeScalar>::from_f32(above).to_f32(),
            1.0 + f32::powi(2.0, -9)
        );
    }

    #[test]
    fn test_packed_quad() {
        // 1 + 2^-9 needs 9 mantissa bits; bf16 rounds it to 1.
        let a = Packed4::<bf16>::from_f32x4([1.0 + f32::powi(2.0, -9), 2.0, -3.0, 0.5]);
        assert_eq!(a.0.map(bf16::to_f32), [1.0, 2.0, -3.0, 0.5]);
        let src = [a.0, a.0].concat();
        assert_eq!(Packed4::load(&src, 4), a);
        assert_eq!(addx4([1.0; 4], [0.5, 0.25, -1.0, 0.0]), [1.5, 1.25, 0.0, 1.0]);
    }

    #[test]
    fn test_cache_scalar_ignores_scale_for_full_precision() {
        let v = f16::from_f32(3.0);
        let stored = <f16 as CacheScalar<f16>>::from_compute(v, 1000.0);
        assert_eq!(stored, v);
        assert!(!<f16 as CacheScalar<f16>>::QUANTIZED);
        assert!(<Fp8E4M3 as CacheScalar<f16>>::QUANTIZED);
    }

    #[test]
    fn test_output_scalar_scale() {
        assert_eq!(<f16 as OutputScalar>::store(2.0, 100.0).to_f32(), 2.0);
        let q = <Fp8E4M3 as OutputScalar>::store(2.0, 0.5);
        assert_eq!(q.to_f32(), 4.0);
        assert_eq!(<Fp8E4M3 as OutputScalar>::STORAGE_DTYPE, DType::U8);
    }

    proptest::proptest! {
        #[test]
        fn prop_fp8_round_trip_within_precision(
            unit in -1.0f32..1.0,
            scale in 0.01f32..10.0,
        ) {
            let x = unit * Fp8E4M3::MAX * scale;
            let back = dequantize_fp8(quantize_fp8(x, scale), scale);
            // Truncation keeps 3 mantissa bits; subnormals have a fixed step.
            let tol = x.abs() * 0.125 + Fp8E4M3::SUBNORMAL_STEP * scale;
            proptest::prop_assert!((back - x).abs() <= tol, "x={} back={}", x, back);
            proptest::prop_assert!(back.abs() <= x.abs() * (1.0 + 1e-6));
        }
    }
}
