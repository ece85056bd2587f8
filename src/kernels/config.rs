// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Launch parameters for paged attention.
//!
//! [`PagedAttentionConfig`] carries the scalar arguments of one
//! paged-attention call. The tensor-level entry point checks it against the
//! tensors with [`PagedAttentionConfig::validate`] before any kernel work.

use std::fmt;
use std::str::FromStr;

use super::block_table::KvLayoutKind;
use crate::error::{PagedAttnError, Result};

/// Context tokens handled by one QKV workgroup.
pub const PARTITION_SIZE: usize = 256;

/// Head sizes with a kernel specialization.
pub const SUPPORTED_HEAD_SIZES: [usize; 2] = [64, 128];

/// Block sizes with a kernel specialization.
pub const SUPPORTED_BLOCK_SIZES: [usize; 2] = [16, 32];

/// Largest supported number of query heads per KV head.
pub const MAX_GQA_RATIO: usize = 16;

/// Storage format of the paged KV cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KvCacheDtype {
    /// Same dtype as the query.
    #[default]
    Auto,
    /// 8-bit e4m3 floats with `k_scale` / `v_scale`.
    Fp8E4M3,
}

impl KvCacheDtype {
    /// Canonical selector string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Fp8E4M3 => "fp8_e4m3",
        }
    }

    /// Whether the cache stores quantized values.
    #[must_use]
    pub const fn is_quantized(self) -> bool {
        matches!(self, Self::Fp8E4M3)
    }
}

impl fmt::Display for KvCacheDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KvCacheDtype {
    type Err = PagedAttnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "fp8" | "fp8_e4m3" => Ok(Self::Fp8E4M3),
            other => Err(PagedAttnError::UnsupportedConfig(format!(
                "kv cache dtype `{other}` (expected auto, fp8 or fp8_e4m3)"
            ))),
        }
    }
}

/// Matrix-accumulate instruction shape used by the QKV kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MfmaVariant {
    /// Pick from the GQA ratio.
    #[default]
    Auto,
    /// 4×4×4 tiles.
    Mfma4x4,
    /// 16×16×16 tiles.
    Mfma16x16,
}

impl MfmaVariant {
    /// Concrete variant for `gqa_ratio`: 4×4 covers up to 4 heads per KV head
    /// in a single row tile, 16×16 is used above that.
    #[must_use]
    pub const fn resolve(self, gqa_ratio: usize) -> Self {
        match self {
            Self::Auto if gqa_ratio <= 4 => Self::Mfma4x4,
            Self::Auto => Self::Mfma16x16,
            concrete => concrete,
        }
    }
}

/// Scalar arguments of a paged-attention call.
///
/// # Example
///
/// ```rust
/// use paged_attn_rs::kernels::{MfmaVariant, PagedAttentionConfig};
///
/// let config = PagedAttentionConfig::new(8, 128)
///     .with_block_size(32)
///     .with_mfma(MfmaVariant::Mfma16x16);
/// assert!((config.scale - 1.0 / 128f32.sqrt()).abs() < 1e-7);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PagedAttentionConfig {
    /// KV heads in the cache.
    pub num_kv_heads: usize,
    /// Softmax temperature applied to `q·k`.
    pub scale: f32,
    /// Tokens per cache block.
    pub block_size: usize,
    /// Upper bound on any `context_len` in the batch; sizes the intermediates.
    pub max_context_len: usize,
    /// Cache storage format.
    pub kv_cache_dtype: KvCacheDtype,
    /// Memory order of the K/V cache tensors.
    pub kv_layout: KvLayoutKind,
    /// Key dequantization scale (ignored for [`KvCacheDtype::Auto`]).
    pub k_scale: f32,
    /// Value dequantization scale (ignored for [`KvCacheDtype::Auto`]).
    pub v_scale: f32,
    /// When set, the output is stored as fp8 e4m3 with this scale.
    pub out_scale: Option<f32>,
    /// Per-head ALiBi slopes, `[num_heads]`.
    pub alibi_slopes: Option<Vec<f32>>,
    /// Tokens per partition; only [`PARTITION_SIZE`] is supported.
    pub partition_size: usize,
    /// Instruction shape of the QKV kernel.
    pub mfma: MfmaVariant,
}

impl Default for PagedAttentionConfig {
    fn default() -> Self {
        Self {
            num_kv_heads: 1,
            scale: 1.0 / 128f32.sqrt(),
            block_size: 16,
            max_context_len: 4096,
            kv_cache_dtype: KvCacheDtype::Auto,
            kv_layout: KvLayoutKind::Paged,
            k_scale: 1.0,
            v_scale: 1.0,
            out_scale: None,
            alibi_slopes: None,
            partition_size: PARTITION_SIZE,
            mfma: MfmaVariant::Auto,
        }
    }
}

impl PagedAttentionConfig {
    /// Config for `num_kv_heads` heads of size `head_size`, with the usual
    /// `1/sqrt(head_size)` scale.
    #[must_use]
    pub fn new(num_kv_heads: usize, head_size: usize) -> Self {
        Self {
            num_kv_heads,
            scale: 1.0 / (head_size as f32).sqrt(),
            ..Self::default()
        }
    }

    /// Use an fp8 e4m3 cache with the given dequantization scales.
    #[must_use]
    pub fn for_fp8_cache(mut self, k_scale: f32, v_scale: f32) -> Self {
        self.kv_cache_dtype = KvCacheDtype::Fp8E4M3;
        self.k_scale = k_scale;
        self.v_scale = v_scale;
        self
    }

    /// Add per-head ALiBi slopes.
    #[must_use]
    pub fn with_alibi(mut self, slopes: Vec<f32>) -> Self {
        self.alibi_slopes = Some(slopes);
        self
    }

    /// Store the output as fp8 e4m3 with `scale`.
    #[must_use]
    pub const fn with_output_scale(mut self, scale: f32) -> Self {
        self.out_scale = Some(scale);
        self
    }

    /// Force an instruction shape.
    #[must_use]
    pub const fn with_mfma(mut self, mfma: MfmaVariant) -> Self {
        self.mfma = mfma;
        self
    }

    /// Set the cache block size.
    #[must_use]
    pub const fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Read caches in another memory order.
    #[must_use]
    pub const fn with_kv_layout(mut self, kv_layout: KvLayoutKind) -> Self {
        self.kv_layout = kv_layout;
        self
    }

    /// Set the softmax scale.
    #[must_use]
    pub const fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    /// Set the maximum context length of the batch.
    #[must_use]
    pub const fn with_max_context_len(mut self, max_context_len: usize) -> Self {
        self.max_context_len = max_context_len;
        self
    }

    /// Partitions needed for `max_context_len`; sizes the intermediates.
    #[must_use]
    pub const fn max_num_partitions(&self) -> usize {
        self.max_context_len.div_ceil(self.partition_size)
    }

    /// Check the scalar arguments against the supported specialization set
    /// for a query with `num_heads` heads of `head_size`.
    ///
    /// # Errors
    ///
    /// Returns [`PagedAttnError::UnsupportedConfig`] for a head size, block
    /// size, GQA ratio or partition size without a specialization, and
    /// [`PagedAttnError::InvalidArgument`] for malformed scalars.
    pub fn validate(&self, num_heads: usize, head_size: usize) -> Result<()> {
        if !SUPPORTED_HEAD_SIZES.contains(&head_size) {
            return Err(PagedAttnError::UnsupportedConfig(format!(
                "head size {head_size} (supported: {SUPPORTED_HEAD_SIZES:?})"
            )));
        }
        if !SUPPORTED_BLOCK_SIZES.contains(&self.block_size) {
            return Err(PagedAttnError::UnsupportedConfig(format!(
                "block size {} (supported: {SUPPORTED_BLOCK_SIZES:?})",
                self.block_size
            )));
        }
        if self.partition_size != PARTITION_SIZE {
            return Err(PagedAttnError::UnsupportedConfig(format!(
                "partition size {} (only {PARTITION_SIZE} is supported)",
                self.partition_size
            )));
        }
        if self.num_kv_heads == 0 || num_heads % self.num_kv_heads != 0 {
            return Err(PagedAttnError::UnsupportedConfig(format!(
                "{num_heads} query heads cannot be grouped over {} kv heads",
                self.num_kv_heads
            )));
        }
        let gqa_ratio = num_heads / self.num_kv_heads;
        if !(1..=MAX_GQA_RATIO).contains(&gqa_ratio) {
            return Err(PagedAttnError::UnsupportedConfig(format!(
                "gqa ratio {gqa_ratio} (supported: 1..={MAX_GQA_RATIO})"
            )));
        }
        if !self.scale.is_finite() {
            return Err(PagedAttnError::invalid("scale", "must be finite"));
        }
        if self.kv_cache_dtype.is_quantized() {
            check_scale("k_scale", self.k_scale)?;
            check_scale("v_scale", self.v_scale)?;
        }
        if let Some(out_scale) = self.out_scale {
            check_scale("out_scale", out_scale)?;
        }
        if let Some(slopes) = &self.alibi_slopes {
            if slopes.len() != num_heads {
                return Err(PagedAttnError::ShapeMismatch {
                    name: "alibi_slopes",
                    expected: vec![num_heads],
                    actual: vec![slopes.len()],
                });
            }
        }
        Ok(())
    }
}

fn check_scale(arg: &'static str, scale: f32) -> Result<()> {
    if scale.is_finite() && scale > 0.0 {
        Ok(())
    } else {
        Err(PagedAttnError::invalid(
            arg,
            format!("{scale} is not a positive finite scale"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PagedAttentionConfig::default();
        assert_eq!(config.partition_size, 256);
        assert_eq!(config.kv_cache_dtype, KvCacheDtype::Auto);
        assert!(config.out_scale.is_none());
        assert!(config.validate(1, 128).is_ok());
    }

    #[test]
    fn test_kv_cache_dtype_parsing() {
        assert_eq!("auto".parse::<KvCacheDtype>().unwrap(), KvCacheDtype::Auto);
        assert_eq!("fp8".parse::<KvCacheDtype>().unwrap(), KvCacheDtype::Fp8E4M3);
        assert_eq!(
            "fp8_e4m3".parse::<KvCacheDtype>().unwrap(),
            KvCacheDtype::Fp8E4M3
        );
        assert!("fp8_e5m2".parse::<KvCacheDtype>().is_err());
        assert_eq!(KvCacheDtype::Fp8E4M3.to_string(), "fp8_e4m3");
    }

    #[test]
    fn test_mfma_auto_resolution() {
        assert_eq!(MfmaVariant::Auto.resolve(1), MfmaVariant::Mfma4x4);
        assert_eq!(MfmaVariant::Auto.resolve(4), MfmaVariant::Mfma4x4);
        assert_eq!(MfmaVariant::Auto.resolve(5), MfmaVariant::Mfma16x16);
        assert_eq!(MfmaVariant::Mfma4x4.resolve(16), MfmaVariant::Mfma4x4);
    }

    #[test]
    fn test_builder_pattern() {
        let config = PagedAttentionConfig::new(2, 64)
            .for_fp8_cache(0.5, 0.25)
            .with_alibi(vec![0.1; 16])
            .with_output_scale(2.0)
            .with_max_context_len(1000);
        assert_eq!(config.kv_cache_dtype, KvCacheDtype::Fp8E4M3);
        assert_eq!(config.max_num_partitions(), 4);
        assert!((config.scale - 0.125).abs() < 1e-7);
        assert!(config.validate(16, 64).is_ok());
    }

    #[test]
    fn test_validate_rejects_unsupported() {
        let config = PagedAttentionConfig::new(1, 128);
        assert!(matches!(
            config.validate(1, 96),
            Err(PagedAttnError::UnsupportedConfig(_))
        ));
        assert!(matches!(
            config.clone().with_block_size(8).validate(1, 128),
            Err(PagedAttnError::UnsupportedConfig(_))
        ));
        assert!(matches!(
            config.validate(17, 128),
            Err(PagedAttnError::UnsupportedConfig(_))
        ));
        let mut config = PagedAttentionConfig::new(3, 128);
        assert!(config.validate(4, 128).is_err());
        config.partition_size = 512;
        assert!(config.validate(3, 128).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_scales() {
        let config = PagedAttentionConfig::new(1, 64).for_fp8_cache(0.0, 1.0);
        assert!(matches!(
            config.validate(1, 64),
            Err(PagedAttnError::InvalidArgument { arg: "k_scale", .. })
        ));
        // Scales are not consulted for a full-precision cache.
        let mut config = PagedAttentionConfig::new(1, 64);
        config.k_scale = f32::NAN;
        assert!(config.validate(1, 64).is_ok());
        assert!(config.with_alibi(vec![0.0; 2]).validate(1, 64).is_err());
    }
}
