// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! # paged-attn-rs
//!
//! Paged attention for LLM decode steps, built on [Candle](https://github.com/huggingface/candle).
//!
//! Each sequence's key/value history lives in fixed-size blocks of a shared
//! cache, addressed through a per-sequence block table. Attention runs in two
//! stages:
//!
//! - a QKV kernel over `(sequence, 256-token partition, KV head)` workgroups
//!   that writes the final output for short contexts and unnormalized partial
//!   results with softmax statistics otherwise
//! - a reduction kernel over `(head, sequence)` that merges the partitions
//!
//! Supported: f16/bf16 compute, full-precision or fp8 e4m3 caches, optional
//! fp8 output, head sizes 64/128, block sizes 16/32, grouped-query ratios
//! 1 to 16, ALiBi slopes.
//!
//! ## Quick Start
//!
//! ```rust
//! use candle_core::Device;
//! use half::f16;
//! use paged_attn_rs::kernels::{paged_attention, PagedAttentionConfig, PagedKvCache};
//!
//! # fn main() -> anyhow::Result<()> {
//! let device = Device::Cpu;
//! let mut cache = PagedKvCache::<f16>::new(8, 2, 64, 16)?;
//! let token = vec![f16::from_f32(0.5); 2 * 64];
//! cache.reshape_and_cache(&token, &token, &[0], 1.0, 1.0)?;
//! let (key_cache, value_cache) = cache.to_tensors(&device)?;
//!
//! let query = candle_core::Tensor::ones((1, 4, 64), candle_core::DType::F16, &device)?;
//! let block_tables = candle_core::Tensor::new(&[[0u32]], &device)?;
//! let context_lens = candle_core::Tensor::new(&[1u32], &device)?;
//! let config = PagedAttentionConfig::new(2, 64).with_max_context_len(16);
//!
//! let out = paged_attention(&query, &key_cache, &value_cache, &block_tables, &context_lens, &config)?;
//! assert_eq!(out.dims(), &[1, 4, 64]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod kernels;
pub mod memory;

pub use error::{PagedAttnError, Result};
