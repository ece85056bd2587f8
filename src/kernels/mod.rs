// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Paged attention kernels.
//!
//! The host path runs each workgroup of the launch grid under a lock-step
//! emulation ([`workgroup`]); the `cubecl` module holds the GPU path.

pub mod attention;
pub mod block_table;
pub mod cache;
pub mod config;
pub mod convert;
pub mod cubecl;
pub mod dispatch;
pub mod mfma;
pub mod qkv;
pub mod reduce;
pub mod workgroup;

pub use attention::paged_attention;
pub use block_table::{resolve_physical_block, validate_block_tables, BlockTableRow, KvLayoutKind, PagedKvLayout};
pub use cache::{convert_fp8, CacheStorage, Fp8Conversion, PagedKvCache, TokenScales};
pub use config::{
    KvCacheDtype, MfmaVariant, PagedAttentionConfig, MAX_GQA_RATIO, PARTITION_SIZE, SUPPORTED_BLOCK_SIZES,
    SUPPORTED_HEAD_SIZES,
};
pub use convert::{dequantize_fp8, quantize_fp8, CacheScalar, ComputeScalar, Fp8E4M3, OutputScalar};
pub use dispatch::{
    paged_attention_launch, select_kernel, supported_kernel_keys, Buffer, BufferMut, ElemKind, KernelKey,
    LaunchGrid, LaunchOutputs, LaunchParams,
};
pub use mfma::{Mfma16x16, Mfma4x4, MfmaShape};
