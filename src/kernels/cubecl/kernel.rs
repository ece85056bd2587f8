// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Paged attention `CubeCL` kernels.
//!
//! Two launches mirror the host workgroup kernels:
//!
//! ```text
//! QKV     grid (num_seqs, max_num_partitions, num_kv_heads), 256 units
//!         unit t owns token partition*256 + t of the sequence
//!         for each query head of the KV-head group:
//!             s_t   = q·k_t * scale + slope * (t + 1 - ctx)     (valid tokens)
//!             m     = tree_max(s)
//!             p_t   = exp(s_t - m), 0 for masked tokens
//!             l     = tree_sum(p)
//!             acc_d = Σ_t p_t v_t[d]                            (units d < head_size)
//!         one partition:   out = acc / l
//!         otherwise:       tmp_out = acc / l, exp_sums = l, max_logits = m
//!
//! REDUCE  grid (num_heads, num_seqs), 256 units
//!         returns at once when the sequence has a single partition
//!         w_p = l_p e^(m_p - M)
//!         out = Σ_p tmp_out_p w_p / Σ_p w_p
//! ```
//!
//! The kernels compute in f32. fp8 caches are decoded on the host and their
//! scales folded in: `k_scale` into the logit scale, `v_scale` into the output.
//! Both products are plain per-unit dot products, so the GPU path has a
//! single accumulation order and ignores `config.mfma`. Only the
//! [`KvLayoutKind::Paged`] memory order is addressed.

use candle_core::Tensor;

use super::interop::has_cubecl_cuda_support;
use crate::error::{PagedAttnError, Result};
use crate::kernels::block_table::{KvLayoutKind, PagedKvLayout};
use crate::kernels::config::PagedAttentionConfig;

#[cfg(feature = "cuda")]
use cubecl::prelude::*;
#[cfg(feature = "cuda")]
use cubecl_cuda::CudaRuntime;

/// Paged QKV kernel, one cube per `(seq, partition, kv_head)`.
///
/// The caches keep their paged layouts with elements widened to f32; `x` is
/// the key packing factor of the original storage dtype.
#[cfg(feature = "cuda")]
#[cube(launch)]
#[allow(clippy::too_many_arguments)]
fn paged_qkv_kernel<F: Float>(
    query: &Array<F>,         // [num_seqs * num_heads * head_size]
    key_cache: &Array<F>,     // [num_blocks, kv_heads, head_size / x, block_size, x]
    value_cache: &Array<F>,   // [num_blocks, kv_heads, head_size, block_size]
    block_tables: &Array<u32>, // [num_seqs * max_blocks_per_seq]
    context_lens: &Array<u32>, // [num_seqs]
    alibi_slopes: &Array<F>,  // [num_heads], zeros without ALiBi
    out: &mut Array<F>,       // [num_seqs * num_heads * head_size]
    exp_sums: &mut Array<F>,  // [num_seqs * num_heads * max_num_partitions]
    max_logits: &mut Array<F>,
    tmp_out: &mut Array<F>, // [num_seqs * num_heads * max_num_partitions * head_size]
    scale: F,
    num_heads: u32,
    head_size: u32,
    block_size: u32,
    x: u32,
    gqa_ratio: u32,
    max_blocks_per_seq: u32,
    max_num_partitions: u32,
) {
    let seq = CUBE_POS_X;
    let partition = CUBE_POS_Y;
    let kv_head = CUBE_POS_Z;
    let tid = UNIT_POS_X;

    let context_len = context_lens[seq];
    let start = partition * 256;
    if start >= context_len {
        terminate!();
    }
    let num_partitions = (context_len + 255) / 256;
    let num_kv_heads = num_heads / gqa_ratio;
    let table_base = seq * max_blocks_per_seq;

    let token = start + tid;
    let valid = token < context_len;

    // Masked units read the last valid block so every load stays in bounds.
    let num_valid_blocks = (context_len + block_size - 1) / block_size;
    let mut logical_block = token / block_size;
    if logical_block >= num_valid_blocks {
        logical_block = num_valid_blocks - 1;
    }
    let block = block_tables[table_base + logical_block];
    let slot = token % block_size;
    let key_head_base = (block * num_kv_heads + kv_head) * (head_size / x);

    let mut tokens_here = context_len - start;
    if tokens_here > 256 {
        tokens_here = 256;
    }

    let mut scratch = SharedMemory::<F>::new(256);
    let mut weights = SharedMemory::<F>::new(256);

    for g in 0..gqa_ratio {
        let head = kv_head * gqa_ratio + g;
        let q_base = (seq * num_heads + head) * head_size;

        let mut score = F::new(-1e30);
        if valid {
            let mut dot = F::new(0.0);
            for d in 0..head_size {
                let k_offset = ((key_head_base + d / x) * block_size + slot) * x + d % x;
                dot = dot + query[q_base + d] * key_cache[k_offset];
            }
            let distance = F::cast_from(token + 1) - F::cast_from(context_len);
            score = dot * scale + alibi_slopes[head] * distance;
        }

        scratch[tid] = score;
        sync_cube();
        let mut stride: u32 = 128;
        while stride > 0 {
            if tid < stride {
                scratch[tid] = F::max(scratch[tid], scratch[tid + stride]);
            }
            sync_cube();
            stride = stride / 2;
        }
        let max_logit = scratch[0];
        sync_cube();

        let mut p = F::new(0.0);
        if valid {
            p = F::exp(score - max_logit);
        }
        weights[tid] = p;
        scratch[tid] = p;
        sync_cube();
        stride = 128;
        while stride > 0 {
            if tid < stride {
                scratch[tid] = scratch[tid] + scratch[tid + stride];
            }
            sync_cube();
            stride = stride / 2;
        }
        let exp_sum = scratch[0];

        if tid < head_size {
            let mut acc = F::new(0.0);
            for t in 0..tokens_here {
                let tok = start + t;
                let v_block = block_tables[table_base + tok / block_size];
                let v_offset =
                    ((v_block * num_kv_heads + kv_head) * head_size + tid) * block_size + tok % block_size;
                acc = acc + weights[t] * value_cache[v_offset];
            }

            if num_partitions == 1 {
                out[q_base + tid] = acc / exp_sum;
            } else {
                let stats = (seq * num_heads + head) * max_num_partitions + partition;
                tmp_out[stats * head_size + tid] = acc / exp_sum;
                if tid == 0 {
                    exp_sums[stats] = exp_sum;
                    max_logits[stats] = max_logit;
                }
            }
        }
        // Weights and scratch are reused by the next head.
        sync_cube();
    }
}

/// Partition reduction kernel, one cube per `(head, seq)`.
#[cfg(feature = "cuda")]
#[cube(launch)]
#[allow(clippy::too_many_arguments)]
fn paged_reduce_kernel<F: Float>(
    out: &mut Array<F>,
    exp_sums: &Array<F>,
    max_logits: &Array<F>,
    tmp_out: &Array<F>,
    context_lens: &Array<u32>,
    num_heads: u32,
    head_size: u32,
    max_num_partitions: u32,
) {
    let head = CUBE_POS_X;
    let seq = CUBE_POS_Y;
    let tid = UNIT_POS_X;

    let context_len = context_lens[seq];
    let num_partitions = (context_len + 255) / 256;
    if num_partitions <= 1 {
        terminate!();
    }
    let stats = (seq * num_heads + head) * max_num_partitions;

    let mut scratch = SharedMemory::<F>::new(256);

    let mut local_max = F::new(-1e30);
    let mut p = tid;
    while p < num_partitions {
        local_max = F::max(local_max, max_logits[stats + p]);
        p = p + 256;
    }
    scratch[tid] = local_max;
    sync_cube();
    let mut stride: u32 = 128;
    while stride > 0 {
        if tid < stride {
            scratch[tid] = F::max(scratch[tid], scratch[tid + stride]);
        }
        sync_cube();
        stride = stride / 2;
    }
    let global_max = scratch[0];
    sync_cube();

    let mut local_sum = F::new(0.0);
    p = tid;
    while p < num_partitions {
        local_sum = local_sum + exp_sums[stats + p] * F::exp(max_logits[stats + p] - global_max);
        p = p + 256;
    }
    scratch[tid] = local_sum;
    sync_cube();
    stride = 128;
    while stride > 0 {
        if tid < stride {
            scratch[tid] = scratch[tid] + scratch[tid + stride];
        }
        sync_cube();
        stride = stride / 2;
    }
    let global_sum = scratch[0];

    if tid < head_size {
        let mut acc = F::new(0.0);
        for q in 0..num_partitions {
            let weight = exp_sums[stats + q] * F::exp(max_logits[stats + q] - global_max) / global_sum;
            acc = acc + tmp_out[(stats + q) * head_size + tid] * weight;
        }
        out[(seq * num_heads + head) * head_size + tid] = acc;
    }
}

/// Inputs of a `CubeCL` paged-attention launch.
///
/// Block tables and context lengths must already have passed
/// [`validate_block_tables`](crate::kernels::block_table::validate_block_tables).
#[derive(Debug, Clone, Copy)]
pub struct CubePagedArgs<'a> {
    /// `[num_seqs, num_heads, head_size]` f16/bf16/f32.
    pub query: &'a Tensor,
    /// Paged key cache; `U8` is decoded as fp8.
    pub key_cache: &'a Tensor,
    /// Paged value cache; `U8` is decoded as fp8.
    pub value_cache: &'a Tensor,
    /// `[num_seqs * max_blocks_per_seq]`.
    pub block_tables: &'a [i32],
    /// `[num_seqs]`.
    pub context_lens: &'a [i32],
    /// Blocks per block-table row.
    pub max_blocks_per_seq: usize,
    /// Cache geometry of the original storage dtype.
    pub layout: PagedKvLayout,
    /// Attention configuration.
    pub config: &'a PagedAttentionConfig,
}

/// Run paged attention with the `CubeCL` CUDA kernels.
///
/// Returns the f32 output `[num_seqs, num_heads, head_size]` on the query's
/// device, already multiplied by `v_scale` for quantized caches. Output-dtype
/// conversion is left to the caller.
///
/// # Errors
///
/// Returns [`PagedAttnError::UnsupportedConfig`] when `CubeCL` CUDA support is
/// unavailable or the caches are not in the paged memory order, and
/// conversion errors from the interop layer.
pub fn paged_attention_cubecl(args: &CubePagedArgs<'_>) -> Result<Tensor> {
    if !has_cubecl_cuda_support() {
        return Err(PagedAttnError::UnsupportedConfig(
            "CubeCL CUDA runtime is not available".to_string(),
        ));
    }
    if args.layout.kind != KvLayoutKind::Paged {
        return Err(PagedAttnError::UnsupportedConfig(format!(
            "CubeCL kernels read the paged layout only, got {:?}",
            args.layout.kind
        )));
    }

    #[cfg(feature = "cuda")]
    {
        launch_cubecl_paged_attention(args)
    }

    #[cfg(not(feature = "cuda"))]
    {
        let _ = args;
        Err(PagedAttnError::UnsupportedConfig(
            "built without the cuda feature".to_string(),
        ))
    }
}

#[cfg(feature = "cuda")]
#[allow(clippy::cast_possible_truncation)]
fn launch_cubecl_paged_attention(args: &CubePagedArgs<'_>) -> Result<Tensor> {
    use candle_core::DeviceLocation;

    use super::config::CubeLaunchConfig;
    use super::interop::{
        candle_to_cubecl_handle, cubecl_bytes_to_f32, cubecl_to_candle_tensor, f32_to_cubecl_bytes,
        indices_to_cubecl_bytes,
    };

    let (num_seqs, num_heads, head_size) = args.query.dims3()?;
    let config = args.config;
    let gqa_ratio = num_heads / config.num_kv_heads;
    let max_num_partitions = config.max_num_partitions();
    let quantized = config.kv_cache_dtype.is_quantized();

    tracing::debug!(
        "Launching CubeCL paged attention: seqs={}, heads={}, kv_heads={}, head_size={}, partitions={}",
        num_seqs,
        num_heads,
        config.num_kv_heads,
        head_size,
        max_num_partitions
    );

    // PERF: inputs round-trip through host memory for dtype widening.
    let (q_bytes, _) = candle_to_cubecl_handle(args.query)?;
    let (k_bytes, _) = candle_to_cubecl_handle(args.key_cache)?;
    let (v_bytes, _) = candle_to_cubecl_handle(args.value_cache)?;
    let slopes = config
        .alibi_slopes
        .clone()
        .unwrap_or_else(|| vec![0.0; num_heads]);

    let scale = if quantized {
        config.scale * config.k_scale
    } else {
        config.scale
    };

    let out_elems = num_seqs * num_heads * head_size;
    let stats_elems = num_seqs * num_heads * max_num_partitions;
    let cache_elems = args.layout.cache_elems();
    let f32_bytes = std::mem::size_of::<f32>();

    let ordinal = match args.query.device().location() {
        DeviceLocation::Cuda { gpu_id } => gpu_id,
        other => {
            return Err(PagedAttnError::Kernel(format!(
                "query must live on a CUDA device, found {other:?}"
            )))
        }
    };
    let device = cubecl_cuda::CudaDevice::new(ordinal);
    let client = CudaRuntime::client(&device);

    let q_handle = client.create(&q_bytes);
    let k_handle = client.create(&k_bytes);
    let v_handle = client.create(&v_bytes);
    let table_handle = client.create(&indices_to_cubecl_bytes(args.block_tables));
    let ctx_handle = client.create(&indices_to_cubecl_bytes(args.context_lens));
    let slope_handle = client.create(&f32_to_cubecl_bytes(&slopes));
    let out_handle = client.empty(out_elems * f32_bytes);
    let exp_handle = client.empty(stats_elems.max(1) * f32_bytes);
    let max_handle = client.empty(stats_elems.max(1) * f32_bytes);
    let tmp_handle = client.empty((stats_elems * head_size).max(1) * f32_bytes);

    let launch = CubeLaunchConfig::default();
    let (qx, qy, qz) = launch.qkv_cube_count(
        num_seqs as u32,
        max_num_partitions as u32,
        config.num_kv_heads as u32,
    );
    let (rx, ry, rz) = launch.reduce_cube_count(num_heads as u32, num_seqs as u32);
    let cube_dim = CubeDim::new(launch.units_per_cube, 1, 1);

    // SAFETY: every handle was created with exactly the element count passed.
    unsafe {
        paged_qkv_kernel::launch::<f32, CudaRuntime>(
            &client,
            CubeCount::Static(qx, qy, qz),
            cube_dim,
            ArrayArg::from_raw_parts::<f32>(&q_handle, out_elems, 1),
            ArrayArg::from_raw_parts::<f32>(&k_handle, cache_elems, 1),
            ArrayArg::from_raw_parts::<f32>(&v_handle, cache_elems, 1),
            ArrayArg::from_raw_parts::<u32>(&table_handle, args.block_tables.len(), 1),
            ArrayArg::from_raw_parts::<u32>(&ctx_handle, num_seqs, 1),
            ArrayArg::from_raw_parts::<f32>(&slope_handle, slopes.len(), 1),
            ArrayArg::from_raw_parts::<f32>(&out_handle, out_elems, 1),
            ArrayArg::from_raw_parts::<f32>(&exp_handle, stats_elems.max(1), 1),
            ArrayArg::from_raw_parts::<f32>(&max_handle, stats_elems.max(1), 1),
            ArrayArg::from_raw_parts::<f32>(&tmp_handle, (stats_elems * head_size).max(1), 1),
            ScalarArg::new(scale),
            ScalarArg::new(num_heads as u32),
            ScalarArg::new(head_size as u32),
            ScalarArg::new(config.block_size as u32),
            ScalarArg::new(args.layout.x as u32),
            ScalarArg::new(gqa_ratio as u32),
            ScalarArg::new(args.max_blocks_per_seq as u32),
            ScalarArg::new(max_num_partitions as u32),
        );

        paged_reduce_kernel::launch::<f32, CudaRuntime>(
            &client,
            CubeCount::Static(rx, ry, rz),
            cube_dim,
            ArrayArg::from_raw_parts::<f32>(&out_handle, out_elems, 1),
            ArrayArg::from_raw_parts::<f32>(&exp_handle, stats_elems.max(1), 1),
            ArrayArg::from_raw_parts::<f32>(&max_handle, stats_elems.max(1), 1),
            ArrayArg::from_raw_parts::<f32>(&tmp_handle, (stats_elems * head_size).max(1), 1),
            ArrayArg::from_raw_parts::<u32>(&ctx_handle, num_seqs, 1),
            ScalarArg::new(num_heads as u32),
            ScalarArg::new(head_size as u32),
            ScalarArg::new(max_num_partitions as u32),
        );
    }

    let output_bytes = client.read_one(out_handle);
    let shape = [num_seqs, num_heads, head_size];
    if quantized {
        let scaled: Vec<f32> = cubecl_bytes_to_f32(&output_bytes)?
            .into_iter()
            .map(|v| v * config.v_scale)
            .collect();
        return cubecl_to_candle_tensor(&f32_to_cubecl_bytes(&scaled), &shape, args.query.device());
    }

    cubecl_to_candle_tensor(&output_bytes, &shape, args.query.device())
}
