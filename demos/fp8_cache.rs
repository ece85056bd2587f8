// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! fp8 KV cache example.
//!
//! This example shows how to:
//! - Quantize a 16-bit cache to fp8 e4m3 with per-tensor scales
//! - Run paged attention on the fp8 cache and compare with the 16-bit cache
//! - Store the output itself as fp8 with an output scale
//! - Convert standalone tensors with `convert_fp8`
//! - Quantize with one scale per token and KV head
//!
//! Run with: `RUST_LOG=paged_attn_rs=trace cargo run --example fp8_cache`

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use half::bf16;
use paged_attn_rs::kernels::{
    convert_fp8, paged_attention, Fp8Conversion, Fp8E4M3, PagedAttentionConfig, PagedKvCache, TokenScales,
};
use tracing_subscriber::EnvFilter;

const NUM_HEADS: usize = 4;
const HEAD_SIZE: usize = 128;
const BLOCK_SIZE: usize = 32;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== fp8 KV Cache Example ===\n");
    let device = Device::Cpu;
    let context_len: usize = 700;
    let num_blocks = context_len.div_ceil(BLOCK_SIZE);

    let mut cache = PagedKvCache::<bf16>::new(num_blocks, NUM_HEADS, HEAD_SIZE, BLOCK_SIZE)?;
    let values: Vec<bf16> = (0..context_len * NUM_HEADS * HEAD_SIZE)
        .map(|i| bf16::from_f32(((i * 37 % 101) as f32 - 50.0) / 20.0))
        .collect();
    let slots: Vec<i64> = (0..context_len as i64).collect();
    cache.reshape_and_cache(&values, &values, &slots, 1.0, 1.0)?;

    // Keys and values span [-2.5, 2.5]; scale them into the e4m3 range.
    let (k_scale, v_scale) = (2.5 / 448.0, 2.5 / 448.0);
    let fp8 = cache.to_fp8(k_scale, v_scale)?;
    let (key16, value16) = cache.to_tensors(&device)?;
    let (key8, value8) = fp8.to_tensors(&device)?;
    println!(
        "Cache bytes: {} (bf16) -> {} (fp8)",
        key16.elem_count() * 2 * 2,
        key8.elem_count() * 2
    );

    let query = Tensor::randn(0.0f32, 1.0, (1, NUM_HEADS, HEAD_SIZE), &device)?.to_dtype(DType::BF16)?;
    let block_tables = Tensor::from_vec((0..num_blocks as u32).collect::<Vec<_>>(), (1, num_blocks), &device)?;
    let context_lens = Tensor::new(&[context_len as u32], &device)?;
    let config = PagedAttentionConfig::new(NUM_HEADS, HEAD_SIZE)
        .with_block_size(BLOCK_SIZE)
        .with_max_context_len(context_len);

    let full = paged_attention(&query, &key16, &value16, &block_tables, &context_lens, &config)?;
    let fp8_config = config.clone().for_fp8_cache(k_scale, v_scale);
    let quantized = paged_attention(&query, &key8, &value8, &block_tables, &context_lens, &fp8_config)?;
    let err = (full.to_dtype(DType::F32)? - quantized.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_scalar::<f32>()?;
    println!("Max |bf16 cache - fp8 cache| output difference: {err:.5}");

    // fp8 output: raw e4m3 bytes, decoded with the same scale.
    let out_scale = 1.0 / 128.0;
    let packed = paged_attention(
        &query,
        &key8,
        &value8,
        &block_tables,
        &context_lens,
        &fp8_config.with_output_scale(out_scale),
    )?;
    let decoded = convert_fp8(&packed, out_scale, Fp8Conversion::Dequantize(DType::BF16))?.to_dtype(DType::F32)?;
    println!(
        "fp8 output: dtype {:?}, first values {:?}",
        packed.dtype(),
        &decoded.flatten_all()?.to_vec1::<f32>()?[..4]
    );

    let round_trip = convert_fp8(
        &convert_fp8(&key16, k_scale, Fp8Conversion::Quantize)?,
        k_scale,
        Fp8Conversion::Dequantize(DType::BF16),
    )?;
    println!("Key cache round trip shape: {:?}", round_trip.dims());

    // Per-token scales: every (kv_head, slot) row gets max|row| / 448.
    let mut per_token = PagedKvCache::<bf16, Fp8E4M3>::new(num_blocks, NUM_HEADS, HEAD_SIZE, BLOCK_SIZE)?;
    let mut scales = TokenScales::new(&per_token.layout());
    per_token.reshape_and_cache_with_pertoken_quant(&values, &values, &slots, &mut scales)?;
    let (key_pt, value_pt) = per_token.dequantize_with_token_scales(&scales)?.to_tensors(&device)?;
    let per_token_out = paged_attention(&query, &key_pt, &value_pt, &block_tables, &context_lens, &config)?;
    let err = (full.to_dtype(DType::F32)? - per_token_out.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_scalar::<f32>()?;
    println!(
        "Per-token scales: head 0 slot 0 key scale {:.5}, max output difference {err:.5}",
        scales.key(0, 0)
    );

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
