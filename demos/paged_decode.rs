// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Paged decode example: two sequences sharing one block pool.
//!
//! This example shows how to:
//! - Allocate a paged KV cache and write prompt tokens with `reshape_and_cache`
//! - Build block tables that scatter each sequence over the pool
//! - Run one decode step with `paged_attention`
//! - Fork a sequence with `copy_blocks`
//!
//! Run with: `RUST_LOG=paged_attn_rs=debug cargo run --example paged_decode`

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use half::f16;
use paged_attn_rs::kernels::{paged_attention, PagedAttentionConfig, PagedKvCache};
use paged_attn_rs::memory::{format_bytes, PagedAttentionWorkspace};
use tracing_subscriber::EnvFilter;

const NUM_HEADS: usize = 8;
const NUM_KV_HEADS: usize = 2;
const HEAD_SIZE: usize = 64;
const BLOCK_SIZE: usize = 16;
const NUM_BLOCKS: usize = 64;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Paged Decode Example ===\n");
    let device = Device::Cpu;

    let mut cache = PagedKvCache::<f16>::new(NUM_BLOCKS, NUM_KV_HEADS, HEAD_SIZE, BLOCK_SIZE)?;
    println!("Cache layout:");
    println!("  Key shape:   {:?}", cache.layout().key_shape());
    println!("  Value shape: {:?}", cache.layout().value_shape());
    println!();

    // Sequence 0 has a 300-token prompt, sequence 1 a 40-token prompt. Blocks
    // are handed out from the top of the pool down.
    let context_lens = [300usize, 40];
    let mut next_free = NUM_BLOCKS;
    let mut rows = Vec::new();
    for (seq, &len) in context_lens.iter().enumerate() {
        let blocks: Vec<u32> = (0..len.div_ceil(BLOCK_SIZE))
            .map(|_| {
                next_free -= 1;
                next_free as u32
            })
            .collect();
        let slots: Vec<i64> = (0..len)
            .map(|t| i64::from(blocks[t / BLOCK_SIZE]) * BLOCK_SIZE as i64 + (t % BLOCK_SIZE) as i64)
            .collect();
        let token_elems = NUM_KV_HEADS * HEAD_SIZE;
        let values: Vec<f16> = (0..len * token_elems)
            .map(|i| f16::from_f32((((i + seq * 31) % 53) as f32 - 26.0) / 32.0))
            .collect();
        cache.reshape_and_cache(&values, &values, &slots, 1.0, 1.0)?;
        println!("Sequence {seq}: {len} tokens in blocks {blocks:?}");
        rows.push(blocks);
    }
    println!();

    let max_blocks = rows.iter().map(Vec::len).max().unwrap_or(0);
    let flat: Vec<u32> = rows
        .iter()
        .flat_map(|row| row.iter().copied().chain(std::iter::repeat(0)).take(max_blocks))
        .collect();
    let block_tables = Tensor::from_vec(flat, (context_lens.len(), max_blocks), &device)?;
    let lens: Vec<u32> = context_lens.iter().map(|&l| l as u32).collect();
    let context_lens_t = Tensor::new(lens, &device)?;

    let config = PagedAttentionConfig::new(NUM_KV_HEADS, HEAD_SIZE)
        .with_block_size(BLOCK_SIZE)
        .with_max_context_len(512);
    let workspace =
        PagedAttentionWorkspace::for_launch(context_lens.len(), NUM_HEADS, HEAD_SIZE, 512, DType::F16)?;
    println!(
        "MFMA shape for GQA {}: {:?}",
        NUM_HEADS / NUM_KV_HEADS,
        config.mfma.resolve(NUM_HEADS / NUM_KV_HEADS)
    );
    println!(
        "Workspace: {} ({} partitions per head)",
        format_bytes(workspace.bytes()),
        config.max_num_partitions()
    );

    let query = Tensor::randn(0.0f32, 1.0, (context_lens.len(), NUM_HEADS, HEAD_SIZE), &device)?
        .to_dtype(DType::F16)?;
    let (key_cache, value_cache) = cache.to_tensors(&device)?;
    let out = paged_attention(&query, &key_cache, &value_cache, &block_tables, &context_lens_t, &config)?;
    println!("Output shape: {:?}", out.dims());

    let norms = out.to_dtype(DType::F32)?.sqr()?.sum(2)?.sqrt()?.to_vec2::<f32>()?;
    for (seq, heads) in norms.iter().enumerate() {
        println!("  Sequence {seq} head norms: {heads:.3?}");
    }
    println!();

    // Fork sequence 1 into fresh blocks and check both copies agree.
    let fork: Vec<(usize, usize)> = rows[1]
        .iter()
        .enumerate()
        .map(|(i, &src)| (src as usize, i))
        .collect();
    cache.copy_blocks(&fork)?;
    let forked_row: Vec<u32> = (0..rows[1].len() as u32).collect();
    let (key_cache, value_cache) = cache.to_tensors(&device)?;
    let pair = Tensor::from_vec(
        rows[1].iter().copied().chain(forked_row).collect::<Vec<_>>(),
        (2, rows[1].len()),
        &device,
    )?;
    let q1 = query.narrow(0, 1, 1)?;
    let query_pair = Tensor::cat(&[&q1, &q1], 0)?;
    let out = paged_attention(
        &query_pair,
        &key_cache,
        &value_cache,
        &pair,
        &Tensor::new(&[40u32, 40], &device)?,
        &config,
    )?;
    let diff = (out.get(0)? - out.get(1)?)?
        .to_dtype(DType::F32)?
        .abs()?
        .max_all()?
        .to_scalar::<f32>()?;
    println!("Fork max difference: {diff}");

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
