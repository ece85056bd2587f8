// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Paged attention benchmarks.
//!
//! Covers a decode step at several context lengths, with a 16-bit and an fp8
//! cache, plus the cache maintenance operations:
//! - `paged_attention` (QKV stage + reduction)
//! - `reshape_and_cache`
//! - `copy_blocks`
//!
//! Workspace sizes for each configuration are printed alongside.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use half::f16;
use paged_attn_rs::kernels::{paged_attention, PagedAttentionConfig, PagedKvCache};
use paged_attn_rs::memory::{format_bytes, WorkspaceLayout};

use candle_core::{DType, Device, Tensor};

const CONTEXT_LENS: &[usize] = &[128, 512, 2048];
const NUM_SEQS: usize = 4;
const NUM_HEADS: usize = 8;
const NUM_KV_HEADS: usize = 2;
const HEAD_SIZE: usize = 128;
const BLOCK_SIZE: usize = 16;

struct DecodeInputs {
    query: Tensor,
    cache: PagedKvCache<f16>,
    block_tables: Tensor,
    context_lens: Tensor,
    config: PagedAttentionConfig,
}

/// Every sequence filled to `context_len` with a ramp of values.
fn decode_inputs(context_len: usize, device: &Device) -> candle_core::Result<Option<DecodeInputs>> {
    let blocks_per_seq = context_len.div_ceil(BLOCK_SIZE);
    let Ok(mut cache) = PagedKvCache::<f16>::new(NUM_SEQS * blocks_per_seq, NUM_KV_HEADS, HEAD_SIZE, BLOCK_SIZE) else {
        return Ok(None);
    };
    let tokens = NUM_SEQS * context_len;
    let token_elems = NUM_KV_HEADS * HEAD_SIZE;
    let ramp: Vec<f16> = (0..tokens * token_elems)
        .map(|i| f16::from_f32(((i % 97) as f32 - 48.0) / 64.0))
        .collect();
    let slots: Vec<i64> = (0..tokens as i64).collect();
    if cache.reshape_and_cache(&ramp, &ramp, &slots, 1.0, 1.0).is_err() {
        return Ok(None);
    }

    let tables: Vec<u32> = (0..(NUM_SEQS * blocks_per_seq) as u32).collect();
    Ok(Some(DecodeInputs {
        query: Tensor::randn(0.0f32, 1.0, (NUM_SEQS, NUM_HEADS, HEAD_SIZE), device)?.to_dtype(DType::F16)?,
        cache,
        block_tables: Tensor::from_vec(tables, (NUM_SEQS, blocks_per_seq), device)?,
        context_lens: Tensor::from_vec(vec![context_len as u32; NUM_SEQS], NUM_SEQS, device)?,
        config: PagedAttentionConfig::new(NUM_KV_HEADS, HEAD_SIZE)
            .with_block_size(BLOCK_SIZE)
            .with_max_context_len(context_len),
    }))
}

/// Benchmark one decode step with a 16-bit cache.
fn benchmark_paged_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("paged_decode");
    let device = Device::Cpu;

    for &context_len in CONTEXT_LENS {
        let Ok(Some(inputs)) = decode_inputs(context_len, &device) else {
            continue;
        };
        let Ok((key_cache, value_cache)) = inputs.cache.to_tensors(&device) else {
            continue;
        };

        group.bench_with_input(BenchmarkId::new("f16", context_len), &inputs, |b, i| {
            b.iter(|| {
                paged_attention(
                    &i.query,
                    &key_cache,
                    &value_cache,
                    &i.block_tables,
                    &i.context_lens,
                    &i.config,
                )
                .unwrap()
            });
        });

        let workspace = WorkspaceLayout::new(NUM_SEQS, NUM_HEADS, HEAD_SIZE, context_len, 2);
        println!(
            "paged decode workspace (seqs={NUM_SEQS}, ctx={context_len}): {} over {} partitions",
            format_bytes(workspace.total_bytes()),
            workspace.max_num_partitions
        );
    }

    group.finish();
}

/// Benchmark one decode step with an fp8 cache.
fn benchmark_fp8_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("paged_decode_fp8");
    let device = Device::Cpu;

    for &context_len in CONTEXT_LENS {
        let Ok(Some(inputs)) = decode_inputs(context_len, &device) else {
            continue;
        };
        let Ok(fp8) = inputs.cache.to_fp8(0.5, 0.5) else {
            continue;
        };
        let Ok((key_cache, value_cache)) = fp8.to_tensors(&device) else {
            continue;
        };
        let config = inputs.config.clone().for_fp8_cache(0.5, 0.5);

        group.bench_with_input(BenchmarkId::new("fp8_e4m3", context_len), &inputs, |b, i| {
            b.iter(|| {
                paged_attention(
                    &i.query,
                    &key_cache,
                    &value_cache,
                    &i.block_tables,
                    &i.context_lens,
                    &config,
                )
                .unwrap()
            });
        });
    }

    group.finish();
}

/// Benchmark the cache maintenance operations.
fn benchmark_cache_ops(c: &mut Criterion) {
    let mut group = c.benchmark_group("kv_cache");
    let num_blocks = 256;

    let Ok(mut cache) = PagedKvCache::<f16>::new(num_blocks, NUM_KV_HEADS, HEAD_SIZE, BLOCK_SIZE) else {
        return;
    };
    let token_elems = NUM_KV_HEADS * HEAD_SIZE;

    for &tokens in &[1usize, 64, 512] {
        let data = vec![f16::from_f32(0.25); tokens * token_elems];
        let slots: Vec<i64> = (0..tokens as i64).map(|t| t * 7 % (num_blocks * BLOCK_SIZE) as i64).collect();
        group.bench_with_input(BenchmarkId::new("reshape_and_cache", tokens), &tokens, |b, _| {
            b.iter(|| cache.reshape_and_cache(&data, &data, &slots, 1.0, 1.0).unwrap());
        });
    }

    let mapping: Vec<(usize, usize)> = (0..num_blocks / 2).map(|b| (b, b + num_blocks / 2)).collect();
    group.bench_function("copy_blocks", |b| {
        b.iter(|| cache.copy_blocks(&mapping).unwrap());
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_paged_decode,
    benchmark_fp8_decode,
    benchmark_cache_ops
);
criterion_main!(benches);
