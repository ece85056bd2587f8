// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Test utilities and fixtures for paged attention integration tests.
//!
//! This module provides deterministic batch generation, a full-precision
//! reference attention and accuracy metrics.

#![allow(dead_code)]

use anyhow::Result;
use candle_core::{Device, Tensor};
use paged_attn_rs::kernels::{CacheScalar, CacheStorage, ComputeScalar, PagedAttentionConfig, PagedKvCache};

/// Shape of a generated decode batch.
#[derive(Debug, Clone)]
pub struct PagedScenario {
    /// Query heads per sequence.
    pub num_heads: usize,
    /// KV heads in the cache.
    pub num_kv_heads: usize,
    /// Elements per head.
    pub head_size: usize,
    /// Tokens per cache block.
    pub block_size: usize,
    /// Context length of each sequence.
    pub context_lens: Vec<usize>,
    /// Extra unused blocks in the cache.
    pub spare_blocks: usize,
    /// Random seed for reproducible tests.
    pub seed: u64,
}

impl PagedScenario {
    /// Scenario with one spare block and seed 42.
    pub fn new(
        num_heads: usize,
        num_kv_heads: usize,
        head_size: usize,
        block_size: usize,
        context_lens: &[usize],
    ) -> Self {
        Self {
            num_heads,
            num_kv_heads,
            head_size,
            block_size,
            context_lens: context_lens.to_vec(),
            spare_blocks: 1,
            seed: 42,
        }
    }

    /// Use a different seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Cache blocks needed by each sequence.
    pub fn blocks_per_seq(&self) -> Vec<usize> {
        self.context_lens
            .iter()
            .map(|&c| c.div_ceil(self.block_size))
            .collect()
    }

    /// Generate the batch: random query, random K/V written into a
    /// full-precision cache through scrambled block tables.
    pub fn build<T>(&self) -> Result<PagedBatch<T>>
    where
        T: ComputeScalar,
        T: CacheScalar<T> + CacheStorage,
    {
        let num_seqs = self.context_lens.len();
        let blocks = self.blocks_per_seq();
        let total_blocks: usize = blocks.iter().sum::<usize>() + self.spare_blocks;
        let max_blocks = blocks.iter().copied().max().unwrap_or(0).max(1);

        // Hand out physical blocks in a scrambled order so that logical and
        // physical ids never coincide by accident.
        let mut free: Vec<usize> = (0..total_blocks).collect();
        free.sort_by_key(|&b| (b * 7919 + self.seed as usize) % total_blocks);

        let mut cache = PagedKvCache::<T>::new(total_blocks, self.num_kv_heads, self.head_size, self.block_size)?;
        let mut block_tables = Vec::with_capacity(num_seqs);
        let token_elems = self.num_kv_heads * self.head_size;
        for (seq, &ctx) in self.context_lens.iter().enumerate() {
            let row: Vec<u32> = free.drain(..blocks[seq]).map(|b| b as u32).collect();
            let slots: Vec<i64> = (0..ctx)
                .map(|t| i64::from(row[t / self.block_size]) * self.block_size as i64 + (t % self.block_size) as i64)
                .collect();
            let seed = self.seed + 1000 * (seq as u64 + 1);
            let key = to_compute::<T>(&uniform_values(ctx * token_elems, 1.0, seed));
            let value = to_compute::<T>(&uniform_values(ctx * token_elems, 1.0, seed + 500));
            cache.reshape_and_cache(&key, &value, &slots, 1.0, 1.0)?;

            let mut padded = row;
            padded.resize(max_blocks, 0);
            block_tables.push(padded);
        }

        let query = uniform_values(num_seqs * self.num_heads * self.head_size, 1.0, self.seed + 7)
            .into_iter()
            .map(|v| T::from_f32(v).to_f32())
            .collect();

        Ok(PagedBatch {
            scenario: self.clone(),
            query,
            cache,
            block_tables,
        })
    }
}

/// Generated inputs of one decode step.
#[derive(Debug, Clone)]
pub struct PagedBatch<T: ComputeScalar> {
    /// Source scenario.
    pub scenario: PagedScenario,
    /// `[num_seqs, num_heads, head_size]`, exactly representable in `T`.
    pub query: Vec<f32>,
    /// Full-precision cache holding every context token.
    pub cache: PagedKvCache<T>,
    /// Block-table rows, padded with block 0.
    pub block_tables: Vec<Vec<u32>>,
}

/// Tensors passed to `paged_attention`.
pub struct BatchTensors {
    /// Query in the compute dtype.
    pub query: Tensor,
    /// `[num_seqs, max_blocks_per_seq]` u32.
    pub block_tables: Tensor,
    /// `[num_seqs]` u32.
    pub context_lens: Tensor,
}

impl<T> PagedBatch<T>
where
    T: ComputeScalar + CacheScalar<T> + CacheStorage,
{
    /// Query, block tables and context lengths as tensors.
    pub fn tensors(&self, device: &Device) -> Result<BatchTensors> {
        let s = &self.scenario;
        let num_seqs = s.context_lens.len();
        let query = Tensor::from_vec(self.query.clone(), (num_seqs, s.num_heads, s.head_size), device)?
            .to_dtype(<T as ComputeScalar>::DTYPE)?;
        let max_blocks = self.block_tables.first().map_or(0, Vec::len);
        let flat: Vec<u32> = self.block_tables.iter().flatten().copied().collect();
        let block_tables = Tensor::from_vec(flat, (num_seqs, max_blocks), device)?;
        let lens: Vec<u32> = s.context_lens.iter().map(|&c| c as u32).collect();
        let context_lens = Tensor::new(lens, device)?;
        Ok(BatchTensors {
            query,
            block_tables,
            context_lens,
        })
    }

    /// Config sized for this batch.
    pub fn config(&self) -> PagedAttentionConfig {
        let s = &self.scenario;
        let max_ctx = s.context_lens.iter().copied().max().unwrap_or(1).max(1);
        PagedAttentionConfig::new(s.num_kv_heads, s.head_size)
            .with_block_size(s.block_size)
            .with_max_context_len(max_ctx)
    }

    /// Physical slot of token `t` of sequence `seq`.
    pub fn slot(&self, seq: usize, t: usize) -> (usize, usize) {
        let bs = self.scenario.block_size;
        (self.block_tables[seq][t / bs] as usize, t % bs)
    }

    /// Full-precision attention over `cache`, `[num_seqs, num_heads, head_size]`.
    pub fn reference(&self, cache: &PagedKvCache<T>, scale: f32, alibi: Option<&[f32]>) -> Vec<f32> {
        let s = &self.scenario;
        let gqa = s.num_heads / s.num_kv_heads;
        let hs = s.head_size;
        let mut out = Vec::with_capacity(self.query.len());
        for (seq, &ctx) in s.context_lens.iter().enumerate() {
            for head in 0..s.num_heads {
                if ctx == 0 {
                    // Nothing to attend to; the output stays zero.
                    out.extend(std::iter::repeat(0.0).take(hs));
                    continue;
                }
                let kv_head = head / gqa;
                let q = &self.query[(seq * s.num_heads + head) * hs..][..hs];
                let logits: Vec<f64> = (0..ctx)
                    .map(|t| {
                        let (block, slot) = self.slot(seq, t);
                        let dot: f64 = (0..hs)
                            .map(|d| f64::from(q[d]) * f64::from(cache.key(block, kv_head, slot, d).to_f32()))
                            .sum();
                        let bias = alibi.map_or(0.0, |a| f64::from(a[head]) * (t as f64 + 1.0 - ctx as f64));
                        dot * f64::from(scale) + bias
                    })
                    .collect();
                let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let weights: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
                let sum: f64 = weights.iter().sum();
                for d in 0..hs {
                    let acc: f64 = (0..ctx)
                        .map(|t| {
                            let (block, slot) = self.slot(seq, t);
                            weights[t] * f64::from(cache.value(block, kv_head, slot, d).to_f32())
                        })
                        .sum();
                    out.push((acc / sum) as f32);
                }
            }
        }
        out
    }
}

/// Deterministic uniform values in `[-max, max]`.
pub fn uniform_values(count: usize, max: f32, seed: u64) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    (0..count)
        .map(|i| {
            let mut hasher = DefaultHasher::new();
            (seed, i as u64).hash(&mut hasher);
            let normalized = (hasher.finish() as f64) / (u64::MAX as f64);
            ((normalized * 2.0 - 1.0) * f64::from(max)) as f32
        })
        .collect()
}

fn to_compute<T: ComputeScalar>(values: &[f32]) -> Vec<T> {
    values.iter().map(|&v| T::from_f32(v)).collect()
}

/// Accuracy metrics for numerical validation.
#[derive(Debug, Clone)]
pub struct AccuracyMetrics {
    /// `||got - expected|| / ||expected||`.
    pub l2_relative: f32,
    /// Maximum absolute error.
    pub max_error: f32,
    /// Cosine similarity between the two.
    pub cosine_similarity: f32,
}

impl AccuracyMetrics {
    /// Compare `got` against `expected`.
    pub fn compare(got: &[f32], expected: &[f32]) -> Self {
        assert_eq!(got.len(), expected.len(), "lengths must match");
        let (mut err_sq, mut ref_sq, mut got_sq, mut dot, mut max_error) = (0.0f64, 0.0f64, 0.0f64, 0.0f64, 0.0f32);
        for (&g, &e) in got.iter().zip(expected) {
            let diff = f64::from(g) - f64::from(e);
            err_sq += diff * diff;
            ref_sq += f64::from(e) * f64::from(e);
            got_sq += f64::from(g) * f64::from(g);
            dot += f64::from(g) * f64::from(e);
            max_error = max_error.max((g - e).abs());
        }
        Self {
            l2_relative: (err_sq.sqrt() / ref_sq.sqrt().max(f64::MIN_POSITIVE)) as f32,
            max_error,
            cosine_similarity: (dot / (got_sq.sqrt() * ref_sq.sqrt()).max(f64::MIN_POSITIVE)) as f32,
        }
    }
}

/// Flatten any float tensor to f32 values.
pub fn to_f32_vec(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor
        .flatten_all()?
        .to_dtype(candle_core::DType::F32)?
        .to_vec1::<f32>()?)
}
