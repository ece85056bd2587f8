// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Partition reduction kernel.
//!
//! One workgroup per `(head, sequence)` merges the per-partition results of
//! the QKV kernel:
//!
//! ```text
//! global_max = max_p m_p
//! weight_p   = exp_sum_p · exp(m_p - global_max)
//! out        = Σ_p tmp_out_p · weight_p / Σ_p weight_p
//! ```
//!
//! `tmp_out_p` is already normalized by its own partition's `exp_sum`, so
//! every term stays within the range of the values.
//!
//! Sequences with a single partition were finalized by the QKV kernel, so the
//! workgroup returns without touching the output. Callers launch the full
//! grid regardless of context lengths.

use super::config::PARTITION_SIZE;
use super::convert::{ComputeScalar, OutputScalar};
use super::workgroup::{warp_max, warp_sum, SharedMemory, Workgroup, NUM_THREADS, NUM_WARPS, WARP_SIZE};

/// Intermediates written by the QKV stage.
#[derive(Debug, Clone, Copy)]
pub struct ReduceArgs<'a, T> {
    /// `[num_seqs, num_heads, max_num_partitions]`.
    pub exp_sums: &'a [f32],
    /// `[num_seqs, num_heads, max_num_partitions]`.
    pub max_logits: &'a [f32],
    /// `[num_seqs, num_heads, max_num_partitions, head_size]`, each partition
    /// normalized by its own `exp_sum`.
    pub tmp_out: &'a [T],
    /// `[num_seqs]`.
    pub context_lens: &'a [i32],
    /// Query heads per sequence.
    pub num_heads: usize,
    /// Partition stride of the intermediates.
    pub max_num_partitions: usize,
    /// Output scale, used only for quantized outputs.
    pub out_scale: f32,
}

/// Merge the partitions of `(seq, head)`.
///
/// Returns `None` when the sequence has at most one partition; its output is
/// already final and must not be rewritten.
#[must_use]
pub fn paged_attention_reduce<T, O, const HEAD_SIZE: usize>(
    args: &ReduceArgs<'_, T>,
    head: usize,
    seq: usize,
) -> Option<Vec<O>>
where
    T: ComputeScalar,
    O: OutputScalar,
{
    let context_len = usize::try_from(args.context_lens[seq]).unwrap_or(0);
    let num_partitions = context_len.div_ceil(PARTITION_SIZE);
    if num_partitions <= 1 {
        return None;
    }

    let stats = (seq * args.num_heads + head) * args.max_num_partitions;
    let max_logits = &args.max_logits[stats..stats + num_partitions];
    let exp_sums = &args.exp_sums[stats..stats + num_partitions];
    let tmp_out = &args.tmp_out[stats * HEAD_SIZE..(stats + num_partitions) * HEAD_SIZE];
    let last = num_partitions - 1;

    let mut wg = Workgroup::new();

    // Thread-local max over slots t, t + 256, ... Slots past the last
    // partition re-read it, which cannot move the max.
    let slots = num_partitions.div_ceil(NUM_THREADS);
    let mut local = vec![f32::NEG_INFINITY; NUM_THREADS];
    wg.for_each_thread(|t| {
        local[t.id()] = (0..slots)
            .map(|s| max_logits[(t.id() + s * NUM_THREADS).min(last)])
            .fold(f32::NEG_INFINITY, f32::max);
    });
    let mut red_max = SharedMemory::<f32>::new(NUM_WARPS);
    wg.for_each_warp(|w| {
        let lanes = std::array::from_fn(|lane| local[w.index * WARP_SIZE + lane]);
        red_max.store(&w.leader(), w.index, warp_max(lanes));
    });
    wg.barrier();

    let mut weights = SharedMemory::<f32>::new(num_partitions);
    wg.for_each_thread(|t| {
        let global_max = (0..NUM_WARPS)
            .map(|w| red_max.load(&t, w))
            .fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for p in (t.id()..num_partitions).step_by(NUM_THREADS) {
            let weight = exp_sums[p] * (max_logits[p] - global_max).exp();
            weights.store(&t, p, weight);
            sum += weight;
        }
        local[t.id()] = sum;
    });
    let mut red_sum = SharedMemory::<f32>::new(NUM_WARPS);
    wg.for_each_warp(|w| {
        let lanes = std::array::from_fn(|lane| local[w.index * WARP_SIZE + lane]);
        red_sum.store(&w.leader(), w.index, warp_sum(lanes));
    });
    wg.barrier();

    let mut out = vec![O::default(); HEAD_SIZE];
    wg.for_each_thread(|t| {
        let d = t.id();
        if d >= HEAD_SIZE {
            return;
        }
        let inv_sum = 1.0 / (0..NUM_WARPS).map(|w| red_sum.load(&t, w)).sum::<f32>();
        let acc: f32 = (0..num_partitions)
            .map(|p| tmp_out[p * HEAD_SIZE + d].to_f32() * weights.load(&t, p) * inv_sum)
            .sum();
        out[d] = O::store(acc, args.out_scale);
    });
    Some(out)
}
