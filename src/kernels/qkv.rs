// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! QKV attention kernel.
//!
//! One workgroup handles one `(sequence, partition, kv_head)` triple: the
//! `GQA` query heads sharing `kv_head` against the (up to) 256 context tokens
//! of the partition.
//!
//! ## Lane layout
//!
//! Thread `(warp, lane)` owns token `partition_start + warp * 64 + lane`: it
//! resolves the token's cache block, holds the token's key and value rows in
//! registers and, after `Q·Kᵀ`, the token's scores for every head of the
//! group. Each warp then runs `P·V` over its own 64 tokens and the four warp
//! partials are summed through shared memory.
//!
//! ## Online softmax
//!
//! Only partition-local statistics are known here. The value accumulator
//! `acc = Σ exp(s - partition_max) · v` is divided by the partition's own
//! `exp_sum` before it is narrowed to the compute dtype. When the sequence
//! has a single partition that is the final output; otherwise the kernel
//! emits `(max_logit, exp_sum, acc / exp_sum)` for the reduction kernel.

use super::block_table::{BlockTableRow, PagedKvLayout};
use super::config::PARTITION_SIZE;
use super::convert::{addx4, CacheScalar, ComputeScalar, OutputScalar, Packed4, F32x4};
use super::mfma::{tiled_matmul, MfmaShape};
use super::workgroup::{warp_max, warp_sum, SharedMemory, Workgroup, NUM_THREADS, NUM_WARPS, WARP_SIZE};

/// Read-only buffers and scalars shared by every workgroup of a launch.
#[derive(Debug, Clone, Copy)]
pub struct PagedAttentionArgs<'a, T, C> {
    /// `[num_seqs, num_heads, head_size]`.
    pub query: &'a [T],
    /// `[num_blocks, num_kv_heads, head_size / x, block_size, x]`.
    pub key_cache: &'a [C],
    /// `[num_blocks, num_kv_heads, head_size, block_size]`.
    pub value_cache: &'a [C],
    /// Addressing of both caches.
    pub layout: PagedKvLayout,
    /// `[num_seqs, max_blocks_per_seq]`.
    pub block_tables: &'a [i32],
    /// Row length of `block_tables`.
    pub max_blocks_per_seq: usize,
    /// `[num_seqs]`.
    pub context_lens: &'a [i32],
    /// Query heads per sequence.
    pub num_heads: usize,
    /// Softmax temperature.
    pub scale: f32,
    /// Key dequantization scale, used only for quantized caches.
    pub k_scale: f32,
    /// Value dequantization scale, used only for quantized caches.
    pub v_scale: f32,
    /// Output scale, used only for quantized outputs.
    pub out_scale: f32,
    /// `[num_heads]` ALiBi slopes.
    pub alibi_slopes: Option<&'a [f32]>,
}

impl<T, C> PagedAttentionArgs<'_, T, C> {
    /// Valid tokens of `seq`. Negative lengths are rejected before launch.
    #[must_use]
    pub fn context_len(&self, seq: usize) -> usize {
        usize::try_from(self.context_lens[seq]).unwrap_or(0)
    }

    /// Block-table row of `seq`.
    #[must_use]
    pub fn block_table(&self, seq: usize) -> BlockTableRow<'_> {
        let start = seq * self.max_blocks_per_seq;
        BlockTableRow::new(
            &self.block_tables[start..start + self.max_blocks_per_seq],
            self.layout.block_size,
            self.context_len(seq),
        )
    }
}

/// Grid coordinates of one QKV workgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QkvWorkgroupId {
    /// Sequence index.
    pub seq: usize,
    /// Partition index within the sequence's context.
    pub partition: usize,
    /// KV head; covers query heads `kv_head * GQA .. (kv_head + 1) * GQA`.
    pub kv_head: usize,
}

/// Per-partition statistics and partition-local output of one head group.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionPartial<T> {
    /// `[GQA]` partition-local maximum of the scaled scores.
    pub max_logits: Vec<f32>,
    /// `[GQA]` `Σ exp(s - max_logit)` over the partition.
    pub exp_sums: Vec<f32>,
    /// `[GQA, head_size]` `Σ exp(s - max_logit) · v / exp_sum`.
    pub tmp_out: Vec<T>,
}

/// What one QKV workgroup wrote.
#[derive(Debug, Clone, PartialEq)]
pub enum QkvOutput<T, O> {
    /// The partition starts at or beyond `context_len`; nothing was written.
    Skipped,
    /// Single-partition sequence: `[GQA, head_size]` final output.
    Final(Vec<O>),
    /// Multi-partition sequence: input for the reduction kernel.
    Partial(PartitionPartial<T>),
}

/// Run one QKV workgroup.
///
/// Specialized on compute dtype `T`, cache storage `C`, output storage `O`,
/// instruction shape `S`, block size, head size and GQA ratio. Arguments
/// must have passed launch validation; the kernel itself cannot fail.
#[allow(clippy::too_many_lines)]
pub fn paged_attention_qkv<
    T,
    C,
    O,
    S,
    const BLOCK_SIZE: usize,
    const HEAD_SIZE: usize,
    const GQA: usize,
>(
    args: &PagedAttentionArgs<'_, T, C>,
    id: QkvWorkgroupId,
) -> QkvOutput<T, O>
where
    T: ComputeScalar,
    C: CacheScalar<T>,
    O: OutputScalar,
    S: MfmaShape,
{
    debug_assert_eq!(args.layout.block_size, BLOCK_SIZE);
    debug_assert_eq!(args.layout.head_size, HEAD_SIZE);

    let context_len = args.context_len(id.seq);
    let partition_start = id.partition * PARTITION_SIZE;
    if partition_start >= context_len {
        return QkvOutput::Skipped;
    }
    let single_partition = context_len <= PARTITION_SIZE;
    let head0 = id.kv_head * GQA;
    let table = args.block_table(id.seq);
    let layout = args.layout;
    let quads = GQA * HEAD_SIZE / 4;

    let mut wg = Workgroup::new();

    // Query rows of the group, as packed quads.
    let mut q_shared = SharedMemory::<Packed4<T>>::new(quads);
    let q_base = (id.seq * args.num_heads + head0) * HEAD_SIZE;
    wg.for_each_thread(|t| {
        for quad in (t.id()..quads).step_by(NUM_THREADS) {
            q_shared.store(&t, quad, Packed4::load(args.query, q_base + quad * 4));
        }
    });

    // Key and value rows of each thread's token. Lanes past `context_len`
    // load from the clamped last valid block.
    let mut k_regs = vec![T::default(); NUM_THREADS * HEAD_SIZE];
    let mut v_regs = vec![T::default(); NUM_THREADS * HEAD_SIZE];
    wg.for_each_thread(|t| {
        let token = partition_start + t.id();
        let block = table.resolve(token);
        let slot = token % BLOCK_SIZE;
        let k_row = &mut k_regs[t.id() * HEAD_SIZE..(t.id() + 1) * HEAD_SIZE];
        for d0 in (0..HEAD_SIZE).step_by(layout.x) {
            let base = layout.key_offset(block, id.kv_head, slot, d0);
            for (j, k) in k_row[d0..d0 + layout.x].iter_mut().enumerate() {
                *k = args.key_cache[base + j].to_compute();
            }
        }
        // Masked tokens get weight 0, but 0 · NaN is not 0: zero their values.
        if token >= context_len {
            return;
        }
        let v_row = &mut v_regs[t.id() * HEAD_SIZE..(t.id() + 1) * HEAD_SIZE];
        for (d, v) in v_row.iter_mut().enumerate() {
            *v = args.value_cache[layout.value_offset(block, id.kv_head, slot, d)].to_compute();
        }
    });
    wg.barrier();

    // Q·Kᵀ: rows are heads, columns are the warp's tokens.
    let mut scores = vec![0.0f32; NUM_THREADS * GQA];
    wg.for_each_warp(|w| {
        let leader = w.leader();
        let first = w.index * WARP_SIZE;
        tiled_matmul::<S, T>(
            GQA,
            WARP_SIZE,
            HEAD_SIZE,
            |head, d| q_shared.load(&leader, (head * HEAD_SIZE + d) / 4).0[d % 4],
            |d, lane| k_regs[(first + lane) * HEAD_SIZE + d],
            |head, lane, s| scores[(first + lane) * GQA + head] = s,
        );
    });

    // The key scale is folded into the softmax scale.
    let qk_scale = if C::QUANTIZED {
        args.scale * args.k_scale
    } else {
        args.scale
    };
    wg.for_each_thread(|t| {
        let token = partition_start + t.id();
        let row = &mut scores[t.id() * GQA..(t.id() + 1) * GQA];
        for (i, s) in row.iter_mut().enumerate() {
            *s = if token < context_len {
                let scaled = *s * qk_scale;
                match args.alibi_slopes {
                    Some(slopes) => scaled + slopes[head0 + i] * alibi_distance(token, context_len),
                    None => scaled,
                }
            } else {
                f32::NEG_INFINITY
            };
        }
    });

    // Partition max: warp butterfly, then across warps through shared memory.
    let mut red_max = SharedMemory::<f32>::new(NUM_WARPS * GQA);
    wg.for_each_warp(|w| {
        let first = w.index * WARP_SIZE;
        for i in 0..GQA {
            let lanes = std::array::from_fn(|lane| scores[(first + lane) * GQA + i]);
            red_max.store(&w.leader(), w.index * GQA + i, warp_max(lanes));
        }
    });
    wg.barrier();

    // Unnormalized weights. Masked tokens have score -inf and weight 0; the
    // partition max is finite because the partition holds a valid token.
    let mut weights = vec![0.0f32; NUM_THREADS * GQA];
    wg.for_each_thread(|t| {
        for i in 0..GQA {
            let max = (0..NUM_WARPS)
                .map(|w| red_max.load(&t, w * GQA + i))
                .fold(f32::NEG_INFINITY, f32::max);
            weights[t.id() * GQA + i] = (scores[t.id() * GQA + i] - max).exp();
        }
    });

    let mut red_sum = SharedMemory::<f32>::new(NUM_WARPS * GQA);
    wg.for_each_warp(|w| {
        let first = w.index * WARP_SIZE;
        for i in 0..GQA {
            let lanes = std::array::from_fn(|lane| weights[(first + lane) * GQA + i]);
            red_sum.store(&w.leader(), w.index * GQA + i, warp_sum(lanes));
        }
    });

    // P·V per warp over its own tokens; weights enter the instruction in T.
    let probs: Vec<T> = weights.iter().map(|&p| T::from_f32(p)).collect();
    let mut warp_acc = vec![0.0f32; NUM_WARPS * GQA * HEAD_SIZE];
    wg.for_each_warp(|w| {
        let first = w.index * WARP_SIZE;
        let acc = &mut warp_acc[w.index * GQA * HEAD_SIZE..(w.index + 1) * GQA * HEAD_SIZE];
        tiled_matmul::<S, T>(
            GQA,
            HEAD_SIZE,
            WARP_SIZE,
            |head, lane| probs[(first + lane) * GQA + head],
            |lane, d| v_regs[(first + lane) * HEAD_SIZE + d],
            |head, d, v| acc[head * HEAD_SIZE + d] = v,
        );
    });

    let mut pv_shared = SharedMemory::<F32x4>::new(NUM_WARPS * quads);
    wg.for_each_thread(|t| {
        for quad in (t.lane..quads).step_by(WARP_SIZE) {
            let base = (t.warp * quads + quad) * 4;
            let mut v = [0.0; 4];
            v.copy_from_slice(&warp_acc[base..base + 4]);
            pv_shared.store(&t, t.warp * quads + quad, v);
        }
    });
    wg.barrier();

    // Cross-warp sum; thread t owns quads t, t + 256, ...
    let v_scale = if C::QUANTIZED { args.v_scale } else { 1.0 };
    let mut partition_stats = vec![(0.0f32, 0.0f32); GQA];
    let mut acc_out = vec![[0.0f32; 4]; quads];
    wg.for_each_thread(|t| {
        for quad in (t.id()..quads).step_by(NUM_THREADS) {
            let sum = (0..NUM_WARPS).fold([0.0; 4], |acc, w| {
                addx4(acc, pv_shared.load(&t, w * quads + quad))
            });
            acc_out[quad] = sum.map(|v| v * v_scale);
        }
        if t.id() < GQA {
            let i = t.id();
            let max = (0..NUM_WARPS)
                .map(|w| red_max.load(&t, w * GQA + i))
                .fold(f32::NEG_INFINITY, f32::max);
            let sum = (0..NUM_WARPS)
                .map(|w| red_sum.load(&t, w * GQA + i))
                .sum::<f32>();
            partition_stats[i] = (max, sum);
        }
    });

    // Normalize by the partition's own sum before narrowing: the raw
    // accumulator can reach exp_sum · max|v| and overflow 16 bits.
    let normalized = acc_out.iter().enumerate().map(|(quad, acc)| {
        let exp_sum = partition_stats[quad * 4 / HEAD_SIZE].1;
        acc.map(|v| v / exp_sum)
    });
    if single_partition {
        let out = normalized
            .flat_map(|quad| quad.map(|v| O::store(v, args.out_scale)))
            .collect();
        QkvOutput::Final(out)
    } else {
        let tmp_out = normalized
            .flat_map(|quad| Packed4::<T>::from_f32x4(quad).0)
            .collect();
        let (max_logits, exp_sums) = partition_stats.into_iter().unzip();
        QkvOutput::Partial(PartitionPartial {
            max_logits,
            exp_sums,
            tmp_out,
        })
    }
}

/// ALiBi distance of `token` from the newest token, `token + 1 - context_len`.
/// Uses the absolute token index so the bias is continuous across partitions.
#[inline]
fn alibi_distance(token: usize, context_len: usize) -> f32 {
    (token as f64 + 1.0 - context_len as f64) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::convert::Fp8E4M3;
    use crate::kernels::mfma::{Mfma16x16, Mfma4x4};
    use half::f16;

    const HS: usize = 64;
    const BS: usize = 16;

    struct Fixture {
        query: Vec<f16>,
        key_cache: Vec<f16>,
        value_cache: Vec<f16>,
        layout: PagedKvLayout,
        block_tables: Vec<i32>,
        context_lens: Vec<i32>,
        num_heads: usize,
    }

    impl Fixture {
        fn new(context_len: usize, num_heads: usize) -> Self {
            let num_blocks = context_len.div_ceil(BS) + 2;
            let layout = PagedKvLayout::new(num_blocks, 1, HS, BS, 2);
            let wave = |i: usize, m: usize| f16::from_f32(((i * m % 97) as f32 - 48.0) / 64.0);
            // Reverse block order to exercise the indirection.
            let block_tables = (0..num_blocks as i32).rev().collect();
            Self {
                query: (0..num_heads * HS).map(|i| wave(i, 13)).collect(),
                key_cache: (0..layout.cache_elems()).map(|i| wave(i, 7)).collect(),
                value_cache: (0..layout.cache_elems()).map(|i| wave(i, 11)).collect(),
                layout,
                block_tables,
                context_lens: vec![context_len as i32],
                num_heads,
            }
        }

        fn args(&self) -> PagedAttentionArgs<'_, f16, f16> {
            PagedAttentionArgs {
                query: &self.query,
                key_cache: &self.key_cache,
                value_cache: &self.value_cache,
                layout: self.layout,
                block_tables: &self.block_tables,
                max_blocks_per_seq: self.layout.num_blocks,
                context_lens: &self.context_lens,
                num_heads: self.num_heads,
                scale: 0.125,
                k_scale: 1.0,
                v_scale: 1.0,
                out_scale: 1.0,
                alibi_slopes: None,
            }
        }

        /// f64 softmax attention for `head` over the first `context_len` tokens.
        fn reference(&self, head: usize) -> Vec<f64> {
            let context_len = self.context_lens[0] as usize;
            let args = self.args();
            let table = args.block_table(0);
            let q = &self.query[head * HS..(head + 1) * HS];
            let scores: Vec<f64> = (0..context_len)
                .map(|tok| {
                    let block = table.resolve(tok);
                    (0..HS)
                        .map(|d| {
                            let k = self.key_cache[self.layout.key_offset(block, 0, tok % BS, d)];
                            f64::from(q[d].to_f32()) * f64::from(k.to_f32())
                        })
                        .sum::<f64>()
                        * 0.125
                })
                .collect();
            let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let weights: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
            let total: f64 = weights.iter().sum();
            (0..HS)
                .map(|d| {
                    (0..context_len)
                        .map(|tok| {
                            let block = table.resolve(tok);
                            let v = self.value_cache[self.layout.value_offset(block, 0, tok % BS, d)];
                            weights[tok] * f64::from(v.to_f32())
                        })
                        .sum::<f64>()
                        / total
                })
                .collect()
        }
    }

    fn id(partition: usize) -> QkvWorkgroupId {
        QkvWorkgroupId {
            seq: 0,
            partition,
            kv_head: 0,
        }
    }

    #[test]
    fn test_single_partition_writes_final_output() {
        let fx = Fixture::new(100, 1);
        let out = paged_attention_qkv::<f16, f16, f16, Mfma4x4, BS, HS, 1>(&fx.args(), id(0));
        let QkvOutput::Final(values) = out else {
            panic!("expected final output");
        };
        for (got, expected) in values.iter().zip(fx.reference(0)) {
            assert!((f64::from(got.to_f32()) - expected).abs() < 2e-3);
        }
    }

    #[test]
    fn test_partition_past_context_is_skipped() {
        let fx = Fixture::new(256, 1);
        let out = paged_attention_qkv::<f16, f16, f16, Mfma4x4, BS, HS, 1>(&fx.args(), id(1));
        assert_eq!(out, QkvOutput::Skipped);
    }

    #[test]
    fn test_multi_partition_emits_statistics() {
        let fx = Fixture::new(300, 4);
        let args = fx.args();
        let first = paged_attention_qkv::<f16, f16, f16, Mfma16x16, BS, HS, 4>(&args, id(0));
        let second = paged_attention_qkv::<f16, f16, f16, Mfma16x16, BS, HS, 4>(&args, id(1));
        let (QkvOutput::Partial(a), QkvOutput::Partial(b)) = (first, second) else {
            panic!("expected partial outputs");
        };
        assert_eq!(a.tmp_out.len(), 4 * HS);
        // Partition means: convex combinations of values in [-0.75, 0.75].
        for v in a.tmp_out.iter().chain(&b.tmp_out) {
            assert!(v.to_f32().abs() <= 0.751, "{v}");
        }
        for i in 0..4 {
            assert!(a.max_logits[i].is_finite() && b.max_logits[i].is_finite());
            // 256 and 44 valid tokens, each weighing at most 1.
            assert!(a.exp_sums[i] >= 1.0 && a.exp_sums[i] <= 256.0);
            assert!(b.exp_sums[i] >= 1.0 && b.exp_sums[i] <= 44.0);
        }
    }

    #[test]
    fn test_masked_tokens_do_not_contribute() {
        // Garbage past context_len in the last block must not change the result.
        let mut fx = Fixture::new(20, 1);
        let args = fx.args();
        let clean = paged_attention_qkv::<f16, f16, f16, Mfma4x4, BS, HS, 1>(&args, id(0));
        let last_block = args.block_table(0).resolve(19);
        for slot in 4..BS {
            for d in 0..HS {
                let k = fx.layout.key_offset(last_block, 0, slot, d);
                let v = fx.layout.value_offset(last_block, 0, slot, d);
                fx.key_cache[k] = f16::from_f32(1.0e4);
                fx.value_cache[v] = f16::NAN;
            }
        }
        let dirty = paged_attention_qkv::<f16, f16, f16, Mfma4x4, BS, HS, 1>(&fx.args(), id(0));
        assert_eq!(clean, dirty);
    }

    #[test]
    fn test_fp8_cache_folds_scales() {
        let (k_scale, v_scale) = (0.5f32, 0.25f32);
        let mut fx = Fixture::new(64, 1);
        let fp8_layout = PagedKvLayout::new(fx.layout.num_blocks, 1, HS, BS, 1);
        let mut k8 = vec![Fp8E4M3::default(); fp8_layout.cache_elems()];
        let mut v8 = vec![Fp8E4M3::default(); fp8_layout.cache_elems()];
        for block in 0..fx.layout.num_blocks {
            for slot in 0..BS {
                for d in 0..HS {
                    let (k16, v16) = (
                        fx.layout.key_offset(block, 0, slot, d),
                        fx.layout.value_offset(block, 0, slot, d),
                    );
                    let kq = <Fp8E4M3 as CacheScalar<f16>>::from_compute(fx.key_cache[k16], k_scale);
                    let vq = <Fp8E4M3 as CacheScalar<f16>>::from_compute(fx.value_cache[v16], v_scale);
                    k8[fp8_layout.key_offset(block, 0, slot, d)] = kq;
                    v8[fp8_layout.value_offset(block, 0, slot, d)] = vq;
                    // Dequantized values are exact in f16: the reference sees
                    // exactly what the kernel sees.
                    fx.key_cache[k16] = f16::from_f32(kq.to_f32() * k_scale);
                    fx.value_cache[v16] = f16::from_f32(vq.to_f32() * v_scale);
                }
            }
        }
        let base = fx.args();
        let args = PagedAttentionArgs {
            query: base.query,
            key_cache: &k8,
            value_cache: &v8,
            layout: fp8_layout,
            block_tables: base.block_tables,
            max_blocks_per_seq: base.max_blocks_per_seq,
            context_lens: base.context_lens,
            num_heads: 1,
            scale: base.scale,
            k_scale,
            v_scale,
            out_scale: 1.0,
            alibi_slopes: None,
        };
        let out = paged_attention_qkv::<f16, Fp8E4M3, f16, Mfma4x4, BS, HS, 1>(&args, id(0));
        let QkvOutput::Final(values) = out else {
            panic!("expected final output");
        };
        for (got, expected) in values.iter().zip(fx.reference(0)) {
            assert!((f64::from(got.to_f32()) - expected).abs() < 2e-3);
        }
    }

    #[test]
    fn test_alibi_distance_is_absolute() {
        assert_eq!(alibi_distance(299, 300), 0.0);
        assert_eq!(alibi_distance(0, 300), -299.0);
        assert_eq!(alibi_distance(256, 300), -43.0);
    }
}
