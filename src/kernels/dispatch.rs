// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Kernel dispatch and the two-stage launcher.
//!
//! Every supported combination of compute dtype, cache dtype, output dtype,
//! block size, head size, GQA ratio and instruction shape is monomorphized
//! once and registered in a table keyed by [`KernelKey`]. A launch validates
//! its buffers, looks up the specialization and runs it:
//!
//! 1. QKV stage over the grid `(num_seqs, max_num_partitions, num_kv_heads)`.
//! 2. Reduction stage over the grid `(num_heads, num_seqs)`, only after
//!    every QKV workgroup has finished.
//!
//! Workgroups of a stage run in parallel on the rayon pool. Each returns what
//! it wrote and the launcher scatters the results into the output buffers.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use half::{bf16, f16};
use rayon::prelude::*;

use super::block_table::{validate_block_tables, PagedKvLayout};
use super::config::{
    KvCacheDtype, MfmaVariant, PagedAttentionConfig, MAX_GQA_RATIO, SUPPORTED_BLOCK_SIZES,
    SUPPORTED_HEAD_SIZES,
};
use super::convert::{CacheScalar, ComputeScalar, Fp8E4M3, OutputScalar};
use super::mfma::{Mfma16x16, Mfma4x4, MfmaShape};
use super::qkv::{paged_attention_qkv, PagedAttentionArgs, QkvOutput, QkvWorkgroupId};
use super::reduce::{paged_attention_reduce, ReduceArgs};
use crate::error::{PagedAttnError, Result};

/// Element type of a launch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemKind {
    /// IEEE half precision.
    F16,
    /// bfloat16.
    Bf16,
    /// 8-bit e4m3 float.
    Fp8E4M3,
}

impl ElemKind {
    /// Size of one element in bytes.
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F16 | Self::Bf16 => 2,
            Self::Fp8E4M3 => 1,
        }
    }

    /// Name used in errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::F16 => "f16",
            Self::Bf16 => "bf16",
            Self::Fp8E4M3 => "fp8_e4m3",
        }
    }
}

impl fmt::Display for ElemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only launch buffer.
#[derive(Debug, Clone, Copy)]
pub enum Buffer<'a> {
    /// f16 elements.
    F16(&'a [f16]),
    /// bf16 elements.
    Bf16(&'a [bf16]),
    /// fp8 e4m3 elements.
    Fp8(&'a [Fp8E4M3]),
}

/// Writable launch buffer.
#[derive(Debug)]
pub enum BufferMut<'a> {
    /// f16 elements.
    F16(&'a mut [f16]),
    /// bf16 elements.
    Bf16(&'a mut [bf16]),
    /// fp8 e4m3 elements.
    Fp8(&'a mut [Fp8E4M3]),
}

impl Buffer<'_> {
    /// Element type.
    #[must_use]
    pub const fn kind(&self) -> ElemKind {
        match self {
            Self::F16(_) => ElemKind::F16,
            Self::Bf16(_) => ElemKind::Bf16,
            Self::Fp8(_) => ElemKind::Fp8E4M3,
        }
    }

    /// Number of elements.
    #[must_use]
    pub const fn len(&self) -> usize {
        match self {
            Self::F16(s) => s.len(),
            Self::Bf16(s) => s.len(),
            Self::Fp8(s) => s.len(),
        }
    }

    /// Whether the buffer has no elements.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BufferMut<'_> {
    /// Element type.
    #[must_use]
    pub const fn kind(&self) -> ElemKind {
        match self {
            Self::F16(_) => ElemKind::F16,
            Self::Bf16(_) => ElemKind::Bf16,
            Self::Fp8(_) => ElemKind::Fp8E4M3,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F16(s) => s.len(),
            Self::Bf16(s) => s.len(),
            Self::Fp8(s) => s.len(),
        }
    }

    /// Whether the buffer has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Typed views into erased buffers.
trait BufferElem: Sized {
    const KIND: ElemKind;

    fn view<'a>(buf: Buffer<'a>, name: &'static str) -> Result<&'a [Self]>;

    fn view_mut<'a>(buf: &'a mut BufferMut<'_>, name: &'static str) -> Result<&'a mut [Self]>;
}

macro_rules! impl_buffer_elem {
    ($t:ty, $variant:ident, $kind:ident) => {
        impl BufferElem for $t {
            const KIND: ElemKind = ElemKind::$kind;

            fn view<'a>(buf: Buffer<'a>, name: &'static str) -> Result<&'a [Self]> {
                match buf {
                    Buffer::$variant(s) => Ok(s),
                    other => Err(kind_mismatch(name, Self::KIND, other.kind())),
                }
            }

            fn view_mut<'a>(
                buf: &'a mut BufferMut<'_>,
                name: &'static str,
            ) -> Result<&'a mut [Self]> {
                let actual = buf.kind();
                match buf {
                    BufferMut::$variant(s) => Ok(&mut **s),
                    _ => Err(kind_mismatch(name, Self::KIND, actual)),
                }
            }
        }
    };
}

impl_buffer_elem!(f16, F16, F16);
impl_buffer_elem!(bf16, Bf16, Bf16);
impl_buffer_elem!(Fp8E4M3, Fp8, Fp8E4M3);

fn kind_mismatch(name: &'static str, expected: ElemKind, actual: ElemKind) -> PagedAttnError {
    PagedAttnError::invalid(name, format!("expected {expected} elements, got {actual}"))
}

/// Inputs of one paged-attention launch.
#[derive(Debug, Clone, Copy)]
pub struct LaunchParams<'a> {
    /// `[num_seqs, num_heads, head_size]`, f16 or bf16.
    pub query: Buffer<'a>,
    /// Paged key cache, compute dtype or fp8.
    pub key_cache: Buffer<'a>,
    /// Paged value cache, same dtype as `key_cache`.
    pub value_cache: Buffer<'a>,
    /// `[num_seqs, max_blocks_per_seq]`.
    pub block_tables: &'a [i32],
    /// `[num_seqs]`.
    pub context_lens: &'a [i32],
    /// Query heads per sequence.
    pub num_heads: usize,
    /// Elements per head.
    pub head_size: usize,
    /// Row length of `block_tables`.
    pub max_blocks_per_seq: usize,
    /// Scalar arguments.
    pub config: &'a PagedAttentionConfig,
}

impl LaunchParams<'_> {
    /// Number of sequences in the batch.
    #[must_use]
    pub fn num_seqs(&self) -> usize {
        self.context_lens.len()
    }
}

/// Caller-allocated outputs of one launch.
///
/// The intermediates may hold anything on entry; slots of partitions past a
/// sequence's context are left untouched.
#[derive(Debug)]
pub struct LaunchOutputs<'a> {
    /// `[num_seqs, num_heads, head_size]`, compute dtype or fp8.
    pub out: BufferMut<'a>,
    /// `[num_seqs, num_heads, max_num_partitions]`.
    pub exp_sums: &'a mut [f32],
    /// `[num_seqs, num_heads, max_num_partitions]`.
    pub max_logits: &'a mut [f32],
    /// `[num_seqs, num_heads, max_num_partitions, head_size]`, compute dtype.
    pub tmp_out: BufferMut<'a>,
}

/// Grid shapes of the two stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGrid {
    /// `(num_seqs, max_num_partitions, num_kv_heads)`.
    pub qkv: [usize; 3],
    /// `(num_heads, num_seqs)`.
    pub reduce: [usize; 2],
}

impl LaunchGrid {
    /// Grids for a batch.
    #[must_use]
    pub const fn new(
        num_seqs: usize,
        num_heads: usize,
        num_kv_heads: usize,
        max_num_partitions: usize,
    ) -> Self {
        Self {
            qkv: [num_seqs, max_num_partitions, num_kv_heads],
            reduce: [num_heads, num_seqs],
        }
    }

    /// Number of QKV workgroups.
    #[must_use]
    pub const fn qkv_workgroups(&self) -> usize {
        self.qkv[0] * self.qkv[1] * self.qkv[2]
    }

    /// Number of reduction workgroups.
    #[must_use]
    pub const fn reduce_workgroups(&self) -> usize {
        self.reduce[0] * self.reduce[1]
    }
}

/// Specialization selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelKey {
    /// Query / partial-output dtype.
    pub compute: ElemKind,
    /// KV-cache storage dtype.
    pub cache: ElemKind,
    /// Final output dtype.
    pub output: ElemKind,
    /// Tokens per cache block.
    pub block_size: usize,
    /// Elements per head.
    pub head_size: usize,
    /// Query heads per KV head.
    pub gqa_ratio: usize,
    /// Concrete instruction shape (never `Auto`).
    pub mfma: MfmaVariant,
}

impl KernelKey {
    /// Key of the launch described by `params` writing to `outputs`.
    ///
    /// # Errors
    ///
    /// Returns [`PagedAttnError::UnsupportedConfig`] if the buffer dtypes
    /// disagree with the configured cache and output formats.
    pub fn for_launch(params: &LaunchParams<'_>, outputs: &LaunchOutputs<'_>) -> Result<Self> {
        let config = params.config;
        let compute = params.query.kind();
        if compute == ElemKind::Fp8E4M3 {
            return Err(PagedAttnError::UnsupportedConfig(
                "query must be f16 or bf16".to_string(),
            ));
        }
        let cache = params.key_cache.kind();
        let expected_cache = match config.kv_cache_dtype {
            KvCacheDtype::Auto => compute,
            KvCacheDtype::Fp8E4M3 => ElemKind::Fp8E4M3,
        };
        if cache != expected_cache || params.value_cache.kind() != expected_cache {
            return Err(PagedAttnError::UnsupportedConfig(format!(
                "kv_cache_dtype {} with {compute} query needs {expected_cache} caches, got {cache}/{}",
                config.kv_cache_dtype,
                params.value_cache.kind()
            )));
        }
        let expected_output = if config.out_scale.is_some() {
            ElemKind::Fp8E4M3
        } else {
            compute
        };
        if outputs.out.kind() != expected_output {
            return Err(PagedAttnError::UnsupportedConfig(format!(
                "output must be {expected_output}, got {}",
                outputs.out.kind()
            )));
        }
        if outputs.tmp_out.kind() != compute {
            return Err(kind_mismatch("tmp_out", compute, outputs.tmp_out.kind()));
        }
        let gqa_ratio = params.num_heads / config.num_kv_heads;
        Ok(Self {
            compute,
            cache,
            output: expected_output,
            block_size: config.block_size,
            head_size: params.head_size,
            gqa_ratio,
            mfma: config.mfma.resolve(gqa_ratio),
        })
    }
}

/// A registered specialization.
pub type KernelFn = fn(&LaunchParams<'_>, &mut LaunchOutputs<'_>) -> Result<()>;

/// Every key of the supported specialization set.
#[must_use]
pub fn supported_kernel_keys() -> Vec<KernelKey> {
    let dtypes = [
        (ElemKind::F16, ElemKind::F16),
        (ElemKind::F16, ElemKind::Fp8E4M3),
        (ElemKind::Bf16, ElemKind::Bf16),
        (ElemKind::Bf16, ElemKind::Fp8E4M3),
    ];
    let mut keys = Vec::new();
    for (compute, cache) in dtypes {
        for output in [compute, ElemKind::Fp8E4M3] {
            for block_size in SUPPORTED_BLOCK_SIZES {
                for head_size in SUPPORTED_HEAD_SIZES {
                    for gqa_ratio in 1..=MAX_GQA_RATIO {
                        for mfma in [MfmaVariant::Mfma4x4, MfmaVariant::Mfma16x16] {
                            keys.push(KernelKey {
                                compute,
                                cache,
                                output,
                                block_size,
                                head_size,
                                gqa_ratio,
                                mfma,
                            });
                        }
                    }
                }
            }
        }
    }
    keys
}

macro_rules! register_gqa {
    ($table:ident, $t:ty, $c:ty, $o:ty, $s:ty, $bs:literal, $hs:literal; $($gqa:literal)+) => {
        $(
            $table.insert(
                KernelKey {
                    compute: <$t as BufferElem>::KIND,
                    cache: <$c as BufferElem>::KIND,
                    output: <$o as BufferElem>::KIND,
                    block_size: $bs,
                    head_size: $hs,
                    gqa_ratio: $gqa,
                    mfma: <$s as MfmaShape>::VARIANT,
                },
                run_paged_attention::<$t, $c, $o, $s, $bs, $hs, $gqa> as KernelFn,
            );
        )+
    };
}

macro_rules! register_sizes {
    ($table:ident, $t:ty, $c:ty, $o:ty, $s:ty) => {
        register_gqa!($table, $t, $c, $o, $s, 16, 64; 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16);
        register_gqa!($table, $t, $c, $o, $s, 16, 128; 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16);
        register_gqa!($table, $t, $c, $o, $s, 32, 64; 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16);
        register_gqa!($table, $t, $c, $o, $s, 32, 128; 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16);
    };
}

macro_rules! register_dtypes {
    ($table:ident, $t:ty, $c:ty, $o:ty) => {
        register_sizes!($table, $t, $c, $o, Mfma4x4);
        register_sizes!($table, $t, $c, $o, Mfma16x16);
    };
}

fn kernel_table() -> &'static HashMap<KernelKey, KernelFn> {
    static TABLE: OnceLock<HashMap<KernelKey, KernelFn>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = HashMap::new();
        register_dtypes!(table, f16, f16, f16);
        register_dtypes!(table, f16, f16, Fp8E4M3);
        register_dtypes!(table, f16, Fp8E4M3, f16);
        register_dtypes!(table, f16, Fp8E4M3, Fp8E4M3);
        register_dtypes!(table, bf16, bf16, bf16);
        register_dtypes!(table, bf16, bf16, Fp8E4M3);
        register_dtypes!(table, bf16, Fp8E4M3, bf16);
        register_dtypes!(table, bf16, Fp8E4M3, Fp8E4M3);
        tracing::debug!(specializations = table.len(), "paged attention kernel table built");
        table
    })
}

/// Look up the specialization for `key`.
///
/// # Errors
///
/// Returns [`PagedAttnError::UnsupportedConfig`] if no specialization matches.
pub fn select_kernel(key: &KernelKey) -> Result<KernelFn> {
    kernel_table()
        .get(key)
        .copied()
        .ok_or_else(|| PagedAttnError::UnsupportedConfig(format!("no kernel for {key:?}")))
}

/// Validate a launch and run both stages.
///
/// # Errors
///
/// Returns an error, before any kernel work, if the configuration is outside
/// the supported set or any buffer has the wrong dtype or length.
pub fn paged_attention_launch(
    params: &LaunchParams<'_>,
    outputs: &mut LaunchOutputs<'_>,
) -> Result<()> {
    let key = validate_launch(params, outputs)?;
    let kernel = select_kernel(&key)?;
    let grid = LaunchGrid::new(
        params.num_seqs(),
        params.num_heads,
        params.config.num_kv_heads,
        params.config.max_num_partitions(),
    );
    tracing::debug!(
        ?key,
        qkv_grid = ?grid.qkv,
        reduce_grid = ?grid.reduce,
        "launching paged attention"
    );
    kernel(params, outputs)
}

fn validate_launch(params: &LaunchParams<'_>, outputs: &LaunchOutputs<'_>) -> Result<KernelKey> {
    let config = params.config;
    config.validate(params.num_heads, params.head_size)?;
    let key = KernelKey::for_launch(params, outputs)?;

    let num_seqs = params.num_seqs();
    let head_size = params.head_size;
    check_len("query", params.query.len(), &[num_seqs, params.num_heads, head_size])?;

    let layout = cache_layout(params, key.cache)?;
    check_len(
        "value_cache",
        params.value_cache.len(),
        &layout.value_shape(),
    )?;

    check_len(
        "block_tables",
        params.block_tables.len(),
        &[num_seqs, params.max_blocks_per_seq],
    )?;
    if let Some((seq, &len)) = params
        .context_lens
        .iter()
        .enumerate()
        .find(|(_, &len)| usize::try_from(len).is_ok_and(|len| len > config.max_context_len))
    {
        return Err(PagedAttnError::invalid(
            "context_lens",
            format!(
                "sequence {seq} has {len} tokens, above max_context_len {}",
                config.max_context_len
            ),
        ));
    }
    validate_block_tables(
        params.block_tables,
        params.max_blocks_per_seq,
        params.context_lens,
        config.block_size,
        layout.num_blocks,
    )?;

    let max_num_partitions = config.max_num_partitions();
    check_len("out", outputs.out.len(), &[num_seqs, params.num_heads, head_size])?;
    let stats = [num_seqs, params.num_heads, max_num_partitions];
    check_len("exp_sums", outputs.exp_sums.len(), &stats)?;
    check_len("max_logits", outputs.max_logits.len(), &stats)?;
    check_len(
        "tmp_out",
        outputs.tmp_out.len(),
        &[num_seqs, params.num_heads, max_num_partitions, head_size],
    )?;
    Ok(key)
}

/// Layout of the caches, with `num_blocks` inferred from the key cache.
fn cache_layout(params: &LaunchParams<'_>, cache: ElemKind) -> Result<PagedKvLayout> {
    let per_block = PagedKvLayout::new(
        1,
        params.config.num_kv_heads,
        params.head_size,
        params.config.block_size,
        cache.size_in_bytes(),
    )
    .with_kind(params.config.kv_layout);
    per_block.check()?;
    let block_elems = per_block.block_elems();
    let len = params.key_cache.len();
    if len % block_elems != 0 {
        return Err(PagedAttnError::ShapeMismatch {
            name: "key_cache",
            expected: per_block.key_shape()[1..].to_vec(),
            actual: vec![len],
        });
    }
    Ok(PagedKvLayout {
        num_blocks: len / block_elems,
        ..per_block
    })
}

fn check_len(name: &'static str, len: usize, shape: &[usize]) -> Result<()> {
    if len == shape.iter().product::<usize>() {
        Ok(())
    } else {
        Err(PagedAttnError::ShapeMismatch {
            name,
            expected: shape.to_vec(),
            actual: vec![len],
        })
    }
}

/// One fully specialized launch.
fn run_paged_attention<T, C, O, S, const BLOCK_SIZE: usize, const HEAD_SIZE: usize, const GQA: usize>(
    params: &LaunchParams<'_>,
    outputs: &mut LaunchOutputs<'_>,
) -> Result<()>
where
    T: ComputeScalar + BufferElem,
    C: CacheScalar<T> + BufferElem,
    O: OutputScalar + BufferElem,
    S: MfmaShape,
{
    let config = params.config;
    let num_seqs = params.num_seqs();
    let num_heads = params.num_heads;
    let max_num_partitions = config.max_num_partitions();
    let grid = LaunchGrid::new(num_seqs, num_heads, config.num_kv_heads, max_num_partitions);

    let key_cache = C::view(params.key_cache, "key_cache")?;
    let args = PagedAttentionArgs {
        query: T::view(params.query, "query")?,
        key_cache,
        value_cache: C::view(params.value_cache, "value_cache")?,
        layout: PagedKvLayout::new(
            key_cache.len() / (config.num_kv_heads * HEAD_SIZE * BLOCK_SIZE),
            config.num_kv_heads,
            HEAD_SIZE,
            BLOCK_SIZE,
            std::mem::size_of::<C>(),
        )
        .with_kind(config.kv_layout),
        block_tables: params.block_tables,
        max_blocks_per_seq: params.max_blocks_per_seq,
        context_lens: params.context_lens,
        num_heads,
        scale: config.scale,
        k_scale: config.k_scale,
        v_scale: config.v_scale,
        out_scale: config.out_scale.unwrap_or(1.0),
        alibi_slopes: config.alibi_slopes.as_deref(),
    };

    let out = O::view_mut(&mut outputs.out, "out")?;
    let tmp_out = T::view_mut(&mut outputs.tmp_out, "tmp_out")?;

    // Stage 1.
    let [_, grid_partitions, grid_kv_heads] = grid.qkv;
    let results: Vec<(QkvWorkgroupId, QkvOutput<T, O>)> = (0..grid.qkv_workgroups())
        .into_par_iter()
        .map(|flat| {
            let id = QkvWorkgroupId {
                seq: flat / (grid_partitions * grid_kv_heads),
                partition: flat / grid_kv_heads % grid_partitions,
                kv_head: flat % grid_kv_heads,
            };
            (
                id,
                paged_attention_qkv::<T, C, O, S, BLOCK_SIZE, HEAD_SIZE, GQA>(&args, id),
            )
        })
        .collect();
    tracing::trace!(workgroups = results.len(), "qkv stage complete");

    for (id, result) in results {
        let head0 = id.kv_head * GQA;
        match result {
            QkvOutput::Skipped => {}
            QkvOutput::Final(values) => {
                let start = (id.seq * num_heads + head0) * HEAD_SIZE;
                out[start..start + values.len()].copy_from_slice(&values);
            }
            QkvOutput::Partial(partial) => {
                for i in 0..GQA {
                    let slot = (id.seq * num_heads + head0 + i) * max_num_partitions + id.partition;
                    outputs.max_logits[slot] = partial.max_logits[i];
                    outputs.exp_sums[slot] = partial.exp_sums[i];
                    tmp_out[slot * HEAD_SIZE..(slot + 1) * HEAD_SIZE]
                        .copy_from_slice(&partial.tmp_out[i * HEAD_SIZE..(i + 1) * HEAD_SIZE]);
                }
            }
        }
    }

    // Stage 2.
    let reduce_args = ReduceArgs {
        exp_sums: &*outputs.exp_sums,
        max_logits: &*outputs.max_logits,
        tmp_out: &*tmp_out,
        context_lens: params.context_lens,
        num_heads,
        max_num_partitions,
        out_scale: config.out_scale.unwrap_or(1.0),
    };
    let [grid_heads, _] = grid.reduce;
    let reduced: Vec<(usize, Vec<O>)> = (0..grid.reduce_workgroups())
        .into_par_iter()
        .filter_map(|flat| {
            let (head, seq) = (flat % grid_heads, flat / grid_heads);
            paged_attention_reduce::<T, O, HEAD_SIZE>(&reduce_args, head, seq)
                .map(|values| (seq * num_heads + head, values))
        })
        .collect();
    tracing::trace!(merged = reduced.len(), "reduce stage complete");

    for (row, values) in reduced {
        out[row * HEAD_SIZE..(row + 1) * HEAD_SIZE].copy_from_slice(&values);
    }
    Ok(())
}
