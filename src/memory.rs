// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Workspace sizing and allocation accounting.
//!
//! A multi-partition launch needs three intermediates per
//! `(sequence, head, partition)`: `exp_sums` and `max_logits` (f32) and
//! `tmp_out` (compute dtype, `head_size` elements each).

use candle_core::DType;
use half::{bf16, f16};

use crate::error::{PagedAttnError, Result};
use crate::kernels::config::PARTITION_SIZE;
use crate::kernels::dispatch::{BufferMut, LaunchOutputs};

/// Byte accounting for workspace allocations with an optional limit.
#[derive(Debug, Default)]
pub struct MemoryPool {
    /// Total allocated bytes
    allocated: usize,
    /// Peak memory usage
    peak: usize,
    /// Memory limit (if set)
    limit: Option<usize>,
}

impl MemoryPool {
    /// Create a new memory pool.
    #[must_use]
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            allocated: 0,
            peak: 0,
            limit,
        }
    }

    /// Request memory allocation.
    ///
    /// # Errors
    /// Returns `OutOfMemory` if limit would be exceeded.
    pub fn allocate(&mut self, bytes: usize) -> Result<()> {
        let new_total = self.allocated + bytes;

        if let Some(limit) = self.limit {
            if new_total > limit {
                return Err(PagedAttnError::OutOfMemory {
                    required: new_total,
                    available: limit.saturating_sub(self.allocated),
                });
            }
        }

        self.allocated = new_total;
        self.peak = self.peak.max(self.allocated);
        Ok(())
    }

    /// Free memory.
    pub fn free(&mut self, bytes: usize) {
        self.allocated = self.allocated.saturating_sub(bytes);
    }

    /// Get current allocation.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Get peak allocation.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak
    }
}

/// Partial-output buffer in the compute dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum TmpOut {
    /// f16 partials.
    F16(Vec<f16>),
    /// bf16 partials.
    Bf16(Vec<bf16>),
}

impl TmpOut {
    fn zeros(dtype: DType, len: usize) -> Result<Self> {
        match dtype {
            DType::F16 => Ok(Self::F16(vec![f16::ZERO; len])),
            DType::BF16 => Ok(Self::Bf16(vec![bf16::ZERO; len])),
            other => Err(PagedAttnError::DTypeMismatch {
                name: "query",
                expected: "f16 or bf16",
                actual: other,
            }),
        }
    }

    /// Erased mutable view for a launch.
    pub fn as_buffer_mut(&mut self) -> BufferMut<'_> {
        match self {
            Self::F16(v) => BufferMut::F16(v),
            Self::Bf16(v) => BufferMut::Bf16(v),
        }
    }
}

/// Element counts of the intermediates of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceLayout {
    /// Partition stride, `ceil(max_context_len / 256)`.
    pub max_num_partitions: usize,
    /// Elements of `exp_sums` (and of `max_logits`).
    pub stats_elems: usize,
    /// Elements of `tmp_out`.
    pub tmp_out_elems: usize,
    /// Bytes of one `tmp_out` element.
    pub tmp_out_elem_bytes: usize,
}

impl WorkspaceLayout {
    /// Sizes for a batch.
    #[must_use]
    pub const fn new(
        num_seqs: usize,
        num_heads: usize,
        head_size: usize,
        max_context_len: usize,
        tmp_out_elem_bytes: usize,
    ) -> Self {
        let max_num_partitions = max_context_len.div_ceil(PARTITION_SIZE);
        let stats_elems = num_seqs * num_heads * max_num_partitions;
        Self {
            max_num_partitions,
            stats_elems,
            tmp_out_elems: stats_elems * head_size,
            tmp_out_elem_bytes,
        }
    }

    /// Total bytes of all three intermediates.
    #[must_use]
    pub const fn total_bytes(&self) -> usize {
        2 * self.stats_elems * std::mem::size_of::<f32>() + self.tmp_out_elems * self.tmp_out_elem_bytes
    }
}

/// Caller-owned intermediates of a paged-attention launch.
#[derive(Debug)]
pub struct PagedAttentionWorkspace {
    /// `[num_seqs, num_heads, max_num_partitions]`.
    pub exp_sums: Vec<f32>,
    /// `[num_seqs, num_heads, max_num_partitions]`.
    pub max_logits: Vec<f32>,
    /// `[num_seqs, num_heads, max_num_partitions, head_size]`.
    pub tmp_out: TmpOut,
    layout: WorkspaceLayout,
}

impl PagedAttentionWorkspace {
    /// Allocate the intermediates for a batch with compute dtype `dtype`.
    ///
    /// # Errors
    ///
    /// Returns [`PagedAttnError::DTypeMismatch`] unless `dtype` is f16 or bf16.
    pub fn for_launch(
        num_seqs: usize,
        num_heads: usize,
        head_size: usize,
        max_context_len: usize,
        dtype: DType,
    ) -> Result<Self> {
        let layout = WorkspaceLayout::new(
            num_seqs,
            num_heads,
            head_size,
            max_context_len,
            dtype.size_in_bytes(),
        );
        Ok(Self {
            exp_sums: vec![0.0; layout.stats_elems],
            max_logits: vec![f32::NEG_INFINITY; layout.stats_elems],
            tmp_out: TmpOut::zeros(dtype, layout.tmp_out_elems)?,
            layout,
        })
    }

    /// Like [`Self::for_launch`], charging the bytes to `pool` first.
    ///
    /// # Errors
    ///
    /// Returns [`PagedAttnError::OutOfMemory`] if the pool limit would be
    /// exceeded; nothing is allocated in that case.
    pub fn allocate_in(
        pool: &mut MemoryPool,
        num_seqs: usize,
        num_heads: usize,
        head_size: usize,
        max_context_len: usize,
        dtype: DType,
    ) -> Result<Self> {
        let bytes = WorkspaceLayout::new(
            num_seqs,
            num_heads,
            head_size,
            max_context_len,
            dtype.size_in_bytes(),
        )
        .total_bytes();
        pool.allocate(bytes)?;
        Self::for_launch(num_seqs, num_heads, head_size, max_context_len, dtype).inspect_err(|_| pool.free(bytes))
    }

    /// Return this workspace's bytes to `pool`.
    pub fn release(self, pool: &mut MemoryPool) {
        pool.free(self.layout.total_bytes());
    }

    /// Element counts and sizes.
    #[must_use]
    pub const fn layout(&self) -> WorkspaceLayout {
        self.layout
    }

    /// Total bytes held.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.layout.total_bytes()
    }

    /// Borrow as launch outputs writing the final result to `out`.
    pub fn outputs<'a>(&'a mut self, out: BufferMut<'a>) -> LaunchOutputs<'a> {
        LaunchOutputs {
            out,
            exp_sums: &mut self.exp_sums,
            max_logits: &mut self.max_logits,
            tmp_out: self.tmp_out.as_buffer_mut(),
        }
    }
}

/// Render a byte count with a binary unit.
#[must_use]
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
