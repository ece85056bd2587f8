// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Block-table resolution and paged KV-cache addressing.
//!
//! A sequence's keys and values live in fixed-capacity blocks scattered over
//! the cache. Row `s` of the block table lists the physical block ids of
//! sequence `s` in logical order; token `t` lives in logical block
//! `t / block_size` at offset `t % block_size`.
//!
//! Partitions are processed in fixed 256-token chunks, so the lanes covering
//! the tail of the last partition address tokens at or beyond `context_len`.
//! Those lookups are clamped to the last block that holds valid data: the
//! load is well-defined and the score is masked out afterwards.

use crate::error::{PagedAttnError, Result};

/// One sequence's row of the block table.
#[derive(Debug, Clone, Copy)]
pub struct BlockTableRow<'a> {
    entries: &'a [i32],
    block_size: usize,
    context_len: usize,
}

impl<'a> BlockTableRow<'a> {
    /// Wrap a block-table row.
    #[must_use]
    pub const fn new(entries: &'a [i32], block_size: usize, context_len: usize) -> Self {
        Self {
            entries,
            block_size,
            context_len,
        }
    }

    /// Number of logical blocks holding valid tokens.
    #[must_use]
    pub const fn num_valid_blocks(&self) -> usize {
        self.context_len.div_ceil(self.block_size)
    }

    /// Index of the last logical block holding valid tokens.
    #[must_use]
    pub const fn last_valid_block(&self) -> usize {
        self.num_valid_blocks().saturating_sub(1)
    }

    /// Logical block owning `token_idx`, clamped to [`Self::last_valid_block`].
    #[must_use]
    pub fn logical_block(&self, token_idx: usize) -> usize {
        Ord::min(token_idx / self.block_size, self.last_valid_block())
    }

    /// Physical block id owning `token_idx`. Never reads past the valid
    /// prefix of the row.
    #[must_use]
    pub fn resolve(&self, token_idx: usize) -> usize {
        self.entries[self.logical_block(token_idx)] as usize
    }
}

/// Resolve `token_idx` of a sequence to its physical block id.
///
/// Tokens at or beyond `context_len` resolve to the last valid block.
#[must_use]
pub fn resolve_physical_block(
    table_row: &[i32],
    token_idx: usize,
    context_len: usize,
    block_size: usize,
) -> usize {
    BlockTableRow::new(table_row, block_size, context_len).resolve(token_idx)
}

/// Check that every block-table entry a kernel may read is a valid physical
/// block id.
///
/// `block_tables` is `[num_seqs, max_blocks_per_seq]` row-major.
///
/// # Errors
///
/// Returns [`PagedAttnError::InvalidArgument`] if a sequence needs more
/// blocks than a row holds or references a block outside `0..num_blocks`.
pub fn validate_block_tables(
    block_tables: &[i32],
    max_blocks_per_seq: usize,
    context_lens: &[i32],
    block_size: usize,
    num_blocks: usize,
) -> Result<()> {
    for (seq, &context_len) in context_lens.iter().enumerate() {
        let context_len = usize::try_from(context_len).map_err(|_| {
            PagedAttnError::invalid("context_lens", format!("negative length at sequence {seq}"))
        })?;
        let row = &block_tables[seq * max_blocks_per_seq..(seq + 1) * max_blocks_per_seq];
        let needed = context_len.div_ceil(block_size);
        if needed > max_blocks_per_seq {
            return Err(PagedAttnError::invalid(
                "block_tables",
                format!(
                    "sequence {seq} has {context_len} tokens ({needed} blocks) \
                     but rows hold {max_blocks_per_seq} blocks"
                ),
            ));
        }
        if let Some((logical, &id)) = row[..needed]
            .iter()
            .enumerate()
            .find(|(_, &id)| id < 0 || id as usize >= num_blocks)
        {
            return Err(PagedAttnError::invalid(
                "block_tables",
                format!("sequence {seq} logical block {logical} maps to {id}, cache has {num_blocks} blocks"),
            ));
        }
    }
    Ok(())
}

/// Memory order of the K/V cache tensors.
///
/// Every kind keeps the block index outermost, so a block is one contiguous
/// run of [`PagedKvLayout::block_elems`] elements in either cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum KvLayoutKind {
    /// key `[num_blocks, num_kv_heads, head_size / x, block_size, x]`,
    /// value `[num_blocks, num_kv_heads, head_size, block_size]`.
    #[default]
    Paged,
    /// Paged keys; values packed by token,
    /// `[num_blocks, num_kv_heads, block_size / x, head_size, x]`.
    PagedAsm,
    /// Token-major key and value, `[num_blocks, block_size, num_kv_heads, head_size]`.
    Flash,
}

/// Addressing of the K/V cache tensors.
///
/// With [`KvLayoutKind::Paged`]:
/// - key: `[num_blocks, num_kv_heads, head_size / x, block_size, x]`
/// - value: `[num_blocks, num_kv_heads, head_size, block_size]`
///
/// `x` packs 16 bytes of a key row contiguously (8 for 16-bit storage, 16 for
/// fp8), so one lane fetches a whole vector per load. Every kind keeps those
/// `x` key elements adjacent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagedKvLayout {
    /// Physical blocks in the cache.
    pub num_blocks: usize,
    /// KV heads per block.
    pub num_kv_heads: usize,
    /// Elements per head.
    pub head_size: usize,
    /// Tokens per block.
    pub block_size: usize,
    /// Key elements packed per 16-byte vector.
    pub x: usize,
    /// Memory order of both caches.
    pub kind: KvLayoutKind,
}

impl PagedKvLayout {
    /// Bytes covered by one packed key vector.
    pub const VECTOR_BYTES: usize = 16;

    /// Paged layout for a cache whose storage element is `elem_bytes` wide.
    #[must_use]
    pub const fn new(
        num_blocks: usize,
        num_kv_heads: usize,
        head_size: usize,
        block_size: usize,
        elem_bytes: usize,
    ) -> Self {
        Self {
            num_blocks,
            num_kv_heads,
            head_size,
            block_size,
            x: Self::VECTOR_BYTES / elem_bytes,
            kind: KvLayoutKind::Paged,
        }
    }

    /// Same geometry in another memory order.
    #[must_use]
    pub const fn with_kind(mut self, kind: KvLayoutKind) -> Self {
        self.kind = kind;
        self
    }

    /// Check that the packed dimensions divide evenly.
    ///
    /// # Errors
    ///
    /// Returns [`PagedAttnError::InvalidArgument`] if `block_size` is zero,
    /// `head_size` is not a multiple of `x`, or, for
    /// [`KvLayoutKind::PagedAsm`], `block_size` is not a multiple of `x`.
    pub fn check(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(PagedAttnError::invalid("block_size", "must be positive"));
        }
        if self.head_size % self.x != 0 {
            return Err(PagedAttnError::invalid(
                "head_size",
                format!("{} is not a multiple of the key packing factor {}", self.head_size, self.x),
            ));
        }
        if self.kind == KvLayoutKind::PagedAsm && self.block_size % self.x != 0 {
            return Err(PagedAttnError::invalid(
                "block_size",
                format!(
                    "{} is not a multiple of the value packing factor {}",
                    self.block_size, self.x
                ),
            ));
        }
        Ok(())
    }

    /// Shape of the key cache tensor.
    #[must_use]
    pub fn key_shape(&self) -> Vec<usize> {
        let (n, h, hs, bs, x) = (self.num_blocks, self.num_kv_heads, self.head_size, self.block_size, self.x);
        match self.kind {
            KvLayoutKind::Paged | KvLayoutKind::PagedAsm => vec![n, h, hs / x, bs, x],
            KvLayoutKind::Flash => vec![n, bs, h, hs],
        }
    }

    /// Shape of the value cache tensor.
    #[must_use]
    pub fn value_shape(&self) -> Vec<usize> {
        let (n, h, hs, bs, x) = (self.num_blocks, self.num_kv_heads, self.head_size, self.block_size, self.x);
        match self.kind {
            KvLayoutKind::Paged => vec![n, h, hs, bs],
            KvLayoutKind::PagedAsm => vec![n, h, bs / x, hs, x],
            KvLayoutKind::Flash => vec![n, bs, h, hs],
        }
    }

    /// Elements of one block of one cache (all KV heads).
    #[must_use]
    pub const fn block_elems(&self) -> usize {
        self.num_kv_heads * self.head_size * self.block_size
    }

    /// Elements of one whole cache tensor.
    #[must_use]
    pub const fn cache_elems(&self) -> usize {
        self.num_blocks * self.block_elems()
    }

    /// Tokens the cache can hold; slot ids run over `0..num_slots()`.
    #[must_use]
    pub const fn num_slots(&self) -> usize {
        self.num_blocks * self.block_size
    }

    /// Flat offset of key element `d` of `token` (in-block) for `kv_head`.
    #[inline]
    #[must_use]
    pub const fn key_offset(&self, block: usize, kv_head: usize, token: usize, d: usize) -> usize {
        match self.kind {
            KvLayoutKind::Paged | KvLayoutKind::PagedAsm => {
                let head_base = (block * self.num_kv_heads + kv_head) * (self.head_size / self.x);
                ((head_base + d / self.x) * self.block_size + token) * self.x + d % self.x
            }
            KvLayoutKind::Flash => self.token_major_offset(block, kv_head, token, d),
        }
    }

    /// Flat offset of value element `d` of `token` (in-block) for `kv_head`.
    #[inline]
    #[must_use]
    pub const fn value_offset(&self, block: usize, kv_head: usize, token: usize, d: usize) -> usize {
        match self.kind {
            KvLayoutKind::Paged => ((block * self.num_kv_heads + kv_head) * self.head_size + d) * self.block_size + token,
            KvLayoutKind::PagedAsm => {
                let head_base = (block * self.num_kv_heads + kv_head) * (self.block_size / self.x);
                ((head_base + token / self.x) * self.head_size + d) * self.x + token % self.x
            }
            KvLayoutKind::Flash => self.token_major_offset(block, kv_head, token, d),
        }
    }

    const fn token_major_offset(&self, block: usize, kv_head: usize, token: usize, d: usize) -> usize {
        ((block * self.block_size + token) * self.num_kv_heads + kv_head) * self.head_size + d
    }
}
