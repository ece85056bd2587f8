// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Paged KV-cache maintenance.
//!
//! [`PagedKvCache`] owns the key and value caches of one layer in the kernel
//! layouts and provides the operations a serving loop runs around attention:
//! writing new tokens through a slot mapping, forking and swapping blocks,
//! and converting between full precision and fp8.

use std::marker::PhantomData;

use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};

use super::block_table::{KvLayoutKind, PagedKvLayout};
use super::convert::{dequantize_fp8, quantize_fp8, CacheScalar, ComputeScalar, Fp8E4M3};
use crate::error::{PagedAttnError, Result};

/// Cache element with a Candle tensor representation.
pub trait CacheStorage: Copy + Default + Send + Sync + 'static {
    /// Build a tensor of the storage dtype.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` does not fill `shape`.
    fn to_tensor(data: &[Self], shape: &[usize], device: &Device) -> Result<Tensor>;

    /// Read a tensor of the storage dtype.
    ///
    /// # Errors
    ///
    /// Returns a Candle error for any other dtype.
    fn from_tensor(tensor: &Tensor) -> Result<Vec<Self>>;
}

macro_rules! impl_cache_storage {
    ($t:ty) => {
        impl CacheStorage for $t {
            fn to_tensor(data: &[Self], shape: &[usize], device: &Device) -> Result<Tensor> {
                Ok(Tensor::from_slice(data, shape, device)?)
            }

            fn from_tensor(tensor: &Tensor) -> Result<Vec<Self>> {
                Ok(tensor.flatten_all()?.to_vec1()?)
            }
        }
    };
}

impl_cache_storage!(f16);
impl_cache_storage!(bf16);

impl CacheStorage for Fp8E4M3 {
    fn to_tensor(data: &[Self], shape: &[usize], device: &Device) -> Result<Tensor> {
        let bytes: Vec<u8> = data.iter().map(|q| q.to_bits()).collect();
        Ok(Tensor::from_vec(bytes, shape, device)?)
    }

    fn from_tensor(tensor: &Tensor) -> Result<Vec<Self>> {
        Ok(tensor
            .flatten_all()?
            .to_vec1::<u8>()?
            .into_iter()
            .map(Fp8E4M3::from_bits)
            .collect())
    }
}

/// Key and value caches of one layer, for compute dtype `T` stored as `C`.
///
/// # Example
///
/// ```rust
/// use half::f16;
/// use paged_attn_rs::kernels::PagedKvCache;
///
/// # fn main() -> paged_attn_rs::Result<()> {
/// let mut cache = PagedKvCache::<f16>::new(4, 1, 64, 16)?;
/// let key = vec![f16::ONE; 64];
/// let value = vec![f16::ONE; 64];
/// // Token lands in block 2, slot 5.
/// cache.reshape_and_cache(&key, &value, &[2 * 16 + 5], 1.0, 1.0)?;
/// assert_eq!(cache.key(2, 0, 5, 63), f16::ONE);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PagedKvCache<T, C = T> {
    key: Vec<C>,
    value: Vec<C>,
    layout: PagedKvLayout,
    _compute: PhantomData<T>,
}

impl<T, C> PagedKvCache<T, C>
where
    T: ComputeScalar,
    C: CacheScalar<T> + CacheStorage,
{
    /// Zeroed caches of `num_blocks` blocks in the paged layout.
    ///
    /// # Errors
    ///
    /// Returns [`PagedAttnError::InvalidArgument`] if `head_size` is not a
    /// multiple of the key packing factor or `block_size` is zero.
    pub fn new(num_blocks: usize, num_kv_heads: usize, head_size: usize, block_size: usize) -> Result<Self> {
        Self::with_kind(num_blocks, num_kv_heads, head_size, block_size, KvLayoutKind::Paged)
    }

    /// Zeroed caches in the given memory order.
    ///
    /// [`KvLayoutKind::PagedAsm`] additionally needs `block_size` to be a
    /// multiple of the packing factor; [`KvLayoutKind::Flash`] is the
    /// token-major layout of flash-style kernels.
    ///
    /// # Errors
    ///
    /// Returns [`PagedAttnError::InvalidArgument`] if the packed dimensions
    /// do not divide evenly.
    pub fn with_kind(
        num_blocks: usize,
        num_kv_heads: usize,
        head_size: usize,
        block_size: usize,
        kind: KvLayoutKind,
    ) -> Result<Self> {
        let layout = PagedKvLayout::new(
            num_blocks,
            num_kv_heads,
            head_size,
            block_size,
            std::mem::size_of::<C>(),
        )
        .with_kind(kind);
        layout.check()?;
        Ok(Self {
            key: vec![C::default(); layout.cache_elems()],
            value: vec![C::default(); layout.cache_elems()],
            layout,
            _compute: PhantomData,
        })
    }

    /// Load caches from tensors in the layout `layout` describes.
    ///
    /// # Errors
    ///
    /// Returns a shape or dtype error if the tensors do not match `layout`
    /// and the storage dtype.
    pub fn from_tensors(key: &Tensor, value: &Tensor, layout: PagedKvLayout) -> Result<Self> {
        layout.check()?;
        for (name, tensor) in [("key_cache", key), ("value_cache", value)] {
            if tensor.dtype() != C::STORAGE_DTYPE {
                return Err(PagedAttnError::DTypeMismatch {
                    name,
                    expected: C::STORAGE_DTYPE.as_str(),
                    actual: tensor.dtype(),
                });
            }
        }
        if key.dims() != layout.key_shape() {
            return Err(PagedAttnError::ShapeMismatch {
                name: "key_cache",
                expected: layout.key_shape().to_vec(),
                actual: key.dims().to_vec(),
            });
        }
        if value.dims() != layout.value_shape() {
            return Err(PagedAttnError::ShapeMismatch {
                name: "value_cache",
                expected: layout.value_shape().to_vec(),
                actual: value.dims().to_vec(),
            });
        }
        Ok(Self {
            key: C::from_tensor(key)?,
            value: C::from_tensor(value)?,
            layout,
            _compute: PhantomData,
        })
    }

    /// Cache geometry.
    #[must_use]
    pub const fn layout(&self) -> PagedKvLayout {
        self.layout
    }

    /// Flat key cache in the kernel layout.
    #[must_use]
    pub fn key_cache(&self) -> &[C] {
        &self.key
    }

    /// Flat value cache in the kernel layout.
    #[must_use]
    pub fn value_cache(&self) -> &[C] {
        &self.value
    }

    /// Key element `d` of in-block `token` for `kv_head`.
    #[must_use]
    pub fn key(&self, block: usize, kv_head: usize, token: usize, d: usize) -> C {
        self.key[self.layout.key_offset(block, kv_head, token, d)]
    }

    /// Value element `d` of in-block `token` for `kv_head`.
    #[must_use]
    pub fn value(&self, block: usize, kv_head: usize, token: usize, d: usize) -> C {
        self.value[self.layout.value_offset(block, kv_head, token, d)]
    }

    /// Key and value tensors in the kernel layouts.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor creation fails.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        Ok((
            C::to_tensor(&self.key, &self.layout.key_shape(), device)?,
            C::to_tensor(&self.value, &self.layout.value_shape(), device)?,
        ))
    }

    /// Scatter new tokens into the cache.
    ///
    /// `key` and `value` are `[num_tokens, num_kv_heads, head_size]`; token `i`
    /// is written to slot `slot_mapping[i] = block * block_size + offset`.
    /// Negative slots mark padding tokens and are skipped. Quantized caches
    /// store `fp8(x / k_scale)` and `fp8(x / v_scale)`. Tokens land in the
    /// cache's own memory order, so the same call fills paged, asm-packed
    /// and token-major (flash) caches.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer lengths disagree or a slot lies past
    /// the last block. Nothing is written in that case.
    pub fn reshape_and_cache(
        &mut self,
        key: &[T],
        value: &[T],
        slot_mapping: &[i64],
        k_scale: f32,
        v_scale: f32,
    ) -> Result<()> {
        self.check_tokens(key, value, slot_mapping)?;
        let layout = self.layout;
        for (i, block, offset) in slots(slot_mapping, layout.block_size) {
            for h in 0..layout.num_kv_heads {
                let src = token_row(&layout, i, h);
                for d in 0..layout.head_size {
                    self.key[layout.key_offset(block, h, offset, d)] = C::from_compute(key[src + d], k_scale);
                    self.value[layout.value_offset(block, h, offset, d)] =
                        C::from_compute(value[src + d], v_scale);
                }
            }
        }
        tracing::trace!(tokens = slot_mapping.len(), kind = ?layout.kind, "cached tokens");
        Ok(())
    }

    fn check_tokens(&self, key: &[T], value: &[T], slot_mapping: &[i64]) -> Result<()> {
        let layout = self.layout;
        let token_elems = layout.num_kv_heads * layout.head_size;
        for (name, buf) in [("key", key), ("value", value)] {
            if buf.len() != slot_mapping.len() * token_elems {
                return Err(PagedAttnError::ShapeMismatch {
                    name,
                    expected: vec![slot_mapping.len(), layout.num_kv_heads, layout.head_size],
                    actual: vec![buf.len()],
                });
            }
        }
        let num_slots = layout.num_slots();
        if let Some(&slot) = slot_mapping
            .iter()
            .find(|&&s| usize::try_from(s).is_ok_and(|s| s >= num_slots))
        {
            return Err(PagedAttnError::invalid(
                "slot_mapping",
                format!("slot {slot} is past the cache's {num_slots} slots"),
            ));
        }
        Ok(())
    }

    /// Copy whole blocks within the cache, `(src, dst)` per entry.
    ///
    /// Entries apply in order, so a later entry sees the copies of earlier
    /// ones.
    ///
    /// # Errors
    ///
    /// Returns [`PagedAttnError::InvalidArgument`] if any block id is out of
    /// range; nothing is copied in that case.
    pub fn copy_blocks(&mut self, mapping: &[(usize, usize)]) -> Result<()> {
        check_mapping(mapping, self.layout.num_blocks, self.layout.num_blocks)?;
        let n = self.layout.block_elems();
        for &(src, dst) in mapping {
            if src == dst {
                continue;
            }
            self.key.copy_within(src * n..(src + 1) * n, dst * n);
            self.value.copy_within(src * n..(src + 1) * n, dst * n);
        }
        Ok(())
    }

    /// Copy blocks of this cache into `dst`, `(src_block, dst_block)` per entry.
    ///
    /// Used to move blocks between device and host caches of the same
    /// geometry; block counts may differ.
    ///
    /// # Errors
    ///
    /// Returns an error if the geometries differ or a block id is out of
    /// range; nothing is copied in that case.
    pub fn swap_blocks(&self, dst: &mut Self, mapping: &[(usize, usize)]) -> Result<()> {
        let (a, b) = (self.layout, dst.layout);
        if (a.num_kv_heads, a.head_size, a.block_size, a.kind) != (b.num_kv_heads, b.head_size, b.block_size, b.kind) {
            return Err(PagedAttnError::ShapeMismatch {
                name: "swap_blocks dst",
                expected: a.key_shape()[1..].to_vec(),
                actual: b.key_shape()[1..].to_vec(),
            });
        }
        check_mapping(mapping, a.num_blocks, b.num_blocks)?;
        let n = a.block_elems();
        for &(s, d) in mapping {
            dst.key[d * n..(d + 1) * n].copy_from_slice(&self.key[s * n..(s + 1) * n]);
            dst.value[d * n..(d + 1) * n].copy_from_slice(&self.value[s * n..(s + 1) * n]);
        }
        Ok(())
    }

    /// Re-encode every element into another storage format.
    fn convert<D>(&self, key_fn: impl Fn(C) -> D, value_fn: impl Fn(C) -> D) -> Result<PagedKvCache<T, D>>
    where
        D: CacheScalar<T> + CacheStorage,
    {
        let src = self.layout;
        let mut out =
            PagedKvCache::<T, D>::with_kind(src.num_blocks, src.num_kv_heads, src.head_size, src.block_size, src.kind)?;
        let dst = out.layout;
        for block in 0..src.num_blocks {
            for h in 0..src.num_kv_heads {
                for t in 0..src.block_size {
                    for d in 0..src.head_size {
                        out.key[dst.key_offset(block, h, t, d)] = key_fn(self.key[src.key_offset(block, h, t, d)]);
                        out.value[dst.value_offset(block, h, t, d)] =
                            value_fn(self.value[src.value_offset(block, h, t, d)]);
                    }
                }
            }
        }
        Ok(out)
    }
}

impl<T> PagedKvCache<T, T>
where
    T: ComputeScalar + CacheScalar<T> + CacheStorage,
    Fp8E4M3: CacheScalar<T>,
{
    /// Quantize to an fp8 cache, `fp8(x / scale)`.
    ///
    /// The key layout is repacked for the wider fp8 vectors.
    ///
    /// # Errors
    ///
    /// Returns [`PagedAttnError::InvalidArgument`] if `head_size` is not a
    /// multiple of 16.
    pub fn to_fp8(&self, k_scale: f32, v_scale: f32) -> Result<PagedKvCache<T, Fp8E4M3>> {
        self.convert(
            |k| quantize_fp8(k.to_f32(), k_scale),
            |v| quantize_fp8(v.to_f32(), v_scale),
        )
    }
}

impl<T> PagedKvCache<T, Fp8E4M3>
where
    T: ComputeScalar + CacheScalar<T> + CacheStorage,
    Fp8E4M3: CacheScalar<T>,
{
    /// Dequantize to a full-precision cache, `f32(q) * scale`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the full-precision layout is invalid.
    pub fn to_compute(&self, k_scale: f32, v_scale: f32) -> Result<PagedKvCache<T, T>> {
        self.convert(
            |k| T::from_f32(dequantize_fp8(k, k_scale)),
            |v| T::from_f32(dequantize_fp8(v, v_scale)),
        )
    }
}

impl<T> PagedKvCache<T, Fp8E4M3>
where
    T: ComputeScalar + CacheScalar<T> + CacheStorage,
    Fp8E4M3: CacheScalar<T>,
{
    /// Scatter new tokens with one quantization scale per token and KV head.
    ///
    /// Each `head_size` row is stored as `fp8(x / s)` with
    /// `s = max|x| / 448`, and `s` is recorded in `scales` at
    /// `(kv_head, slot)`. All-zero rows get scale 0 and store zeros.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer lengths disagree, a slot lies past the
    /// last block, or `scales` was sized for another cache. Nothing is
    /// written in that case.
    pub fn reshape_and_cache_with_pertoken_quant(
        &mut self,
        key: &[T],
        value: &[T],
        slot_mapping: &[i64],
        scales: &mut TokenScales,
    ) -> Result<()> {
        self.check_tokens(key, value, slot_mapping)?;
        scales.check(&self.layout)?;
        let layout = self.layout;
        let hs = layout.head_size;
        for (i, block, offset) in slots(slot_mapping, layout.block_size) {
            let slot = block * layout.block_size + offset;
            for h in 0..layout.num_kv_heads {
                let row = token_row(&layout, i, h);
                let (k_row, v_row) = (&key[row..row + hs], &value[row..row + hs]);
                let (k_scale, v_scale) = (row_scale(k_row), row_scale(v_row));
                scales.set(h, slot, k_scale, v_scale);
                for d in 0..hs {
                    self.key[layout.key_offset(block, h, offset, d)] = quantize_row(k_row[d], k_scale);
                    self.value[layout.value_offset(block, h, offset, d)] = quantize_row(v_row[d], v_scale);
                }
            }
        }
        tracing::trace!(tokens = slot_mapping.len(), "cached tokens with per-token scales");
        Ok(())
    }

    /// Dequantize a cache filled by
    /// [`reshape_and_cache_with_pertoken_quant`](Self::reshape_and_cache_with_pertoken_quant).
    ///
    /// # Errors
    ///
    /// Returns [`PagedAttnError::ShapeMismatch`] if `scales` was sized for
    /// another cache.
    pub fn dequantize_with_token_scales(&self, scales: &TokenScales) -> Result<PagedKvCache<T, T>> {
        scales.check(&self.layout)?;
        let src = self.layout;
        let mut out =
            PagedKvCache::<T, T>::with_kind(src.num_blocks, src.num_kv_heads, src.head_size, src.block_size, src.kind)?;
        let dst = out.layout;
        for block in 0..src.num_blocks {
            for h in 0..src.num_kv_heads {
                for t in 0..src.block_size {
                    let slot = block * src.block_size + t;
                    let (k_scale, v_scale) = (scales.key(h, slot), scales.value(h, slot));
                    for d in 0..src.head_size {
                        let k = self.key[src.key_offset(block, h, t, d)];
                        let v = self.value[src.value_offset(block, h, t, d)];
                        out.key[dst.key_offset(block, h, t, d)] = T::from_f32(dequantize_fp8(k, k_scale));
                        out.value[dst.value_offset(block, h, t, d)] = T::from_f32(dequantize_fp8(v, v_scale));
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Dequantization scales of a per-token quantized cache,
/// `[num_kv_heads, num_slots]` for keys and for values.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenScales {
    key: Vec<f32>,
    value: Vec<f32>,
    num_kv_heads: usize,
    num_slots: usize,
}

impl TokenScales {
    /// Unit scales for every slot of a cache with `layout`.
    #[must_use]
    pub fn new(layout: &PagedKvLayout) -> Self {
        let (num_kv_heads, num_slots) = (layout.num_kv_heads, layout.num_slots());
        Self {
            key: vec![1.0; num_kv_heads * num_slots],
            value: vec![1.0; num_kv_heads * num_slots],
            num_kv_heads,
            num_slots,
        }
    }

    /// Key scale of `slot` for `kv_head`.
    #[must_use]
    pub fn key(&self, kv_head: usize, slot: usize) -> f32 {
        self.key[kv_head * self.num_slots + slot]
    }

    /// Value scale of `slot` for `kv_head`.
    #[must_use]
    pub fn value(&self, kv_head: usize, slot: usize) -> f32 {
        self.value[kv_head * self.num_slots + slot]
    }

    /// Key and value scales as `[num_kv_heads, num_slots]` f32 tensors.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor creation fails.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let shape = (self.num_kv_heads, self.num_slots);
        Ok((
            Tensor::from_slice(&self.key, shape, device)?,
            Tensor::from_slice(&self.value, shape, device)?,
        ))
    }

    fn set(&mut self, kv_head: usize, slot: usize, key: f32, value: f32) {
        let i = kv_head * self.num_slots + slot;
        self.key[i] = key;
        self.value[i] = value;
    }

    fn check(&self, layout: &PagedKvLayout) -> Result<()> {
        if (self.num_kv_heads, self.num_slots) != (layout.num_kv_heads, layout.num_slots()) {
            return Err(PagedAttnError::ShapeMismatch {
                name: "token_scales",
                expected: vec![layout.num_kv_heads, layout.num_slots()],
                actual: vec![self.num_kv_heads, self.num_slots],
            });
        }
        Ok(())
    }
}

/// `max|x| / 448`, mapping the row's largest magnitude onto the fp8 range.
fn row_scale<T: ComputeScalar>(row: &[T]) -> f32 {
    row.iter().map(|v| v.to_f32().abs()).fold(0.0, f32::max) / Fp8E4M3::MAX
}

fn quantize_row<T: ComputeScalar>(x: T, scale: f32) -> Fp8E4M3 {
    if scale > 0.0 {
        quantize_fp8(x.to_f32(), scale)
    } else {
        Fp8E4M3::default()
    }
}

/// `(token, block, offset)` of every non-padding entry of `slot_mapping`.
fn slots(slot_mapping: &[i64], block_size: usize) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
    slot_mapping.iter().enumerate().filter_map(move |(i, &slot)| {
        let slot = usize::try_from(slot).ok()?;
        Some((i, slot / block_size, slot % block_size))
    })
}

/// Start of `kv_head`'s row of token `i` in a `[num_tokens, num_kv_heads, head_size]` buffer.
const fn token_row(layout: &PagedKvLayout, i: usize, kv_head: usize) -> usize {
    (i * layout.num_kv_heads + kv_head) * layout.head_size
}

/// Direction of [`convert_fp8`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fp8Conversion {
    /// f16/bf16 to fp8 e4m3 bytes.
    Quantize,
    /// fp8 e4m3 bytes to the given 16-bit dtype.
    Dequantize(DType),
}

/// Element-wise fp8 conversion of a whole tensor.
///
/// Shapes are preserved; callers converting a key cache must repack it for
/// the other dtype's vector width (see [`PagedKvCache::to_fp8`]).
///
/// # Errors
///
/// Returns [`PagedAttnError::DTypeMismatch`] if the source dtype does not
/// match the direction.
pub fn convert_fp8(src: &Tensor, scale: f32, direction: Fp8Conversion) -> Result<Tensor> {
    match direction {
        Fp8Conversion::Quantize => {
            if !matches!(src.dtype(), DType::F16 | DType::BF16) {
                return Err(PagedAttnError::DTypeMismatch {
                    name: "src",
                    expected: "f16 or bf16",
                    actual: src.dtype(),
                });
            }
            let bytes: Vec<u8> = src
                .flatten_all()?
                .to_dtype(DType::F32)?
                .to_vec1::<f32>()?
                .into_iter()
                .map(|x| quantize_fp8(x, scale).to_bits())
                .collect();
            Ok(Tensor::from_vec(bytes, src.dims(), src.device())?)
        }
        Fp8Conversion::Dequantize(dtype) => {
            if src.dtype() != DType::U8 {
                return Err(PagedAttnError::DTypeMismatch {
                    name: "src",
                    expected: "u8 (fp8 e4m3)",
                    actual: src.dtype(),
                });
            }
            if !matches!(dtype, DType::F16 | DType::BF16) {
                return Err(PagedAttnError::DTypeMismatch {
                    name: "dst",
                    expected: "f16 or bf16",
                    actual: dtype,
                });
            }
            let values: Vec<f32> = src
                .flatten_all()?
                .to_vec1::<u8>()?
                .into_iter()
                .map(|b| dequantize_fp8(Fp8E4M3::from_bits(b), scale))
                .collect();
            Ok(Tensor::from_vec(values, src.dims(), src.device())?.to_dtype(dtype)?)
        }
    }
}

fn check_mapping(mapping: &[(usize, usize)], src_blocks: usize, dst_blocks: usize) -> Result<()> {
    if let Some(&(s, d)) = mapping.iter().find(|&&(s, d)| s >= src_blocks || d >= dst_blocks) {
        return Err(PagedAttnError::invalid(
            "block_mapping",
            format!("({s}, {d}) out of range for {src_blocks} -> {dst_blocks} blocks"),
        ));
    }
    Ok(())
}
