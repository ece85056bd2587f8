// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Tensor-level paged attention.
//!
//! [`paged_attention`] validates Candle tensors against the configuration,
//! then runs the `CubeCL` kernels when the query lives on a CUDA device with
//! `CubeCL` support, and the host workgroup kernels otherwise. A failed GPU
//! launch is logged and retried on the host.

use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};

use super::block_table::{validate_block_tables, KvLayoutKind, PagedKvLayout};
use super::config::{KvCacheDtype, PagedAttentionConfig};
use super::convert::{quantize_fp8, Fp8E4M3, OutputScalar};
use super::cubecl::{has_cubecl_cuda_support, paged_attention_cubecl, CubePagedArgs};
use super::dispatch::{paged_attention_launch, Buffer, BufferMut, LaunchParams};
use crate::error::{PagedAttnError, Result};
use crate::memory::PagedAttentionWorkspace;

/// Decode-step attention of each sequence's query against its paged KV cache.
///
/// # Arguments
/// * `query` - `[num_seqs, num_heads, head_size]`, f16 or bf16
/// * `key_cache` - `[num_blocks, num_kv_heads, head_size / x, block_size, x]`
/// * `value_cache` - `[num_blocks, num_kv_heads, head_size, block_size]`
///
///   Other memory orders are read when `config.kv_layout` names them
///   (see [`KvLayoutKind`]); those always run on the host kernels.
/// * `block_tables` - `[num_seqs, max_blocks_per_seq]`, u32 or i64
/// * `context_lens` - `[num_seqs]`, u32 or i64
/// * `config` - Scale, cache format and specialization options
///
/// Caches hold the query dtype for [`KvCacheDtype::Auto`] and raw fp8 e4m3
/// bytes (`u8`) for [`KvCacheDtype::Fp8E4M3`].
///
/// # Returns
/// `[num_seqs, num_heads, head_size]` in the query dtype, or `u8` fp8 e4m3
/// bytes when `config.out_scale` is set.
///
/// # Errors
/// Returns an error before any kernel work if a shape, dtype or scalar
/// argument is invalid or outside the supported specialization set.
///
/// # Example
///
/// ```rust
/// use candle_core::{DType, Device, Tensor};
/// use paged_attn_rs::kernels::{paged_attention, PagedAttentionConfig};
///
/// # fn main() -> paged_attn_rs::Result<()> {
/// let device = Device::Cpu;
/// let query = Tensor::ones((1, 2, 64), DType::F16, &device)?;
/// // One block of 16 tokens for one KV head; x = 8 for f16.
/// let key_cache = Tensor::ones((1, 1, 8, 16, 8), DType::F16, &device)?;
/// let value_cache = Tensor::ones((1, 1, 64, 16), DType::F16, &device)?;
/// let block_tables = Tensor::new(&[[0u32]], &device)?;
/// let context_lens = Tensor::new(&[5u32], &device)?;
///
/// let config = PagedAttentionConfig::new(1, 64).with_max_context_len(16);
/// let out = paged_attention(&query, &key_cache, &value_cache, &block_tables, &context_lens, &config)?;
/// assert_eq!(out.dims(), &[1, 2, 64]);
/// # Ok(())
/// # }
/// ```
pub fn paged_attention(
    query: &Tensor,
    key_cache: &Tensor,
    value_cache: &Tensor,
    block_tables: &Tensor,
    context_lens: &Tensor,
    config: &PagedAttentionConfig,
) -> Result<Tensor> {
    let (num_seqs, num_heads, head_size) = query.dims3()?;
    let compute = query.dtype();
    if !matches!(compute, DType::F16 | DType::BF16) {
        return Err(PagedAttnError::DTypeMismatch {
            name: "query",
            expected: "f16 or bf16",
            actual: compute,
        });
    }
    config.validate(num_heads, head_size)?;

    let (cache_dtype, cache_expected) = match config.kv_cache_dtype {
        KvCacheDtype::Auto => (compute, "the query dtype"),
        KvCacheDtype::Fp8E4M3 => (DType::U8, "u8 (fp8 e4m3)"),
    };
    for (name, cache) in [("key_cache", key_cache), ("value_cache", value_cache)] {
        if cache.dtype() != cache_dtype {
            return Err(PagedAttnError::DTypeMismatch {
                name,
                expected: cache_expected,
                actual: cache.dtype(),
            });
        }
    }

    let num_blocks = key_cache.dims().first().copied().unwrap_or(0);
    let layout = PagedKvLayout::new(
        num_blocks,
        config.num_kv_heads,
        head_size,
        config.block_size,
        cache_dtype.size_in_bytes(),
    )
    .with_kind(config.kv_layout);
    layout.check()?;
    check_shape("key_cache", key_cache, &layout.key_shape())?;
    check_shape("value_cache", value_cache, &layout.value_shape())?;

    let (table_rows, max_blocks_per_seq) = block_tables.dims2()?;
    if table_rows != num_seqs {
        return Err(PagedAttnError::ShapeMismatch {
            name: "block_tables",
            expected: vec![num_seqs, max_blocks_per_seq],
            actual: block_tables.dims().to_vec(),
        });
    }
    if context_lens.dims1()? != num_seqs {
        return Err(PagedAttnError::ShapeMismatch {
            name: "context_lens",
            expected: vec![num_seqs],
            actual: context_lens.dims().to_vec(),
        });
    }
    let tables = index_values(block_tables, "block_tables")?;
    let lens = index_values(context_lens, "context_lens")?;
    if let Some(&len) = lens
        .iter()
        .find(|&&len| usize::try_from(len).is_ok_and(|len| len > config.max_context_len))
    {
        return Err(PagedAttnError::invalid(
            "context_lens",
            format!("{len} tokens exceeds max_context_len {}", config.max_context_len),
        ));
    }
    validate_block_tables(&tables, max_blocks_per_seq, &lens, config.block_size, num_blocks)?;

    if query.device().is_cuda() && has_cubecl_cuda_support() && layout.kind == KvLayoutKind::Paged {
        let args = CubePagedArgs {
            query,
            key_cache,
            value_cache,
            block_tables: &tables,
            context_lens: &lens,
            max_blocks_per_seq,
            layout,
            config,
        };
        match paged_attention_cubecl(&args).and_then(|out| finish_gpu_output(&out, compute, config)) {
            Ok(out) => return Ok(out),
            Err(e) => {
                tracing::warn!("CubeCL paged attention failed: {}, using host kernels", e);
            }
        }
    }

    tracing::trace!(num_seqs, num_heads, head_size, "running host paged attention");
    let query_host = HostBuffer::from_tensor(query)?;
    let key_host = HostBuffer::from_tensor(key_cache)?;
    let value_host = HostBuffer::from_tensor(value_cache)?;

    let mut workspace = PagedAttentionWorkspace::for_launch(
        num_seqs,
        num_heads,
        head_size,
        config.max_context_len,
        compute,
    )?;
    let out_elems = num_seqs * num_heads * head_size;
    let out_dtype = if config.out_scale.is_some() {
        <Fp8E4M3 as OutputScalar>::STORAGE_DTYPE
    } else {
        compute
    };
    let mut out = HostBuffer::zeros(out_dtype, out_elems)?;

    let params = LaunchParams {
        query: query_host.as_buffer(),
        key_cache: key_host.as_buffer(),
        value_cache: value_host.as_buffer(),
        block_tables: &tables,
        context_lens: &lens,
        num_heads,
        head_size,
        max_blocks_per_seq,
        config,
    };
    {
        let mut outputs = workspace.outputs(out.as_buffer_mut());
        paged_attention_launch(&params, &mut outputs)?;
    }

    out.into_tensor(&[num_seqs, num_heads, head_size], query.device())
}

fn check_shape(name: &'static str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        Err(PagedAttnError::ShapeMismatch {
            name,
            expected: expected.to_vec(),
            actual: tensor.dims().to_vec(),
        })
    }
}

/// Read an integer index tensor as `i32`.
fn index_values(tensor: &Tensor, name: &'static str) -> Result<Vec<i32>> {
    let flat = tensor.flatten_all()?;
    let wide: Vec<i64> = match tensor.dtype() {
        DType::U32 => flat.to_vec1::<u32>()?.into_iter().map(i64::from).collect(),
        DType::I64 => flat.to_vec1::<i64>()?,
        other => {
            return Err(PagedAttnError::DTypeMismatch {
                name,
                expected: "u32 or i64",
                actual: other,
            })
        }
    };
    wide.into_iter()
        .map(|v| {
            i32::try_from(v).map_err(|_| PagedAttnError::invalid(name, format!("{v} does not fit in i32")))
        })
        .collect()
}

/// Convert the f32 `CubeCL` output to the configured output format.
fn finish_gpu_output(out: &Tensor, compute: DType, config: &PagedAttentionConfig) -> Result<Tensor> {
    match config.out_scale {
        Some(scale) => {
            let bytes: Vec<u8> = out
                .flatten_all()?
                .to_vec1::<f32>()?
                .into_iter()
                .map(|v| quantize_fp8(v, scale).to_bits())
                .collect();
            Ok(Tensor::from_vec(bytes, out.dims(), out.device())?)
        }
        None => Ok(out.to_dtype(compute)?),
    }
}

/// Host copy of a tensor in one of the launch element types.
enum HostBuffer {
    F16(Vec<f16>),
    Bf16(Vec<bf16>),
    Fp8(Vec<Fp8E4M3>),
}

impl HostBuffer {
    fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let flat = tensor.flatten_all()?;
        match tensor.dtype() {
            DType::F16 => Ok(Self::F16(flat.to_vec1()?)),
            DType::BF16 => Ok(Self::Bf16(flat.to_vec1()?)),
            DType::U8 => Ok(Self::Fp8(
                flat.to_vec1::<u8>()?.into_iter().map(Fp8E4M3::from_bits).collect(),
            )),
            other => Err(PagedAttnError::DTypeMismatch {
                name: "tensor",
                expected: "f16, bf16 or u8 (fp8)",
                actual: other,
            }),
        }
    }

    fn zeros(dtype: DType, len: usize) -> Result<Self> {
        match dtype {
            DType::F16 => Ok(Self::F16(vec![f16::ZERO; len])),
            DType::BF16 => Ok(Self::Bf16(vec![bf16::ZERO; len])),
            DType::U8 => Ok(Self::Fp8(vec![Fp8E4M3::default(); len])),
            other => Err(PagedAttnError::DTypeMismatch {
                name: "out",
                expected: "f16, bf16 or u8 (fp8)",
                actual: other,
            }),
        }
    }

    fn as_buffer(&self) -> Buffer<'_> {
        match self {
            Self::F16(v) => Buffer::F16(v),
            Self::Bf16(v) => Buffer::Bf16(v),
            Self::Fp8(v) => Buffer::Fp8(v),
        }
    }

    fn as_buffer_mut(&mut self) -> BufferMut<'_> {
        match self {
            Self::F16(v) => BufferMut::F16(v),
            Self::Bf16(v) => BufferMut::Bf16(v),
            Self::Fp8(v) => BufferMut::Fp8(v),
        }
    }

    fn into_tensor(self, shape: &[usize], device: &Device) -> Result<Tensor> {
        let tensor = match self {
            Self::F16(v) => Tensor::from_vec(v, shape, device)?,
            Self::Bf16(v) => Tensor::from_vec(v, shape, device)?,
            Self::Fp8(v) => {
                let bytes: Vec<u8> = v.into_iter().map(Fp8E4M3::to_bits).collect();
                Tensor::from_vec(bytes, shape, device)?
            }
        };
        Ok(tensor)
    }
}
