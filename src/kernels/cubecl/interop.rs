// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Candle ↔ `CubeCL` buffer conversion utilities.
//!
//! The `CubeCL` kernels compute in f32. Inputs are widened on the way in:
//! f16/bf16 tensors through Candle, fp8 caches (`U8` tensors) through the
//! e4m3 decoder, unscaled. Index buffers travel as little-endian `u32`.
//!
//! ## Key Functions
//!
//! - [`candle_to_cubecl_handle`] - Convert a Candle tensor to f32 bytes
//! - [`cubecl_to_candle_tensor`] - Convert f32 output bytes back to a tensor
//! - [`indices_to_cubecl_bytes`] - Pack validated block tables / lengths
//! - [`has_cubecl_cuda_support`] - Check if CUDA runtime is available

use candle_core::{DType, Device, Tensor};

use crate::error::{PagedAttnError, Result};
use crate::kernels::convert::Fp8E4M3;

/// Check if `CubeCL` CUDA runtime support is available.
///
/// This checks:
/// 1. The `cuda` feature is enabled at compile time
/// 2. A CUDA-capable device is detected at runtime
///
/// # Example
///
/// ```rust
/// use paged_attn_rs::kernels::cubecl::has_cubecl_cuda_support;
///
/// if has_cubecl_cuda_support() {
///     println!("CubeCL CUDA acceleration available!");
/// } else {
///     println!("Using the host workgroup emulation");
/// }
/// ```
#[must_use]
pub fn has_cubecl_cuda_support() -> bool {
    #[cfg(feature = "cuda")]
    {
        matches!(Device::cuda_if_available(0), Ok(Device::Cuda(_)))
    }

    #[cfg(not(feature = "cuda"))]
    {
        false
    }
}

/// Convert a Candle tensor to f32 bytes for `client.create(bytes)`.
///
/// `U8` tensors are decoded as fp8 e4m3 without scaling.
///
/// # Errors
///
/// Returns error if:
/// - Tensor is not on a CUDA device
/// - Tensor dtype is not one of f32, f16, bf16 or u8
pub fn candle_to_cubecl_handle(tensor: &Tensor) -> Result<(Vec<u8>, Vec<usize>)> {
    if !matches!(tensor.device(), Device::Cuda(_)) {
        return Err(PagedAttnError::Kernel(
            "candle_to_cubecl_handle requires CUDA tensor".to_string(),
        ));
    }
    let shape = tensor.dims().to_vec();
    let data = tensor_to_f32(tensor)?;
    Ok((f32_to_cubecl_bytes(&data), shape))
}

/// Widen a tensor to host f32 values.
///
/// # Errors
///
/// Returns [`PagedAttnError::DTypeMismatch`] for unsupported dtypes.
pub fn tensor_to_f32(tensor: &Tensor) -> Result<Vec<f32>> {
    let flat = tensor.flatten_all()?;
    match tensor.dtype() {
        DType::F32 => Ok(flat.to_vec1::<f32>()?),
        DType::F16 | DType::BF16 => Ok(flat.to_dtype(DType::F32)?.to_vec1::<f32>()?),
        DType::U8 => Ok(flat
            .to_vec1::<u8>()?
            .into_iter()
            .map(|bits| Fp8E4M3::from_bits(bits).to_f32())
            .collect()),
        other => Err(PagedAttnError::DTypeMismatch {
            name: "cubecl input",
            expected: "f32, f16, bf16 or u8 (fp8)",
            actual: other,
        }),
    }
}

/// Little-endian bytes of f32 values.
#[must_use]
pub fn f32_to_cubecl_bytes(data: &[f32]) -> Vec<u8> {
    data.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Little-endian `u32` bytes of non-negative `i32` indices.
///
/// Callers pass block tables and context lengths after launch validation,
/// which rejects negative values; any that remain map to 0.
#[must_use]
pub fn indices_to_cubecl_bytes(indices: &[i32]) -> Vec<u8> {
    indices
        .iter()
        .flat_map(|&i| u32::try_from(i).unwrap_or(0).to_le_bytes())
        .collect()
}

/// Decode f32 output bytes.
///
/// # Errors
///
/// Returns [`PagedAttnError::Kernel`] if the byte count is not a multiple of 4.
pub fn cubecl_bytes_to_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(PagedAttnError::Kernel(format!(
            "output byte count {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Convert a `CubeCL` f32 buffer back to a Candle tensor.
///
/// # Errors
///
/// Returns error if:
/// - Shape dimensions don't match byte count
/// - Device is not CUDA
pub fn cubecl_to_candle_tensor(bytes: &[u8], shape: &[usize], device: &Device) -> Result<Tensor> {
    if !matches!(device, Device::Cuda(_)) {
        return Err(PagedAttnError::Kernel(
            "cubecl_to_candle_tensor requires CUDA device".to_string(),
        ));
    }

    let num_elements: usize = shape.iter().product();
    if bytes.len() != num_elements * 4 {
        return Err(PagedAttnError::ShapeMismatch {
            name: "cubecl output",
            expected: shape.to_vec(),
            actual: vec![bytes.len() / 4],
        });
    }

    let data = cubecl_bytes_to_f32(bytes)?;
    Ok(Tensor::from_vec(data, shape, device)?)
}
