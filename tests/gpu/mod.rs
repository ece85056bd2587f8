// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! GPU-specific tests for paged-attn-rs.
//!
//! These tests need GPU hardware and the `cuda` feature. They are gated
//! with `cfg(feature = "cuda")` and skip themselves when:
//!
//! 1. The `cuda` feature is not enabled
//! 2. No CUDA-capable GPU is available
//! 3. The CUDA runtime is not properly installed
//!
//! ## Running GPU Tests
//!
//! ```bash
//! cargo test --features cuda --test integration gpu::
//! ```

pub mod paged_attention;

/// Check if a CUDA GPU is available for testing.
///
/// Creates device 0 and runs a small reduction on it.
#[cfg(feature = "cuda")]
pub fn is_gpu_available() -> bool {
    use candle_core::Device;

    match Device::new_cuda(0) {
        Ok(device) => match candle_core::Tensor::ones((2, 2), candle_core::DType::F32, &device)
            .and_then(|t| t.sum_all())
        {
            Ok(_) => {
                tracing::info!("GPU detected and functional: {:?}", device);
                true
            }
            Err(e) => {
                tracing::warn!("GPU detected but tensor operations failed: {}", e);
                false
            }
        },
        Err(e) => {
            tracing::warn!("No CUDA GPU available: {}", e);
            false
        }
    }
}

/// Skip a test if no GPU is available.
///
/// Works with `Result<(), _>` return types by returning `Ok(())`.
#[cfg(feature = "cuda")]
#[macro_export]
macro_rules! require_gpu {
    () => {
        if !crate::gpu::is_gpu_available() {
            eprintln!("SKIP: Test requires CUDA GPU - use 'cargo test --features cuda'");
            return Ok(());
        }
    };
}

/// Fallback when the CUDA feature is not enabled.
#[cfg(not(feature = "cuda"))]
pub fn is_gpu_available() -> bool {
    false
}

/// Fallback macro that skips tests when the CUDA feature is not enabled.
#[cfg(not(feature = "cuda"))]
#[macro_export]
macro_rules! require_gpu {
    () => {
        eprintln!("SKIP: CUDA feature not enabled - use 'cargo test --features cuda'");
        return Ok(());
    };
}

#[test]
fn test_detected_device_runs_attention() -> anyhow::Result<()> {
    use candle_core::Device;
    use half::f16;
    use paged_attn_rs::kernels::paged_attention;

    #[cfg(not(feature = "cuda"))]
    {
        assert!(!is_gpu_available());
        assert!(Device::cuda_if_available(0)?.is_cpu());
    }

    let device = if is_gpu_available() {
        Device::new_cuda(0)?
    } else {
        Device::Cpu
    };
    let batch = crate::helpers::PagedScenario::new(2, 1, 64, 16, &[20]).build::<f16>()?;
    let (key_cache, value_cache) = batch.cache.to_tensors(&device)?;
    let inputs = batch.tensors(&device)?;
    let out = paged_attention(
        &inputs.query,
        &key_cache,
        &value_cache,
        &inputs.block_tables,
        &inputs.context_lens,
        &batch.config(),
    )?;
    assert_eq!(out.device().is_cuda(), is_gpu_available());
    assert_eq!(out.dims(), &[1, 2, 64]);
    Ok(())
}
