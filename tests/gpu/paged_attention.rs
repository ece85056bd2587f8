// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Paged attention on CUDA devices.
//!
//! The GPU output (`CubeCL` kernels, or the host fallback if they fail) must
//! agree with the host kernels on the same inputs.
//!
//! ## Validation Criteria
//!
//! - **f16**: L2-relative error < 2e-3 vs the host kernels
//! - **fp8 cache**: L2-relative error < 2e-3 vs the host kernels

#![cfg(feature = "cuda")]

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use half::f16;
use paged_attn_rs::kernels::cubecl::{
    candle_to_cubecl_handle, has_cubecl_cuda_support, paged_attention_cubecl, CubePagedArgs,
};
use paged_attn_rs::kernels::{paged_attention, KvLayoutKind, PagedAttentionConfig};
use paged_attn_rs::PagedAttnError;

use crate::helpers::{to_f32_vec, AccuracyMetrics, PagedBatch, PagedScenario};
use crate::require_gpu;

const GPU_TOLERANCE: f32 = 2e-3;

fn run_on(
    device: &Device,
    batch: &PagedBatch<f16>,
    key_cache: &Tensor,
    value_cache: &Tensor,
    config: &PagedAttentionConfig,
) -> Result<Tensor> {
    let inputs = batch.tensors(device)?;
    Ok(paged_attention(
        &inputs.query,
        &key_cache.to_device(device)?,
        &value_cache.to_device(device)?,
        &inputs.block_tables,
        &inputs.context_lens,
        config,
    )?)
}

#[test]
fn test_gpu_matches_host_kernels() -> Result<()> {
    require_gpu!();
    let gpu = Device::new_cuda(0)?;

    for context_lens in [vec![300usize], vec![1, 255, 256, 257], vec![1000, 40]] {
        let batch = PagedScenario::new(8, 2, 128, 16, &context_lens).build::<f16>()?;
        let config = batch.config();
        let (key_cache, value_cache) = batch.cache.to_tensors(&Device::Cpu)?;

        let host = run_on(&Device::Cpu, &batch, &key_cache, &value_cache, &config)?;
        let device_out = run_on(&gpu, &batch, &key_cache, &value_cache, &config)?;
        assert!(device_out.device().same_device(&gpu));
        assert_eq!(device_out.dtype(), DType::F16);

        let metrics = AccuracyMetrics::compare(&to_f32_vec(&device_out)?, &to_f32_vec(&host)?);
        println!("contexts {context_lens:?}: {metrics:?}");
        assert!(metrics.l2_relative < GPU_TOLERANCE, "{metrics:?}");
    }
    Ok(())
}

#[test]
fn test_gpu_fp8_cache_and_alibi() -> Result<()> {
    require_gpu!();
    let gpu = Device::new_cuda(0)?;

    let batch = PagedScenario::new(4, 4, 64, 32, &[600, 12]).build::<f16>()?;
    let fp8 = batch.cache.to_fp8(0.5, 0.25)?;
    let (key_cache, value_cache) = fp8.to_tensors(&Device::Cpu)?;
    let config = batch
        .config()
        .for_fp8_cache(0.5, 0.25)
        .with_alibi(vec![0.0, 0.01, 0.02, 0.04]);

    let host = run_on(&Device::Cpu, &batch, &key_cache, &value_cache, &config)?;
    let device_out = run_on(&gpu, &batch, &key_cache, &value_cache, &config)?;
    let metrics = AccuracyMetrics::compare(&to_f32_vec(&device_out)?, &to_f32_vec(&host)?);
    assert!(metrics.l2_relative < GPU_TOLERANCE, "{metrics:?}");
    Ok(())
}

#[test]
fn test_non_paged_layouts_run_on_host_kernels() -> Result<()> {
    require_gpu!();
    let gpu = Device::new_cuda(0)?;

    let batch = PagedScenario::new(4, 2, 64, 16, &[40, 300]).build::<f16>()?;
    let (key_cache, value_cache) = batch.cache.to_tensors(&Device::Cpu)?;
    let host = run_on(&Device::Cpu, &batch, &key_cache, &value_cache, &batch.config())?;

    for kind in [KvLayoutKind::PagedAsm, KvLayoutKind::Flash] {
        let (key_cache, value_cache) = crate::relayout(&batch.cache, kind)?;
        let config = batch.config().with_kv_layout(kind);
        let device_out = run_on(&gpu, &batch, &key_cache, &value_cache, &config)?;
        assert!(device_out.device().same_device(&gpu));
        assert_eq!(to_f32_vec(&device_out)?, to_f32_vec(&host)?, "{kind:?}");
    }

    if has_cubecl_cuda_support() {
        let inputs = batch.tensors(&gpu)?;
        let (key_cache, value_cache) = crate::relayout(&batch.cache, KvLayoutKind::Flash)?;
        let config = batch.config().with_kv_layout(KvLayoutKind::Flash);
        let max_blocks_per_seq = batch.block_tables.iter().map(Vec::len).max().unwrap_or(0);
        let tables: Vec<i32> = batch
            .block_tables
            .iter()
            .flat_map(|row| (0..max_blocks_per_seq).map(|i| row.get(i).map_or(0, |&b| b as i32)))
            .collect();
        let args = CubePagedArgs {
            query: &inputs.query,
            key_cache: &key_cache.to_device(&gpu)?,
            value_cache: &value_cache.to_device(&gpu)?,
            block_tables: &tables,
            context_lens: &[40, 300],
            max_blocks_per_seq,
            layout: batch.cache.layout().with_kind(KvLayoutKind::Flash),
            config: &config,
        };
        assert!(matches!(
            paged_attention_cubecl(&args),
            Err(PagedAttnError::UnsupportedConfig(_))
        ));
    }
    Ok(())
}

#[test]
fn test_cubecl_handle_from_device_tensor() -> Result<()> {
    require_gpu!();
    if !has_cubecl_cuda_support() {
        eprintln!("SKIP: CubeCL CUDA runtime not available");
        return Ok(());
    }
    let gpu = Device::new_cuda(0)?;
    let tensor = Tensor::arange(0f32, 12.0, &gpu)?.reshape((3, 4))?;
    let (bytes, shape) = candle_to_cubecl_handle(&tensor)?;
    assert_eq!(shape, vec![3, 4]);
    assert_eq!(bytes.len(), 12 * 4);
    Ok(())
}
