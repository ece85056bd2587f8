// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! `CubeCL` GPU kernels for paged attention.
//!
//! The GPU path mirrors the host workgroup kernels with one cube per
//! workgroup and one unit per partition token. It computes in f32 and is
//! compiled only with the `cuda` feature; without it,
//! [`paged_attention_cubecl`] reports the runtime as unavailable and callers
//! use the host kernels.
//!
//! ## Module Structure
//!
//! - [`config`] - Cube counts and shared-memory sizing
//! - [`interop`] - Candle ↔ `CubeCL` buffer conversion utilities
//! - [`kernel`] - QKV and reduction kernels plus the host launcher

pub mod config;
pub mod interop;
pub mod kernel;

pub use config::CubeLaunchConfig;
pub use interop::{
    candle_to_cubecl_handle, cubecl_bytes_to_f32, cubecl_to_candle_tensor, f32_to_cubecl_bytes,
    has_cubecl_cuda_support, indices_to_cubecl_bytes, tensor_to_f32,
};
pub use kernel::{paged_attention_cubecl, CubePagedArgs};
