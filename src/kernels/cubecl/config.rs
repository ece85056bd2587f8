// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Launch configuration for the paged-attention `CubeCL` kernels.
//!
//! Both kernels run one cube per workgroup with one unit per partition token.

use crate::kernels::workgroup::NUM_THREADS;

/// Cube shapes of the two paged-attention stages.
///
/// # Example
///
/// ```rust
/// use paged_attn_rs::kernels::cubecl::CubeLaunchConfig;
///
/// let config = CubeLaunchConfig::default();
/// assert_eq!(config.qkv_cube_count(2, 3, 4), (2, 3, 4));
/// assert_eq!(config.reduce_cube_count(32, 2), (32, 2, 1));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct CubeLaunchConfig {
    /// Units per cube; one per token of a partition.
    pub units_per_cube: u32,
}

impl Default for CubeLaunchConfig {
    fn default() -> Self {
        Self {
            units_per_cube: NUM_THREADS as u32,
        }
    }
}

impl CubeLaunchConfig {
    /// QKV stage: `(num_seqs, max_num_partitions, num_kv_heads)`.
    #[must_use]
    pub const fn qkv_cube_count(
        &self,
        num_seqs: u32,
        max_num_partitions: u32,
        num_kv_heads: u32,
    ) -> (u32, u32, u32) {
        (num_seqs, max_num_partitions, num_kv_heads)
    }

    /// Reduction stage: `(num_heads, num_seqs)`.
    #[must_use]
    pub const fn reduce_cube_count(&self, num_heads: u32, num_seqs: u32) -> (u32, u32, u32) {
        (num_heads, num_seqs, 1)
    }
}
