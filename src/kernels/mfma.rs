// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Matrix fused-multiply-accumulate instruction shapes.
//!
//! The QKV kernel issues its two products (`Q·Kᵀ` and `P·V`) as sequences of
//! fixed-shape warp instructions `acc[M×N] += A[M×K] · B[K×N]`, where rows are
//! query heads of a KV-head group. Each shape is a strategy type selected at
//! specialization time; both cover any GQA ratio up to 16 by walking row
//! tiles, and differ only in tile shape and therefore in f32 summation order.

use super::config::MfmaVariant;
use super::convert::ComputeScalar;

/// A matrix-accumulate instruction shape.
pub trait MfmaShape: Send + Sync + 'static {
    /// Short name used in logs and dispatch keys.
    const NAME: &'static str;
    /// Configuration value selecting this shape.
    const VARIANT: MfmaVariant;
    /// Rows of `A` and `acc` (query heads).
    const M: usize;
    /// Columns of `B` and `acc`.
    const N: usize;
    /// Reduction depth of one instruction.
    const K: usize;

    /// One instruction on row-major tiles: `acc += a · b`.
    ///
    /// The products of a `K`-chunk are summed in `f32` and then added to the
    /// accumulator, as the hardware does.
    fn mma<T: ComputeScalar>(a: &[T], b: &[T], acc: &mut [f32]) {
        debug_assert_eq!(a.len(), Self::M * Self::K);
        debug_assert_eq!(b.len(), Self::K * Self::N);
        debug_assert_eq!(acc.len(), Self::M * Self::N);
        for m in 0..Self::M {
            for n in 0..Self::N {
                let chunk: f32 = (0..Self::K)
                    .map(|k| a[m * Self::K + k].to_f32() * b[k * Self::N + n].to_f32())
                    .sum();
                acc[m * Self::N + n] += chunk;
            }
        }
    }
}

/// 4×4×4 instruction shape.
#[derive(Debug, Clone, Copy)]
pub struct Mfma4x4;

impl MfmaShape for Mfma4x4 {
    const NAME: &'static str = "mfma4x4";
    const VARIANT: MfmaVariant = MfmaVariant::Mfma4x4;
    const M: usize = 4;
    const N: usize = 4;
    const K: usize = 4;
}

/// 16×16×16 instruction shape.
#[derive(Debug, Clone, Copy)]
pub struct Mfma16x16;

impl MfmaShape for Mfma16x16 {
    const NAME: &'static str = "mfma16x16";
    const VARIANT: MfmaVariant = MfmaVariant::Mfma16x16;
    const M: usize = 16;
    const N: usize = 16;
    const K: usize = 16;
}

/// Compute `rows × cols` results of `A[rows×depth] · B[depth×cols]` as a grid
/// of `S` instructions.
///
/// Operands are fetched through `a(row, k)` and `b(k, col)`; ragged tile edges
/// are zero-padded. `out(row, col, value)` receives every in-range result once.
pub fn tiled_matmul<S: MfmaShape, T: ComputeScalar>(
    rows: usize,
    cols: usize,
    depth: usize,
    a: impl Fn(usize, usize) -> T,
    b: impl Fn(usize, usize) -> T,
    mut out: impl FnMut(usize, usize, f32),
) {
    let mut a_tile = vec![T::default(); S::M * S::K];
    let mut b_tile = vec![T::default(); S::K * S::N];
    let mut acc = vec![0.0f32; S::M * S::N];

    for row0 in (0..rows).step_by(S::M) {
        for col0 in (0..cols).step_by(S::N) {
            acc.fill(0.0);
            for k0 in (0..depth).step_by(S::K) {
                for m in 0..S::M {
                    for k in 0..S::K {
                        let (row, kk) = (row0 + m, k0 + k);
                        a_tile[m * S::K + k] = if row < rows && kk < depth {
                            a(row, kk)
                        } else {
                            T::default()
                        };
                    }
                }
                for k in 0..S::K {
                    for n in 0..S::N {
                        let (kk, col) = (k0 + k, col0 + n);
                        b_tile[k * S::N + n] = if kk < depth && col < cols {
                            b(kk, col)
                        } else {
                            T::default()
                        };
                    }
                }
                S::mma(&a_tile, &b_tile, &mut acc);
            }
            for m in 0..S::M.min(rows - row0) {
                for n in 0..S::N.min(cols - col0) {
                    out(row0 + m, col0 + n, acc[m * S::N + n]);
                }
            }
        }
    }
}
