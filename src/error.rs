// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Error types for paged-attn-rs.

use thiserror::Error;

/// Result type alias for paged-attn-rs operations.
pub type Result<T> = std::result::Result<T, PagedAttnError>;

/// Errors that can occur before or during a paged-attention launch.
///
/// Every variant except [`PagedAttnError::Kernel`] is raised synchronously by
/// argument validation, before any kernel work is issued.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PagedAttnError {
    /// Head size, block size, GQA ratio, partition size or dtype combination
    /// outside the supported specialization set.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfig(String),

    /// Shape mismatch on a named tensor or buffer.
    #[error("shape mismatch for `{name}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Tensor or buffer name
        name: &'static str,
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Dtype mismatch on a named tensor.
    #[error("dtype mismatch for `{name}`: expected {expected}, got {actual:?}")]
    DTypeMismatch {
        /// Tensor name
        name: &'static str,
        /// Accepted dtype(s)
        expected: &'static str,
        /// Actual dtype
        actual: candle_core::DType,
    },

    /// Invalid scalar argument or buffer content.
    #[error("invalid argument `{arg}`: {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it is invalid
        reason: String,
    },

    /// Workspace allocation would exceed the pool limit.
    #[error("out of memory: required {required} bytes, available {available} bytes")]
    OutOfMemory {
        /// Bytes required
        required: usize,
        /// Bytes available
        available: usize,
    },

    /// GPU kernel error.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl PagedAttnError {
    /// Shorthand for [`PagedAttnError::InvalidArgument`].
    pub(crate) fn invalid(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }
}
