//! Error types for plan generation.
//!
//! Only caller input is reported through [`RecipeError`]; violations of
//! internal pipeline invariants are programming errors and assert instead.

use mme_hal::DataType;

use crate::params::OpType;

/// Errors a caller can provoke with invalid layer parameters.
#[derive(Debug, thiserror::Error)]
pub enum RecipeError {
    /// An operand view has a zero-sized dimension that padding cannot fix.
    #[error("operand {operand} has zero size on dim {dim}")]
    EmptyView {
        /// Operand name (`a`, `b` or `c`).
        operand: &'static str,
        /// Offending dimension index.
        dim: usize,
    },

    /// Operand shapes disagree on a shared extent.
    #[error("shape mismatch: {detail} ({left} vs {right})")]
    ShapeMismatch {
        /// Which extent disagrees.
        detail: &'static str,
        /// Extent seen on the first operand.
        left: u64,
        /// Extent seen on the second operand.
        right: u64,
    },

    /// The strategy asks for a feature the operation cannot use.
    #[error("{op:?} does not support {feature}")]
    UnsupportedFeature {
        /// Operation that was requested.
        op: OpType,
        /// Feature the strategy enabled.
        feature: &'static str,
    },

    /// Masked batch-GEMM was requested without auxiliary operand views.
    #[error("masked batch-GEMM requires auxiliary operand views")]
    MissingAuxViews,

    /// Contracted-dimension concurrency with an 8-bit output cannot be
    /// reduced deterministically.
    #[error("cd concurrency is unavailable for {dtype:?} output")]
    CdConcurrencyDtype {
        /// Output element type.
        dtype: DataType,
    },
}

impl RecipeError {
    /// Shorthand for a zero-sized dimension report.
    #[must_use]
    pub const fn empty_view(operand: &'static str, dim: usize) -> Self {
        Self::EmptyView { operand, dim }
    }

    /// Shorthand for a shared-extent mismatch report.
    #[must_use]
    pub const fn shape_mismatch(detail: &'static str, left: u64, right: u64) -> Self {
        Self::ShapeMismatch { detail, left, right }
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, RecipeError>;
