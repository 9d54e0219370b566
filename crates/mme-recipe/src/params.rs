//! Layer parameters: operand views, operation type, scheduling strategy.
//!
//! Operand layout convention (dimension 0 is fastest-changing):
//!
//! * output `c`: `[fcd, spatial, batch...]` for GEMM,
//!   `[channels, w, h, d, batch]` for convolution.
//! * `b` non-transposed: `[fcd, cd, filters...]`; transposed swaps 0 and 1.
//! * `a` non-transposed: `[cd, spatial...]`; transposed swaps 0 and 1.

use mme_hal::{DataType, Geometry, MmeHal};

use crate::error::{RecipeError, Result};

/// Highest tensor rank the engine addresses.
pub const MAX_DIMS: usize = 5;

/// Per-dimension extents, bases or strides.
pub type SizeArray = [u64; MAX_DIMS];

/// Operation executed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    /// GEMM, neither operand transposed.
    Ab,
    /// GEMM, `a` transposed.
    Atb,
    /// GEMM, `b` transposed.
    Abt,
    /// GEMM, both transposed.
    Atbt,
    /// Element-wise reduction add through the GEMM path.
    ReductionAdd,
    /// Transpose expressed as a unit-CD GEMM.
    GemmTranspose,
    /// Convolution forward.
    Fwd,
    /// Convolution input gradient.
    Dedx,
    /// Input gradient with a transposed output walk.
    TransposedDedx,
    /// Convolution weight gradient.
    Dedw,
    /// Weight gradient with a deterministic reduction order.
    DeterministicDedw,
    /// Plain copy through the DMA path.
    Memcpy,
    /// Plain transpose through the DMA path.
    Trans,
}

impl OpType {
    /// GEMM-family operations (including the batched forms).
    #[must_use]
    pub const fn is_gemm(self) -> bool {
        matches!(
            self,
            Self::Ab | Self::Atb | Self::Abt | Self::Atbt | Self::ReductionAdd | Self::GemmTranspose
        )
    }

    /// Weight-gradient operations.
    #[must_use]
    pub const fn is_dedw(self) -> bool {
        matches!(self, Self::Dedw | Self::DeterministicDedw)
    }

    /// Convolution-family operations.
    #[must_use]
    pub const fn is_conv(self) -> bool {
        matches!(
            self,
            Self::Fwd | Self::Dedx | Self::TransposedDedx | Self::Dedw | Self::DeterministicDedw
        )
    }

    /// Operations served by the DMA datapath alone.
    #[must_use]
    pub const fn is_native_dma(self) -> bool {
        matches!(self, Self::Memcpy | Self::Trans)
    }

    /// Operations with DMA-like data movement, including the GEMM-shaped
    /// transposes.
    #[must_use]
    pub const fn is_dma_like(self) -> bool {
        self.is_native_dma() || matches!(self, Self::GemmTranspose | Self::TransposedDedx)
    }

    /// Whether operand `a` is read transposed. The weight gradient reads
    /// both inputs along their spatial extents; its transpose is implicit
    /// in the reduction and not a port-level read transpose.
    #[must_use]
    pub const fn transpose_a(self) -> bool {
        matches!(self, Self::Atb | Self::Atbt | Self::Trans)
    }

    /// Whether operand `b` is read transposed.
    #[must_use]
    pub const fn transpose_b(self) -> bool {
        matches!(self, Self::Abt | Self::Atbt | Self::Dedx | Self::TransposedDedx)
    }

    /// Index of the last spatial output dimension; higher dims are batch.
    #[must_use]
    pub const fn last_spatial_dim(self) -> usize {
        if self.is_conv() {
            3
        } else {
            1
        }
    }
}

/// Operand selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Spatial-side input.
    A,
    /// Weight-side input.
    B,
    /// Output.
    C,
}

/// Output walk order. Letters name the loops outermost-first:
/// `f` first contracted-free, `c` spatial, `k` batch/filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalkPattern {
    /// fcd, spatial, batch.
    Fck,
    /// spatial, fcd, batch.
    Cfk,
    /// spatial, batch, fcd.
    Ckf,
    /// batch, spatial, fcd.
    Kcf,
    /// batch, fcd, spatial.
    Kfc,
}

impl WalkPattern {
    /// Raster walks sweep the output width before moving down.
    #[must_use]
    pub const fn is_raster(self) -> bool {
        matches!(self, Self::Cfk | Self::Fck)
    }
}

/// Three-state strategy switch. `Undefined` lets the planner choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Toggle {
    /// Planner decides.
    #[default]
    Undefined,
    /// Forced on.
    On,
    /// Forced off.
    Off,
}

impl Toggle {
    /// Explicitly enabled.
    #[must_use]
    pub const fn is_on(self) -> bool {
        matches!(self, Self::On)
    }

    /// Explicitly disabled.
    #[must_use]
    pub const fn is_off(self) -> bool {
        matches!(self, Self::Off)
    }
}

/// One operand's layout in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorView {
    /// Extent per dimension; unused dims hold 1.
    pub sizes: SizeArray,
    /// Stride per dimension, in elements.
    pub strides: SizeArray,
    /// Base offset per dimension, in elements.
    pub bases: SizeArray,
    /// Element type.
    pub dtype: DataType,
}

impl TensorView {
    /// Dense view of `sizes` with zero bases.
    #[must_use]
    pub fn dense(sizes: SizeArray, dtype: DataType) -> Self {
        let mut strides = [1; MAX_DIMS];
        for d in 1..MAX_DIMS {
            strides[d] = strides[d - 1] * sizes[d - 1];
        }
        Self { sizes, strides, bases: [0; MAX_DIMS], dtype }
    }

    /// Product of the extents over `dims`.
    #[must_use]
    pub fn size_over(&self, dims: std::ops::Range<usize>) -> u64 {
        self.sizes[dims].iter().product()
    }

    /// Whether `dim` follows contiguously from the dimension below it.
    #[must_use]
    pub fn is_contiguous_at(&self, dim: usize) -> bool {
        dim > 0 && self.strides[dim] == self.strides[dim - 1] * self.sizes[dim - 1]
    }
}

/// Auxiliary operand views for the second GEMM of a masked batch-GEMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxViews {
    /// Mask-side `a`.
    pub a: TensorView,
    /// Mask-side `b`.
    pub b: TensorView,
}

/// Scheduling strategy knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strategy {
    /// Requested output geometry.
    pub geometry: Geometry,
    /// Requested output walk order.
    pub pattern: WalkPattern,
    /// Cap on participating engines (0 means all).
    pub mme_limit: u64,
    /// Allow staging-buffer reuse.
    pub sb_reuse: bool,
    /// Batch concurrency request.
    pub batch_concurrency: Toggle,
    /// Contracted-dimension concurrency request.
    pub cd_concurrency: Toggle,
    /// Run the masked batch-GEMM pair.
    pub masked_gemm: bool,
    /// Transpose-engine row packing request.
    pub te_acceleration: Toggle,
    /// Allow spilling reduction partials to memory.
    pub partials_to_memory: Toggle,
    /// Fold the first filter dimension into the input width.
    pub lowering: bool,
    /// Merge contiguous output dims 1 and 2.
    pub flattening: bool,
    /// Desired number of independently issuable activations.
    pub pipeline_level: u64,
    /// Completion signals to spread across the plan.
    pub signal_amount: u64,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            geometry: Geometry::FourXw,
            pattern: WalkPattern::Fck,
            mme_limit: 0,
            sb_reuse: true,
            batch_concurrency: Toggle::Undefined,
            cd_concurrency: Toggle::Undefined,
            masked_gemm: false,
            te_acceleration: Toggle::Undefined,
            partials_to_memory: Toggle::Undefined,
            lowering: false,
            flattening: false,
            pipeline_level: 1,
            signal_amount: 1,
        }
    }
}

/// Full description of one layer to plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerParams {
    /// Operation type.
    pub op: OpType,
    /// Spatial-side input view.
    pub a: TensorView,
    /// Weight-side input view.
    pub b: TensorView,
    /// Output view.
    pub c: TensorView,
    /// Second-GEMM views for masked batch-GEMM.
    pub aux: Option<AuxViews>,
    /// Scheduling strategy.
    pub strategy: Strategy,
}

impl LayerParams {
    /// The view of one operand.
    #[must_use]
    pub fn operand(&self, which: Operand) -> &TensorView {
        match which {
            Operand::A => &self.a,
            Operand::B => &self.b,
            Operand::C => &self.c,
        }
    }

    /// Whether `which` is read transposed.
    #[must_use]
    pub fn is_transposed(&self, which: Operand) -> bool {
        match which {
            Operand::A => self.op.transpose_a(),
            Operand::B => self.op.transpose_b(),
            Operand::C => false,
        }
    }

    /// Output width (first contracted-free dimension).
    #[must_use]
    pub fn fcd_size(&self) -> u64 {
        self.c.sizes[0]
    }

    /// Output spatial extent (everything between width and batch).
    #[must_use]
    pub fn spatial_size(&self) -> u64 {
        self.c.size_over(1..self.op.last_spatial_dim() + 1)
    }

    /// Product of the batch dimensions of the output.
    #[must_use]
    pub fn batches_nr(&self) -> u64 {
        self.c.size_over(self.op.last_spatial_dim() + 1..MAX_DIMS)
    }

    /// Input views of one GEMM within the operation; the second masked
    /// GEMM reads the aux pair.
    #[must_use]
    pub fn gemm_views(&self, gemm: u64) -> (&TensorView, &TensorView) {
        match (&self.aux, gemm) {
            (Some(aux), 1..) => (&aux.a, &aux.b),
            _ => (&self.a, &self.b),
        }
    }

    /// Contracted extent of the first GEMM within the operation.
    #[must_use]
    pub fn single_gemm_cd(&self) -> u64 {
        self.single_gemm_cd_of(0)
    }

    /// Contracted extent of one GEMM within the operation.
    #[must_use]
    pub fn single_gemm_cd_of(&self, gemm: u64) -> u64 {
        let (a, b) = self.gemm_views(gemm);
        if self.op.is_native_dma() {
            1
        } else if self.op.is_dedw() {
            a.size_over(1..MAX_DIMS)
        } else if self.op.transpose_b() {
            b.sizes[0]
        } else {
            b.sizes[1]
        }
    }

    /// Filter taps multiplying the contracted extent (FWD/DEDX only).
    #[must_use]
    pub fn filters_nr(&self) -> u64 {
        if matches!(self.op, OpType::Fwd | OpType::Dedx | OpType::TransposedDedx) {
            self.b.size_over(2..MAX_DIMS)
        } else {
            1
        }
    }

    /// Whether the first filter dimension can fold into the input width.
    #[must_use]
    pub fn can_lower(&self) -> bool {
        self.op.is_conv() && self.b.sizes[2] > 1 && self.a.is_contiguous_at(1)
    }

    /// Whether output dims 1 and 2 can merge into one spatial walk.
    #[must_use]
    pub fn can_flatten(&self) -> bool {
        self.op.is_gemm()
            && !self.op.transpose_a()
            && self.c.sizes[2] > 1
            && self.b.sizes[2] == 1
            && self.a.is_contiguous_at(2)
            && self.c.is_contiguous_at(2)
    }

    /// Validate caller input against the profile and the op's constraints.
    ///
    /// # Errors
    ///
    /// Returns a [`RecipeError`] for zero-sized views, disagreeing shared
    /// extents, or strategy switches the operation cannot honour.
    pub fn validate(&self, _hal: &MmeHal) -> Result<()> {
        for (name, view) in [("a", &self.a), ("b", &self.b), ("c", &self.c)] {
            for (dim, &size) in view.sizes.iter().enumerate() {
                if size == 0 {
                    return Err(RecipeError::empty_view(name, dim));
                }
            }
        }
        if self.op.is_gemm() {
            let b_fcd = if self.op.transpose_b() { self.b.sizes[1] } else { self.b.sizes[0] };
            if b_fcd != self.c.sizes[0] {
                return Err(RecipeError::shape_mismatch("b/c width", b_fcd, self.c.sizes[0]));
            }
            let a_cd = if self.op.transpose_a() { self.a.sizes[1] } else { self.a.sizes[0] };
            if a_cd != self.single_gemm_cd() {
                return Err(RecipeError::shape_mismatch(
                    "a/b contracted extent",
                    a_cd,
                    self.single_gemm_cd(),
                ));
            }
        }
        if self.strategy.masked_gemm {
            if !self.op.is_gemm() {
                return Err(RecipeError::UnsupportedFeature { op: self.op, feature: "masked batch-GEMM" });
            }
            let Some(aux) = &self.aux else {
                return Err(RecipeError::MissingAuxViews);
            };
            let b_fcd = if self.op.transpose_b() { aux.b.sizes[1] } else { aux.b.sizes[0] };
            if b_fcd != self.c.sizes[0] {
                return Err(RecipeError::shape_mismatch("aux b/c width", b_fcd, self.c.sizes[0]));
            }
            let a_cd = if self.op.transpose_a() { aux.a.sizes[1] } else { aux.a.sizes[0] };
            if a_cd != self.single_gemm_cd_of(1) {
                return Err(RecipeError::shape_mismatch(
                    "aux a/b contracted extent",
                    a_cd,
                    self.single_gemm_cd_of(1),
                ));
            }
        }
        if self.op.is_dedw() && self.strategy.cd_concurrency.is_on() && self.c.dtype.is_fp8() {
            return Err(RecipeError::CdConcurrencyDtype { dtype: self.c.dtype });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(v: &[u64]) -> SizeArray {
        let mut out = [1; MAX_DIMS];
        out[..v.len()].copy_from_slice(v);
        out
    }

    pub(crate) fn gemm_params(m: u64, k: u64, n: u64) -> LayerParams {
        LayerParams {
            op: OpType::Ab,
            a: TensorView::dense(sizes(&[k, m]), DataType::Bf16),
            b: TensorView::dense(sizes(&[n, k]), DataType::Bf16),
            c: TensorView::dense(sizes(&[n, m]), DataType::Bf16),
            aux: None,
            strategy: Strategy::default(),
        }
    }

    #[test]
    fn gemm_extent_queries() {
        let p = gemm_params(512, 128, 256);
        assert_eq!(p.fcd_size(), 256);
        assert_eq!(p.spatial_size(), 512);
        assert_eq!(p.single_gemm_cd(), 128);
        assert_eq!(p.batches_nr(), 1);
        p.validate(&MmeHal::v2()).unwrap();
    }

    #[test]
    fn mismatched_width_is_rejected() {
        let mut p = gemm_params(64, 32, 48);
        p.b.sizes[0] = 47;
        assert!(matches!(
            p.validate(&MmeHal::v2()),
            Err(RecipeError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn fp8_dedw_cd_concurrency_is_rejected() {
        let mut p = gemm_params(64, 32, 48);
        p.op = OpType::Dedw;
        p.c.dtype = DataType::Fp8_152;
        p.strategy.cd_concurrency = Toggle::On;
        assert!(matches!(
            p.validate(&MmeHal::v2()),
            Err(RecipeError::CdConcurrencyDtype { .. })
        ));
    }

    #[test]
    fn flattening_requires_contiguity() {
        let mut p = gemm_params(64, 32, 48);
        p.a.sizes = sizes(&[32, 64, 4]);
        p.a = TensorView::dense(p.a.sizes, DataType::Bf16);
        p.c.sizes = sizes(&[48, 64, 4]);
        p.c = TensorView::dense(p.c.sizes, DataType::Bf16);
        assert!(p.can_flatten());
        p.c.strides[2] += 8;
        assert!(!p.can_flatten());
    }
}
