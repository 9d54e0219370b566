//! Staging-buffer reuse planning.
//!
//! One input operand can be parked in the staging buffer (SB) and replayed
//! against successive tiles of the other. [`SbReuse`] answers three
//! questions: how many contracted elements the SB holds at once (the
//! span), how many one full accumulation needs, and, when the second
//! exceeds the first, how to cut the common dims into accumulation steps.

use mme_hal::MmeHal;
use tracing::debug;

use crate::geometry::GeoAttr;
use crate::grid::{GridRole, ReductionParams, ReuseKind};
use crate::params::{LayerParams, Operand, SizeArray, MAX_DIMS};

/// Whether `which` starts and strides on memory cache-line boundaries.
/// Misaligned reuse wastes half of every fetched line.
#[must_use]
pub fn is_input_aligned(params: &LayerParams, hal: &MmeHal, which: Operand) -> bool {
    let view = params.operand(which);
    let elem = view.dtype.size_bytes();
    let base: u64 = (0..MAX_DIMS).map(|d| view.bases[d] * view.strides[d]).sum();
    base * elem % hal.memory_cl_bytes == 0 && view.strides[1] * elem % hal.memory_cl_bytes == 0
}

/// Reuse capacities of one operand choice.
#[derive(Debug, Clone)]
pub struct SbReuse<'p> {
    params: &'p LayerParams,
    geo: &'p GeoAttr,
    hal: &'p MmeHal,
    reuse_operand: Operand,
    /// SB capacity per port, in elements, utilization applied.
    sb_size: u64,
    /// Contracted elements held at once.
    sb_span: u64,
    /// Contracted elements one full accumulation needs.
    sb_cd_size: u64,
}

impl<'p> SbReuse<'p> {
    /// Size up reuse of `reuse_operand`. `full_utilization` is false when
    /// the operand is misaligned to the memory cache line.
    #[must_use]
    pub fn new(
        params: &'p LayerParams,
        geo: &'p GeoAttr,
        hal: &'p MmeHal,
        reuse_operand: Operand,
        full_utilization: bool,
    ) -> Self {
        debug_assert!(reuse_operand != Operand::C);
        let dt = params.operand(reuse_operand).dtype;
        let mut sb_size = hal.sb_elems_per_port(dt);
        if !full_utilization {
            sb_size /= 2;
        }
        let mut reuse = Self {
            params,
            geo,
            hal,
            reuse_operand,
            sb_size,
            sb_span: 0,
            sb_cd_size: 0,
        };
        reuse.sb_span = reuse.calc_span();
        reuse.sb_cd_size = reuse.calc_cd_size();
        debug!(
            operand = ?reuse_operand,
            span = reuse.sb_span,
            cd = reuse.sb_cd_size,
            "sized staging-buffer reuse"
        );
        reuse
    }

    /// Contracted elements the SB holds at once. Each concurrent batch
    /// slice claims its own rows of the same buffer; ports collaborating
    /// on the contracted dim stack their spans.
    fn calc_span(&self) -> u64 {
        let dt = self.params.operand(self.reuse_operand).dtype;
        let eu_facing = self.hal.input_port_elems(dt);
        let port_repeats = if self.geo.is_operand_broadcast(self.params, self.reuse_operand) {
            1
        } else {
            self.geo.geometry_batch_concurrency()
        };
        let mut span = self.sb_size / (eu_facing * port_repeats);
        if !self.params.is_transposed(self.reuse_operand) {
            span *= self.geo.cd_collaborating_ports(self.params, self.reuse_operand);
        }
        let align = self.hal.cd_alignment_elems(dt);
        span - span % align
    }

    /// Contracted elements one full accumulation needs, padded the way the
    /// ports actually read them.
    fn calc_cd_size(&self) -> u64 {
        let dt = self.params.operand(self.reuse_operand).dtype;
        let mut cd = self.params.single_gemm_cd();
        if self.params.op.is_dedw() {
            cd = cd.next_multiple_of(self.geo.interleaved_spatial_ports_nr());
        }
        cd = cd.next_multiple_of(self.hal.cd_alignment_elems(dt));
        if self.params.is_transposed(self.reuse_operand) {
            cd = cd.next_multiple_of(self.hal.cl_elems(dt));
        }
        cd * self.params.filters_nr()
    }

    /// Which operand is parked in the SB.
    #[must_use]
    pub const fn reuse_operand(&self) -> Operand {
        self.reuse_operand
    }

    /// Contracted elements held at once.
    #[must_use]
    pub const fn sb_span(&self) -> u64 {
        self.sb_span
    }

    /// Contracted elements one full accumulation needs.
    #[must_use]
    pub const fn sb_cd_size(&self) -> u64 {
        self.sb_cd_size
    }

    /// Whether reuse must accumulate in partial products.
    #[must_use]
    pub const fn is_partial(&self, gemms_nr: u64, cd_cuts: u64) -> bool {
        self.sb_cd_size > self.sb_span || gemms_nr > 1 || cd_cuts > 1
    }

    /// Cut the common dims into accumulation steps.
    ///
    /// `sizes` lists the common-dim extents with the operand's width dim
    /// cleared to 1; `sizes[first_common_dim]` is the per-GEMM contracted
    /// extent. Grows an included-dim prefix while it fits the span, slices
    /// the first common dim when nothing fits.
    #[must_use]
    pub fn plan_common_dim(
        &self,
        sizes: &SizeArray,
        first_common_dim: usize,
        role: GridRole,
        view_size: u64,
        gemms_nr: u64,
        cd_cuts: u64,
        sp_step_capacity: u64,
    ) -> ReductionParams {
        let dt = self.params.operand(self.reuse_operand).dtype;
        // a transposed operand is fetched line by line; its slices must sit
        // on engine cache-line boundaries
        let align = if self.params.is_transposed(self.reuse_operand) {
            self.hal.cl_elems(dt)
        } else {
            self.hal.cd_alignment_elems(dt)
        };
        let first_len = match role {
            GridRole::Spatial => view_size,
            _ => sizes[first_common_dim],
        };
        let base = ReductionParams {
            role,
            kind: ReuseKind::NonPartial,
            sizes: *sizes,
            view_size,
            first_common_dim,
            last_included_dim: first_common_dim,
            atomic_unit: first_len,
            max_fit: 1,
            slice_dim: None,
        };
        if !self.is_partial(gemms_nr, cd_cuts) {
            return base;
        }
        if first_len > self.sb_span {
            // not even the first dim fits; slice it in aligned chunks
            let aligned_first = first_len.next_multiple_of(align);
            let splits = aligned_first.div_ceil(self.sb_span).max(2);
            let mut max_fit = aligned_first.div_ceil(splits * align).max(1);
            while max_fit > 1 && max_fit * align > self.sb_span {
                max_fit -= 1;
            }
            return ReductionParams {
                kind: ReuseKind::PartialNoDim,
                atomic_unit: align,
                max_fit,
                ..base
            };
        }
        let mut last = first_common_dim;
        let mut block = first_len.next_multiple_of(align);
        while last + 1 < MAX_DIMS && block * sizes[last + 1] <= self.sb_span {
            last += 1;
            block *= sizes[last];
        }
        if last == MAX_DIMS - 1 || sizes[last + 1..].iter().all(|&s| s == 1) {
            // the whole extent fits; partials come from the GEMM structure
            return ReductionParams {
                kind: ReuseKind::PartialAllDims,
                last_included_dim: last,
                ..base
            };
        }
        let max_fit = (self.sb_span / block).max(1);
        let to_memory = role != GridRole::Spatial
            && self.partials_to_memory_ok(sizes, last, max_fit, sp_step_capacity);
        ReductionParams {
            kind: ReuseKind::PartialAtLeastOneDim { to_memory },
            last_included_dim: last,
            atomic_unit: 1,
            max_fit,
            ..base
        }
    }

    /// Spilling partials to memory pays off only for a short accumulation
    /// over a deep spatial walk on a port-constrained geometry, and never
    /// into an 8-bit output.
    fn partials_to_memory_ok(
        &self,
        sizes: &SizeArray,
        last_included: usize,
        max_fit: u64,
        sp_step_capacity: u64,
    ) -> bool {
        let split = (last_included + 1).min(MAX_DIMS - 1);
        let partials = sizes[split].div_ceil(max_fit);
        partials <= 3
            && sp_step_capacity >= 8
            && self.geo.is_geometry_port_constrained()
            && !self.params.strategy.partials_to_memory.is_off()
            && !self.params.c.dtype.is_fp8()
    }

    /// Step-capacity caps `(fcd, spatial)` the reuse imposes. Partial
    /// accumulation pins the opposite axis and bounds the reused one by
    /// the accumulators (or the reuse field width when spilling).
    #[must_use]
    pub fn spatial_capacities(&self, partial: bool, to_memory: bool) -> (u64, u64) {
        let acc_cap = if to_memory {
            self.hal.max_sb_reuse_steps
        } else {
            let accums = if self.geo.geometry_concurrency() == 1 {
                // idle batch/cd concurrency frees the second accumulator set
                self.hal.accums_nr * 2
            } else {
                self.hal.accums_nr
            };
            accums.min(self.hal.max_sb_reuse_steps)
        };
        match (self.reuse_operand, partial) {
            (Operand::A, true) => (acc_cap, 1),
            (Operand::A, false) => (self.hal.max_sb_reuse_steps, u64::MAX),
            (_, true) => (1, acc_cap),
            (_, false) => (u64::MAX, self.hal.max_sb_reuse_steps),
        }
    }
}
