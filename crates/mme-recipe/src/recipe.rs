//! The generated plan: sub-views, walk order, per-descriptor flags.
//!
//! A recipe is consumed position by position: every [`RecipePosition`]
//! names one width sub-view, one spatial sub-view and one non-spatial
//! (accumulation/batch) sub-view, in descriptor issue order.

use crate::params::{OpType, SizeArray, TensorView, MAX_DIMS};
use crate::plan::ReuseInfo;

/// One step of a single-dim walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleDimSubView {
    /// First element covered.
    pub offset: u64,
    /// Elements covered.
    pub size: u64,
    /// Step carries the short closing unit.
    pub partial: bool,
}

/// One step of the common-dim walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiDimSubView {
    /// Per-dim bases.
    pub bases: SizeArray,
    /// Per-dim extents.
    pub sizes: SizeArray,
    /// GEMM this step belongs to.
    pub gemm: usize,
    /// Step carries the short closing unit.
    pub partial: bool,
    /// Opens an accumulation.
    pub first_in_accum: bool,
    /// Closes an accumulation.
    pub last_in_accum: bool,
}

/// One descriptor position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecipePosition {
    /// Width sub-view index.
    pub fcd: usize,
    /// Spatial sub-view index.
    pub sp: usize,
    /// Non-spatial sub-view index.
    pub non_spatial: usize,
}

/// The complete plan.
#[derive(Debug, Clone)]
pub struct MmeRecipe {
    /// Operation the plan executes.
    pub op: OpType,
    /// Width sweeps inside the spatial walk.
    pub raster: bool,
    /// Lowering folded the first filter dim into the width.
    pub lowered: bool,
    /// Output dims 1 and 2 were merged.
    pub flattened: bool,
    /// Effective-height multiplier from transpose-engine packing.
    pub te_factor: u64,
    /// GEMMs sharing the plan.
    pub gemms_nr: u64,
    /// Planned operand views (lowering/flattening applied).
    pub a: TensorView,
    /// Weight-side view.
    pub b: TensorView,
    /// Output view.
    pub c: TensorView,
    /// Width walk.
    pub fcd_subviews: Vec<SingleDimSubView>,
    /// Spatial walk.
    pub sp_subviews: Vec<SingleDimSubView>,
    /// Common-dim walk.
    pub non_spatial_subviews: Vec<MultiDimSubView>,
    /// Reuse decision behind the plan.
    pub reuse: ReuseInfo,
    /// Partial products per GEMM.
    pub partials_per_gemm: Vec<u64>,
    /// Completion signals each activation raises.
    pub signal_amount: u64,
    /// Per spatial sub-view: the second operand also fits the staging
    /// buffer over that sub-view (2-D reuse). Empty when unsupported.
    pub second_operand_reuse: Vec<bool>,
}

impl MmeRecipe {
    /// Accumulation steps per output tile.
    #[must_use]
    pub fn accumulation_steps(&self) -> u64 {
        self.partials_per_gemm.iter().copied().max().unwrap_or(1)
    }

    /// Whether the accumulation axis runs over the spatial walk (weight
    /// gradient) rather than the common-dim walk.
    #[must_use]
    pub const fn accumulates_spatially(&self) -> bool {
        self.op.is_dedw()
    }

    /// Index on the accumulation axis for a position.
    #[must_use]
    pub const fn accum_idx(&self, pos: &RecipePosition) -> usize {
        if self.accumulates_spatially() {
            pos.sp
        } else {
            pos.non_spatial
        }
    }

    fn accum_bounds(&self, pos: &RecipePosition) -> (bool, bool) {
        if self.accumulates_spatially() {
            let steps = self.accumulation_steps() as usize;
            let i = pos.sp % steps.max(1);
            (i == 0, i + 1 == steps.max(1))
        } else {
            match self.non_spatial_subviews.get(pos.non_spatial) {
                Some(sv) => (sv.first_in_accum, sv.last_in_accum),
                None => (true, true),
            }
        }
    }

    /// Whether the descriptor at `pos` opens an accumulation.
    #[must_use]
    pub fn is_first_partial(&self, pos: &RecipePosition) -> bool {
        self.accum_bounds(pos).0
    }

    /// Whether the descriptor at `pos` closes an accumulation.
    #[must_use]
    pub fn is_last_partial(&self, pos: &RecipePosition) -> bool {
        self.accum_bounds(pos).1
    }

    /// Whether the descriptor writes its result out.
    #[must_use]
    pub fn store_en(&self, pos: &RecipePosition) -> bool {
        self.reuse.kind.to_memory() || self.is_last_partial(pos)
    }

    /// Whether the write is a read-modify-write reduction in memory.
    #[must_use]
    pub fn reduction_en(&self, pos: &RecipePosition) -> bool {
        self.reuse.kind.to_memory() && !self.is_first_partial(pos)
    }

    /// Whether the descriptor adds onto a held accumulator.
    #[must_use]
    pub fn accum_en(&self, pos: &RecipePosition) -> bool {
        !self.reuse.kind.to_memory() && !self.is_first_partial(pos)
    }

    /// Multi-dim coordinates of a spatial offset inside the output.
    #[must_use]
    pub fn calc_sp_pos(&self, sp_offset: u64) -> SizeArray {
        let mut pos = [0; MAX_DIMS];
        let mut rem = sp_offset;
        for d in 1..=self.op.last_spatial_dim() {
            pos[d] = rem % self.c.sizes[d];
            rem /= self.c.sizes[d];
        }
        debug_assert_eq!(rem, 0, "spatial offset outside the output");
        pos
    }

    /// Descriptor positions in issue order.
    #[must_use]
    pub fn positions(&self) -> RecipeIterator {
        RecipeIterator::new(
            self.op.is_dedw(),
            self.raster,
            self.fcd_subviews.len(),
            self.sp_subviews.len(),
            self.non_spatial_subviews.len().max(1),
        )
    }

    /// Total descriptor count.
    #[must_use]
    pub fn descriptors_nr(&self) -> usize {
        self.fcd_subviews.len() * self.sp_subviews.len() * self.non_spatial_subviews.len().max(1)
    }
}

/// Walks descriptor positions in issue order.
///
/// The accumulation axis runs innermost so accumulators roll over before
/// the output tile moves: the common-dim walk for most ops, the spatial
/// walk for the weight gradient. A raster walk sweeps the width inside
/// each spatial step; otherwise the width is outermost.
#[derive(Debug, Clone)]
pub struct RecipeIterator {
    /// Axis lengths outermost-first, each paired with its role.
    axes: [(Axis, usize); 3],
    next: usize,
    total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Fcd,
    Sp,
    NonSpatial,
}

impl RecipeIterator {
    fn new(is_dedw: bool, raster: bool, fcd: usize, sp: usize, non_spatial: usize) -> Self {
        let mut axes = if is_dedw {
            [(Axis::Fcd, fcd), (Axis::NonSpatial, non_spatial), (Axis::Sp, sp)]
        } else {
            [(Axis::Fcd, fcd), (Axis::Sp, sp), (Axis::NonSpatial, non_spatial)]
        };
        if raster && !is_dedw {
            axes.swap(0, 1);
        }
        Self { axes, next: 0, total: fcd * sp * non_spatial }
    }
}

impl Iterator for RecipeIterator {
    type Item = RecipePosition;

    fn next(&mut self) -> Option<RecipePosition> {
        if self.next >= self.total {
            return None;
        }
        let mut rem = self.next;
        self.next += 1;
        let mut pos = RecipePosition { fcd: 0, sp: 0, non_spatial: 0 };
        for &(axis, len) in self.axes.iter().rev() {
            let coord = rem % len.max(1);
            rem /= len.max(1);
            match axis {
                Axis::Fcd => pos.fcd = coord,
                Axis::Sp => pos.sp = coord,
                Axis::NonSpatial => pos.non_spatial = coord,
            }
        }
        Some(pos)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.next;
        (left, Some(left))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterator_visits_every_position_once() {
        let it = RecipeIterator::new(false, false, 3, 2, 4);
        let mut seen: Vec<_> = it.map(|p| (p.fcd, p.sp, p.non_spatial)).collect();
        assert_eq!(seen.len(), 24);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 24);
    }

    #[test]
    fn accumulation_axis_runs_innermost() {
        let first_two: Vec<_> = RecipeIterator::new(false, false, 2, 2, 3).take(2).collect();
        assert_eq!(first_two[0].non_spatial, 0);
        assert_eq!(first_two[1].non_spatial, 1);
        assert_eq!(first_two[1].fcd, 0);

        let dedw: Vec<_> = RecipeIterator::new(true, false, 2, 3, 2).take(2).collect();
        assert_eq!(dedw[0].sp, 0);
        assert_eq!(dedw[1].sp, 1);
        assert_eq!(dedw[1].non_spatial, 0);
    }

    #[test]
    fn raster_sweeps_width_inside_the_spatial_step() {
        let order: Vec<_> = RecipeIterator::new(false, true, 2, 2, 1).collect();
        // spatial is outermost under raster
        assert_eq!(
            order.iter().map(|p| (p.sp, p.fcd)).collect::<Vec<_>>(),
            vec![(0, 0), (0, 1), (1, 0), (1, 1)]
        );
    }
}
