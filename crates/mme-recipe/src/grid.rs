//! Work-partition grids.
//!
//! A grid is a template of steps: `first_steps` carrying one unit count,
//! then `last_steps` carrying a count smaller by at most one, repeated
//! `repeats` times. Units are `atomic_unit` elements, except the partial
//! unit closing an unevenly divided extent.
//!
//! [`BalancedGrid`] partitions an output extent (width, spatial rows,
//! filter positions). [`ReductionGrid`] partitions the contracted extent
//! into accumulation steps.

use crate::params::{SizeArray, MAX_DIMS};

/// Shared step template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GridCore {
    first_steps: u64,
    units_per_first: u64,
    last_steps: u64,
    units_per_last: u64,
    repeats: u64,
    atomic_unit: u64,
    /// Elements in the closing unit; 0 when the extent divides evenly.
    partial_unit: u64,
}

impl GridCore {
    fn single_step(len: u64) -> Self {
        Self {
            first_steps: 1,
            units_per_first: 1,
            last_steps: 0,
            units_per_last: 0,
            repeats: 1,
            atomic_unit: len,
            partial_unit: 0,
        }
    }

    /// Spread `total` units over `grid` steps so step sizes differ by at
    /// most one unit, larger steps first. With an even split half the
    /// steps are declared "first" to keep the template shape.
    fn distributed(total: u64, grid: u64, atomic_unit: u64, partial_unit: u64) -> Self {
        debug_assert!(grid >= 1 && grid <= total);
        let base = total / grid;
        let rem = total % grid;
        let (first_steps, units_per_first) = if rem != 0 {
            (rem, base + 1)
        } else if grid == 1 {
            (1, base)
        } else {
            (grid / 2, base)
        };
        Self {
            first_steps,
            units_per_first,
            last_steps: grid - first_steps,
            units_per_last: base,
            repeats: 1,
            atomic_unit,
            partial_unit,
        }
    }

    const fn steps_per_template(&self) -> u64 {
        self.first_steps + self.last_steps
    }

    const fn grid_size(&self) -> u64 {
        self.steps_per_template() * self.repeats
    }

    const fn total_units(&self) -> u64 {
        self.first_steps * self.units_per_first + self.last_steps * self.units_per_last
    }

    /// Units carried by step `idx` (position within its template).
    fn step_units(&self, idx: u64) -> u64 {
        let t = idx % self.steps_per_template();
        if t < self.first_steps {
            self.units_per_first
        } else {
            self.units_per_last
        }
    }

    /// First unit covered by step `idx` within its template.
    fn step_start_unit(&self, idx: u64) -> u64 {
        let t = idx % self.steps_per_template();
        if t < self.first_steps {
            t * self.units_per_first
        } else {
            self.first_steps * self.units_per_first + (t - self.first_steps) * self.units_per_last
        }
    }

    const fn is_last_in_template(&self, idx: u64) -> bool {
        idx % self.steps_per_template() == self.steps_per_template() - 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GridKind {
    Default,
    /// The extent is spatial rows of repeated filter positions; every
    /// filter position ends with the same partial row chunk.
    Conv { geo_at_first_dim: u64, partial_at_start: bool },
}

/// Balanced partition of one output extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalancedGrid {
    core: GridCore,
    kind: GridKind,
    view_size: u64,
}

impl BalancedGrid {
    /// Partition `view_size` elements into steps of at most `max_step`
    /// elements, each descriptor covering up to `capacity` steps.
    #[must_use]
    pub fn create_default(view_size: u64, max_step: u64, capacity: u64) -> Self {
        debug_assert!(view_size > 0 && max_step > 0 && capacity > 0);
        let atomic = max_step;
        let total_units = view_size.div_ceil(atomic);
        let grid = view_size
            .div_ceil(max_step.saturating_mul(capacity))
            .clamp(1, total_units);
        Self {
            core: GridCore::distributed(total_units, grid, atomic, view_size % atomic),
            kind: GridKind::Default,
            view_size,
        }
    }

    /// Partition a convolution extent of `view_size` rows laid out as
    /// filter positions of `first_dim_len` rows each. Units are geometry
    /// heights; a step grows across whole filter positions while
    /// `capacity` allows.
    #[must_use]
    pub fn create_for_conv(
        view_size: u64,
        first_dim_len: u64,
        geo_height: u64,
        capacity: u64,
        partial_at_start: bool,
    ) -> Self {
        debug_assert!(first_dim_len > 0 && view_size % first_dim_len == 0);
        let filters = view_size / first_dim_len;
        let geo_at_first_dim = first_dim_len.div_ceil(geo_height);
        let total_units = geo_at_first_dim * filters;
        let grid = if capacity < geo_at_first_dim {
            geo_at_first_dim.div_ceil(capacity) * filters
        } else {
            let filters_per_step = (capacity / geo_at_first_dim).min(filters).max(1);
            filters.div_ceil(filters_per_step)
        };
        Self {
            core: GridCore::distributed(
                total_units,
                grid.clamp(1, total_units),
                geo_height,
                first_dim_len % geo_height,
            ),
            kind: GridKind::Conv { geo_at_first_dim, partial_at_start },
            view_size,
        }
    }

    /// Number of steps.
    #[must_use]
    pub const fn grid_size(&self) -> u64 {
        self.core.grid_size()
    }

    /// Total extent covered.
    #[must_use]
    pub const fn view_size(&self) -> u64 {
        self.view_size
    }

    /// Largest step minus smallest step, in units.
    #[must_use]
    pub const fn unit_imbalance(&self) -> u64 {
        if self.core.last_steps == 0 {
            0
        } else {
            self.core.units_per_first - self.core.units_per_last
        }
    }

    /// Partial-unit positions inside the unit range of step `idx`.
    fn partial_units_in(&self, idx: u64) -> u64 {
        if self.core.partial_unit == 0 {
            return 0;
        }
        let start = self.core.step_start_unit(idx);
        let end = start + self.core.step_units(idx);
        match self.kind {
            GridKind::Default => u64::from(end == self.core.total_units()),
            GridKind::Conv { geo_at_first_dim, partial_at_start } => {
                // one partial chunk per filter position
                let phase = if partial_at_start { 0 } else { geo_at_first_dim - 1 };
                (start..end).filter(|p| p % geo_at_first_dim == phase).count() as u64
            }
        }
    }

    /// Elements covered by step `idx`.
    #[must_use]
    pub fn step_size(&self, idx: u64) -> u64 {
        debug_assert!(idx < self.grid_size());
        let units = self.core.step_units(idx);
        let size = units * self.core.atomic_unit;
        size - self.partial_units_in(idx) * (self.core.atomic_unit - self.core.partial_unit)
    }

    /// Whether step `idx` contains a partial unit.
    #[must_use]
    pub fn is_partial_step(&self, idx: u64) -> bool {
        self.partial_units_in(idx) > 0
    }

    /// Re-spread the same units over `new_size` steps (capped at one unit
    /// per step). Coverage never changes.
    pub fn extend(&mut self, new_size: u64) {
        assert_eq!(self.core.repeats, 1, "cannot extend a repeated grid");
        let total = self.core.total_units();
        let grid = new_size.clamp(1, total);
        self.core = GridCore::distributed(total, grid, self.core.atomic_unit, self.core.partial_unit);
    }
}

/// How the contracted extent may be held in the staging buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseKind {
    /// No staging-buffer reuse.
    None,
    /// The whole contracted extent fits; reuse without partials.
    NonPartial,
    /// Every common dim fits, yet accumulation still splits (several GEMMs
    /// or contracted-dim cuts).
    PartialAllDims,
    /// A prefix of the common dims fits whole; accumulate block by block.
    PartialAtLeastOneDim {
        /// Spill intermediate partials to memory instead of accumulators.
        to_memory: bool,
    },
    /// Not even the first common dim fits; slice it.
    PartialNoDim,
}

impl ReuseKind {
    /// Whether accumulation splits into partial products.
    #[must_use]
    pub const fn is_partial(&self) -> bool {
        matches!(
            self,
            Self::PartialAllDims | Self::PartialAtLeastOneDim { .. } | Self::PartialNoDim
        )
    }

    /// Whether partial products spill to memory.
    #[must_use]
    pub const fn to_memory(&self) -> bool {
        matches!(self, Self::PartialAtLeastOneDim { to_memory: true })
    }
}

/// Which reduction the grid partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridRole {
    /// Spatial reduction of the weight gradient.
    Spatial,
    /// Batch walk of a batched GEMM.
    Batch,
    /// Filter walk of a convolution.
    Conv,
}

/// Inputs to [`ReductionGrid::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionParams {
    /// Which reduction is being partitioned.
    pub role: GridRole,
    /// Staging-buffer verdict.
    pub kind: ReuseKind,
    /// Common-dim extents, the operand's width dim already cleared to 1.
    pub sizes: SizeArray,
    /// Total reduction length (`Spatial` role only).
    pub view_size: u64,
    /// Lowest common dim.
    pub first_common_dim: usize,
    /// Highest dim covered inside one template.
    pub last_included_dim: usize,
    /// Elements per unit on the split dim.
    pub atomic_unit: u64,
    /// Units one step may carry.
    pub max_fit: u64,
    /// Forced split dim for batch slicing without partials.
    pub slice_dim: Option<usize>,
}

/// Partition of a contracted extent into accumulation steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionGrid {
    core: GridCore,
    role: GridRole,
    kind: ReuseKind,
    sizes: SizeArray,
    split_dim: usize,
    first_common_dim: usize,
}

impl ReductionGrid {
    /// Build the grid for one accumulation set.
    #[must_use]
    pub fn create(p: &ReductionParams) -> Self {
        let included: u64 = p.sizes[p.first_common_dim..=p.last_included_dim].iter().product();
        let core = match p.kind {
            ReuseKind::PartialAtLeastOneDim { .. } => {
                assert_eq!(p.atomic_unit, 1, "split-dim units are whole included blocks");
                // dims up to last_included_dim sit whole inside one unit;
                // the split advances on the next dim up
                let split = (p.last_included_dim + 1).min(MAX_DIMS - 1);
                let units = p.sizes[split];
                let first_steps = units / p.max_fit;
                let rem = units % p.max_fit;
                if first_steps == 0 {
                    GridCore::single_step(units)
                } else {
                    GridCore {
                        first_steps,
                        units_per_first: p.max_fit,
                        last_steps: u64::from(rem != 0),
                        units_per_last: rem,
                        repeats: 1,
                        atomic_unit: 1,
                        partial_unit: 0,
                    }
                }
            }
            ReuseKind::PartialNoDim => {
                let first_len = match p.role {
                    GridRole::Spatial => p.view_size,
                    _ => p.sizes[p.first_common_dim],
                };
                let per_step = p.atomic_unit * p.max_fit;
                let total_steps = first_len.div_ceil(per_step);
                assert!(total_steps >= 2, "a no-dim split must actually split");
                let total_units = first_len.div_ceil(p.atomic_unit);
                GridCore {
                    first_steps: total_steps - 1,
                    units_per_first: p.max_fit,
                    last_steps: 1,
                    units_per_last: total_units - p.max_fit * (total_steps - 1),
                    repeats: 1,
                    atomic_unit: p.atomic_unit,
                    partial_unit: first_len % p.atomic_unit,
                }
            }
            ReuseKind::None | ReuseKind::NonPartial | ReuseKind::PartialAllDims => {
                let len = match p.role {
                    GridRole::Spatial => p.view_size,
                    _ => included,
                };
                GridCore::single_step(len)
            }
        };
        let split_dim = p.slice_dim.unwrap_or(match p.kind {
            ReuseKind::PartialNoDim => p.first_common_dim,
            ReuseKind::PartialAtLeastOneDim { .. } => (p.last_included_dim + 1).min(MAX_DIMS - 1),
            _ => p.last_included_dim,
        });
        let mut grid = Self {
            core,
            role: p.role,
            kind: p.kind,
            sizes: p.sizes,
            split_dim,
            first_common_dim: p.first_common_dim,
        };
        grid.core.repeats = grid.calc_repeats();
        grid
    }

    /// Dims above the split repeat the template once per element.
    fn calc_repeats(&self) -> u64 {
        if self.role == GridRole::Spatial {
            return 1;
        }
        self.sizes[(self.split_dim + 1).max(2).min(MAX_DIMS)..].iter().product()
    }

    /// Total step count, repeats included.
    #[must_use]
    pub const fn grid_size(&self) -> u64 {
        self.core.grid_size()
    }

    /// Steps of one accumulation template.
    #[must_use]
    pub const fn steps_per_template(&self) -> u64 {
        self.core.steps_per_template()
    }

    /// Partial products accumulated per GEMM. A batch walk accumulates
    /// one template per batch position; the conv and spatial reductions
    /// accumulate their entire walk into one output tile.
    #[must_use]
    pub const fn partials_nr(&self) -> u64 {
        if !self.kind.is_partial() {
            return 1;
        }
        match self.role {
            GridRole::Batch => self.steps_per_template(),
            GridRole::Conv | GridRole::Spatial => self.grid_size(),
        }
    }

    /// Whether descriptors step through this grid at all. Batch walks
    /// count any multi-descriptor grid; the others only a split template.
    #[must_use]
    pub const fn is_multi_step(&self) -> bool {
        match self.role {
            GridRole::Batch => self.grid_size() != 1,
            _ => self.steps_per_template() > 1,
        }
    }

    /// Staging-buffer verdict that shaped this grid.
    #[must_use]
    pub const fn kind(&self) -> ReuseKind {
        self.kind
    }

    /// Which reduction the grid partitions.
    #[must_use]
    pub const fn role(&self) -> GridRole {
        self.role
    }

    /// Dim along which steps advance.
    #[must_use]
    pub const fn split_dim(&self) -> usize {
        self.split_dim
    }

    /// Lowest common dim.
    #[must_use]
    pub const fn first_common_dim(&self) -> usize {
        self.first_common_dim
    }

    /// Common-dim extents this grid was built over.
    #[must_use]
    pub const fn sizes(&self) -> &SizeArray {
        &self.sizes
    }

    /// Elements covered by step `idx` along the split dim.
    #[must_use]
    pub fn step_size(&self, idx: u64) -> u64 {
        debug_assert!(idx < self.grid_size());
        let size = self.core.step_units(idx) * self.core.atomic_unit;
        if self.core.partial_unit != 0 && self.core.is_last_in_template(idx) {
            size - (self.core.atomic_unit - self.core.partial_unit)
        } else {
            size
        }
    }

    /// Offset of step `idx` along the split dim, in elements.
    #[must_use]
    pub fn step_offset(&self, idx: u64) -> u64 {
        self.core.step_start_unit(idx) * self.core.atomic_unit
    }

    /// Whether step `idx` closes with the partial unit.
    #[must_use]
    pub fn is_partial_step(&self, idx: u64) -> bool {
        self.core.partial_unit != 0 && self.core.is_last_in_template(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coverage(grid: &BalancedGrid) -> u64 {
        (0..grid.grid_size()).map(|i| grid.step_size(i)).sum()
    }

    #[test]
    fn ten_units_over_three_steps() {
        let mut grid = BalancedGrid::create_default(10, 1, 10);
        grid.extend(3);
        assert_eq!(grid.grid_size(), 3);
        let sizes: Vec<u64> = (0..3).map(|i| grid.step_size(i)).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
    }

    #[test]
    fn coverage_and_balance_over_a_sweep() {
        for view in [1, 7, 63, 64, 65, 1000] {
            for max_step in [1, 16, 64, 500] {
                for cap in [1, 3, 256] {
                    let grid = BalancedGrid::create_default(view, max_step, cap);
                    assert_eq!(coverage(&grid), view, "view={view} step={max_step} cap={cap}");
                    assert!(grid.unit_imbalance() <= 1);
                }
            }
        }
    }

    #[test]
    fn only_the_closing_step_is_partial() {
        let grid = BalancedGrid::create_default(100, 16, 2);
        let partials: Vec<u64> =
            (0..grid.grid_size()).filter(|&i| grid.is_partial_step(i)).collect();
        assert_eq!(partials, vec![grid.grid_size() - 1]);
    }

    #[test]
    fn extend_preserves_coverage_and_is_idempotent() {
        let mut grid = BalancedGrid::create_default(777, 64, 4);
        let before = coverage(&grid);
        grid.extend(5);
        assert_eq!(coverage(&grid), before);
        let snapshot = grid;
        grid.extend(5);
        assert_eq!(grid, snapshot);
    }

    #[test]
    fn extend_caps_at_one_unit_per_step() {
        let mut grid = BalancedGrid::create_default(100, 25, 4);
        grid.extend(100);
        assert_eq!(grid.grid_size(), 4);
        assert_eq!(coverage(&grid), 100);
    }

    #[test]
    fn conv_grid_covers_each_filter_position() {
        // 3 filter positions of 100 rows, geometry height 32
        let grid = BalancedGrid::create_for_conv(300, 100, 32, 2, true);
        assert_eq!(coverage(&grid), 300);
        let partial_chunks: u64 =
            (0..grid.grid_size()).filter(|&i| grid.is_partial_step(i)).count() as u64;
        assert!(partial_chunks >= 1);
    }

    #[test]
    fn conv_partial_polarity_moves_the_short_chunk() {
        let head = BalancedGrid::create_for_conv(100, 100, 32, 1, true);
        let tail = BalancedGrid::create_for_conv(100, 100, 32, 1, false);
        assert_eq!(coverage(&head), 100);
        assert_eq!(coverage(&tail), 100);
        assert!(head.is_partial_step(0));
        assert!(!head.is_partial_step(head.grid_size() - 1));
        assert!(tail.is_partial_step(tail.grid_size() - 1));
        assert!(!tail.is_partial_step(0));
    }

    #[test]
    fn no_dim_split_always_has_two_steps() {
        let p = ReductionParams {
            role: GridRole::Conv,
            kind: ReuseKind::PartialNoDim,
            sizes: [1, 700, 1, 1, 1],
            view_size: 0,
            first_common_dim: 1,
            last_included_dim: 1,
            atomic_unit: 64,
            max_fit: 5,
            slice_dim: None,
        };
        let grid = ReductionGrid::create(&p);
        assert!(grid.steps_per_template() >= 2);
        let covered: u64 = (0..grid.steps_per_template()).map(|i| grid.step_size(i)).sum();
        assert_eq!(covered, 700);
        assert!(grid.is_partial_step(grid.steps_per_template() - 1));
    }

    #[test]
    fn at_least_one_dim_blocks_accumulate_evenly() {
        // dim 1 (the contracted extent) is held whole; dim 2 carries 8
        // filter taps grouped 3 per accumulation step
        let p = ReductionParams {
            role: GridRole::Conv,
            kind: ReuseKind::PartialAtLeastOneDim { to_memory: false },
            sizes: [1, 64, 8, 3, 1],
            view_size: 0,
            first_common_dim: 1,
            last_included_dim: 1,
            atomic_unit: 1,
            max_fit: 3,
            slice_dim: None,
        };
        let grid = ReductionGrid::create(&p);
        assert_eq!(grid.split_dim(), 2);
        assert_eq!(grid.steps_per_template(), 3); // 3+3+2 taps
        // filter dim 3 repeats the template
        assert_eq!(grid.grid_size(), 9);
        // every filter tap feeds the same output tile, so the whole walk
        // is one accumulation
        assert_eq!(grid.partials_nr(), 9);
        let covered: u64 = (0..grid.steps_per_template()).map(|i| grid.step_size(i)).sum();
        assert_eq!(covered, 8);
    }

    #[test]
    fn batch_walk_repeats_over_high_dims() {
        let p = ReductionParams {
            role: GridRole::Batch,
            kind: ReuseKind::None,
            sizes: [1, 1, 6, 4, 2],
            view_size: 0,
            first_common_dim: 2,
            last_included_dim: 2,
            atomic_unit: 6,
            max_fit: 1,
            slice_dim: None,
        };
        let grid = ReductionGrid::create(&p);
        assert_eq!(grid.grid_size(), 8);
        assert!(grid.is_multi_step());
        assert_eq!(grid.partials_nr(), 1);
    }
}
