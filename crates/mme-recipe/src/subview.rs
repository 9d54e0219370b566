//! Sub-view materialization: grids to concrete offset/size lists.

use crate::grid::{BalancedGrid, GridRole, ReductionGrid};
use crate::params::{SizeArray, MAX_DIMS};
use crate::plan::{PlanGrids, SpatialPartition};
use crate::recipe::{MultiDimSubView, SingleDimSubView};

/// Odometer over the dims above a reduction split. Dims with a limit of
/// one (or zero) are skipped by the carry.
#[derive(Debug, Clone)]
struct MultiDimCounter {
    limits: SizeArray,
    pos: SizeArray,
    lowest: usize,
}

impl MultiDimCounter {
    fn new(limits: SizeArray, lowest: usize) -> Self {
        Self { limits, pos: [0; MAX_DIMS], lowest }
    }

    /// Advance by one, returning false on wrap-around.
    fn advance(&mut self) -> bool {
        for d in self.lowest..MAX_DIMS {
            if self.limits[d] <= 1 {
                continue;
            }
            self.pos[d] += 1;
            if self.pos[d] < self.limits[d] {
                return true;
            }
            self.pos[d] = 0;
        }
        false
    }
}

/// Materialized walks of one plan.
#[derive(Debug, Clone)]
pub struct SplitSubViews {
    /// Width walk.
    pub fcd: Vec<SingleDimSubView>,
    /// Spatial walk.
    pub sp: Vec<SingleDimSubView>,
    /// Common-dim walk, GEMMs interleaved when masked.
    pub non_spatial: Vec<MultiDimSubView>,
}

fn split_balanced(grid: &BalancedGrid) -> Vec<SingleDimSubView> {
    let mut out = Vec::with_capacity(grid.grid_size() as usize);
    let mut offset = 0;
    for i in 0..grid.grid_size() {
        let size = grid.step_size(i);
        out.push(SingleDimSubView { offset, size, partial: grid.is_partial_step(i) });
        offset += size;
    }
    out
}

fn split_reduction_flat(grid: &ReductionGrid) -> Vec<SingleDimSubView> {
    (0..grid.grid_size())
        .map(|i| SingleDimSubView {
            offset: grid.step_offset(i),
            size: grid.step_size(i),
            partial: grid.is_partial_step(i),
        })
        .collect()
}

/// Walk one reduction grid into multi-dim sub-views.
///
/// A batch walk closes one accumulation per template; a conv reduction
/// feeds every step, repeats included, into the same output tile, so only
/// the very first and very last sub-views bound the accumulation.
fn split_multi(grid: &ReductionGrid, gemm: usize) -> Vec<MultiDimSubView> {
    let split = grid.split_dim();
    let spt = grid.steps_per_template();
    let per_template = grid.role() == GridRole::Batch;
    let total = grid.grid_size();
    let mut counter = MultiDimCounter::new(*grid.sizes(), (split + 1).max(2));
    let mut out = Vec::with_capacity(total as usize);
    let mut emitted = 0;
    loop {
        for step in 0..spt {
            let mut bases = [0; MAX_DIMS];
            let mut sizes = [1; MAX_DIMS];
            for d in 0..split {
                sizes[d] = grid.sizes()[d];
            }
            if spt == 1 {
                // a single template step loops the split dim internally
                sizes[split] = grid.sizes()[split];
            } else {
                bases[split] = grid.step_offset(step);
                sizes[split] = grid.step_size(step);
            }
            for d in (split + 1).max(2)..MAX_DIMS {
                bases[d] = counter.pos[d];
            }
            let (first_in_accum, last_in_accum) = if per_template {
                (step == 0, step + 1 == spt)
            } else {
                (emitted == 0, emitted + 1 == total)
            };
            emitted += 1;
            out.push(MultiDimSubView {
                bases,
                sizes,
                gemm,
                partial: grid.is_partial_step(step),
                first_in_accum,
                last_in_accum,
            });
        }
        if !counter.advance() {
            break;
        }
    }
    out
}

/// Interleave the masked GEMMs per activation so their accumulations
/// alternate on the accumulator pair. The GEMMs may split their contracted
/// extents differently; their activation counts agree because the batch
/// dims come from the shared output.
fn interleave_masked(
    per_gemm: Vec<Vec<MultiDimSubView>>,
    spts: &[usize],
) -> Vec<MultiDimSubView> {
    let activations = per_gemm[0].len() / spts[0].max(1);
    debug_assert!(per_gemm
        .iter()
        .zip(spts)
        .all(|(g, &s)| g.len() / s.max(1) == activations));
    let mut out = Vec::with_capacity(per_gemm.iter().map(Vec::len).sum());
    for act in 0..activations {
        for (g, gemm) in per_gemm.iter().enumerate() {
            let spt = spts[g].max(1);
            out.extend_from_slice(&gemm[act * spt..(act + 1) * spt]);
        }
    }
    out
}

/// Materialize every grid of `grids`.
#[must_use]
pub fn split_sub_views(grids: &PlanGrids) -> SplitSubViews {
    let fcd = split_balanced(&grids.fcd);
    let sp = match &grids.spatial {
        SpatialPartition::Work(g) => split_balanced(g),
        SpatialPartition::Reduction(g) => split_reduction_flat(g),
    };
    let non_spatial = if let Some(conv) = &grids.conv {
        // the weight gradient's filter walk rides the non-spatial axis
        split_balanced(conv)
            .into_iter()
            .map(|sv| MultiDimSubView {
                bases: [sv.offset, 0, 0, 0, 0],
                sizes: [sv.size, 1, 1, 1, 1],
                gemm: 0,
                partial: sv.partial,
                first_in_accum: true,
                last_in_accum: true,
            })
            .collect()
    } else {
        let per_gemm: Vec<Vec<MultiDimSubView>> = grids
            .reductions
            .iter()
            .enumerate()
            .map(|(g, grid)| split_multi(grid, g))
            .collect();
        match per_gemm.len() {
            0 => Vec::new(),
            1 => per_gemm.into_iter().next().unwrap_or_default(),
            _ => {
                let spts: Vec<usize> = grids
                    .reductions
                    .iter()
                    .map(|g| g.steps_per_template() as usize)
                    .collect();
                interleave_masked(per_gemm, &spts)
            }
        }
    };
    SplitSubViews { fcd, sp, non_spatial }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{GridRole, ReductionParams, ReuseKind};

    #[test]
    fn balanced_split_is_contiguous() {
        let grid = BalancedGrid::create_default(1000, 128, 2);
        let views = split_balanced(&grid);
        let mut expect = 0;
        for v in &views {
            assert_eq!(v.offset, expect);
            expect += v.size;
        }
        assert_eq!(expect, 1000);
    }

    #[test]
    fn multi_split_walks_repeats_with_carry() {
        let p = ReductionParams {
            role: GridRole::Conv,
            kind: ReuseKind::PartialAtLeastOneDim { to_memory: false },
            sizes: [1, 64, 5, 2, 3],
            view_size: 0,
            first_common_dim: 1,
            last_included_dim: 1,
            atomic_unit: 1,
            max_fit: 2,
            slice_dim: None,
        };
        let grid = ReductionGrid::create(&p);
        let views = split_multi(&grid, 0);
        assert_eq!(views.len() as u64, grid.grid_size());
        // dim 2 split into 2+2+1 taps; dims 3 and 4 repeat
        assert_eq!(grid.steps_per_template(), 3);
        assert_eq!(views.len(), 3 * 2 * 3);
        // every view keeps the contracted dim whole
        assert!(views.iter().all(|v| v.sizes[1] == 64));
        // the repeat coordinates cover dim3 x dim4 exactly
        let mut coords: Vec<_> = views.iter().map(|v| (v.bases[3], v.bases[4])).collect();
        coords.sort_unstable();
        coords.dedup();
        assert_eq!(coords.len(), 6);
    }

    #[test]
    fn conv_reduction_is_one_accumulation_end_to_end() {
        // a 3x3 filter split 2 taps at a time: every repeat feeds the same
        // output tile, so the walk opens and closes exactly once
        let p = ReductionParams {
            role: GridRole::Conv,
            kind: ReuseKind::PartialAtLeastOneDim { to_memory: false },
            sizes: [1, 1024, 3, 3, 1],
            view_size: 0,
            first_common_dim: 1,
            last_included_dim: 1,
            atomic_unit: 1,
            max_fit: 2,
            slice_dim: None,
        };
        let grid = ReductionGrid::create(&p);
        let views = split_multi(&grid, 0);
        assert_eq!(views.len() as u64, grid.grid_size());
        assert!(views.len() > grid.steps_per_template() as usize);
        let openers = views.iter().filter(|v| v.first_in_accum).count();
        let closers = views.iter().filter(|v| v.last_in_accum).count();
        assert_eq!(openers, 1);
        assert_eq!(closers, 1);
        assert!(views[0].first_in_accum);
        assert!(views[views.len() - 1].last_in_accum);
        assert_eq!(grid.partials_nr(), grid.grid_size());
    }

    #[test]
    fn batch_walk_closes_once_per_template() {
        let p = ReductionParams {
            role: GridRole::Batch,
            kind: ReuseKind::PartialNoDim,
            sizes: [1, 1024, 1, 4, 1],
            view_size: 0,
            first_common_dim: 1,
            last_included_dim: 1,
            atomic_unit: 256,
            max_fit: 1,
            slice_dim: None,
        };
        let grid = ReductionGrid::create(&p);
        let views = split_multi(&grid, 0);
        let closers = views.iter().filter(|v| v.last_in_accum).count();
        assert_eq!(closers as u64, grid.grid_size() / grid.steps_per_template());
    }

    #[test]
    fn masked_gemms_alternate_per_activation() {
        let make = |gemm| {
            vec![
                MultiDimSubView {
                    bases: [0; MAX_DIMS],
                    sizes: [1; MAX_DIMS],
                    gemm,
                    partial: false,
                    first_in_accum: true,
                    last_in_accum: false,
                },
                MultiDimSubView {
                    bases: [0; MAX_DIMS],
                    sizes: [1; MAX_DIMS],
                    gemm,
                    partial: false,
                    first_in_accum: false,
                    last_in_accum: true,
                },
            ]
        };
        let out = interleave_masked(vec![make(0), make(1)], &[2, 2]);
        let order: Vec<usize> = out.iter().map(|v| v.gemm).collect();
        assert_eq!(order, vec![0, 0, 1, 1]);
        assert!(out[0].first_in_accum && out[1].last_in_accum);
    }

    #[test]
    fn masked_gemms_keep_their_own_step_counts() {
        let view = |gemm| MultiDimSubView {
            bases: [0; MAX_DIMS],
            sizes: [1; MAX_DIMS],
            gemm,
            partial: false,
            first_in_accum: true,
            last_in_accum: true,
        };
        // gemm 0 splits its contracted extent in two, gemm 1 keeps it whole
        let per_gemm = vec![vec![view(0); 4], vec![view(1); 2]];
        let out = interleave_masked(per_gemm, &[2, 1]);
        let order: Vec<usize> = out.iter().map(|v| v.gemm).collect();
        assert_eq!(order, vec![0, 0, 1, 0, 0, 1]);
    }
}
