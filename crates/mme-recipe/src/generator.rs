//! Recipe generation: strategy resolution, view rewrites and the final
//! assembly of grids and sub-views into an [`MmeRecipe`].

use mme_hal::MmeHal;
use tracing::debug;

use crate::error::Result;
use crate::geometry::GeoAttr;
use crate::params::{LayerParams, OpType, Operand, WalkPattern, MAX_DIMS};
use crate::plan::{build_grids, PlanGrids, PlanInputs, SpatialPartition};
use crate::recipe::{MmeRecipe, RecipePosition};
use crate::reuse::is_input_aligned;
use crate::subview::{split_sub_views, SplitSubViews};

/// Accumulator programming for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccumSpec {
    /// Accumulator set the descriptor targets.
    pub index: usize,
    /// Write the result out.
    pub store: bool,
    /// Add onto the held accumulator.
    pub accumulate: bool,
    /// Read-modify-write reduction in memory.
    pub reduction: bool,
}

/// Receives the per-descriptor programming of a walk.
///
/// Implementations translate the calls into whatever register image the
/// target queue expects; the walk itself stays format-agnostic.
pub trait DescriptorSink {
    /// Steps the parked operand repeats from the staging buffer.
    fn set_sb_repeat_steps(&mut self, operand: Operand, steps: u64);
    /// Whether the streamed operand also repeats at this position.
    fn set_sb_repeat_mask(&mut self, operand: Operand, repeat: bool);
    /// Spatial ports interleaving the output rows.
    fn set_agu_interleaving(&mut self, ports: u64);
    /// Accumulator programming at one position.
    fn set_accums(&mut self, pos: RecipePosition, spec: AccumSpec);
}

/// Plans one layer into a recipe.
#[derive(Debug, Clone)]
pub struct RecipeGenerator<'h> {
    params: LayerParams,
    hal: &'h MmeHal,
    raster: bool,
    lowered: bool,
    flattened: bool,
    te_factor: u64,
    gemms_nr: u64,
}

impl<'h> RecipeGenerator<'h> {
    /// Resolve the strategy against `hal` and rewrite the views.
    ///
    /// # Errors
    ///
    /// Propagates parameter validation failures.
    pub fn new(params: LayerParams, hal: &'h MmeHal) -> Result<Self> {
        let mut gen = Self {
            params,
            hal,
            raster: false,
            lowered: false,
            flattened: false,
            te_factor: 1,
            gemms_nr: 1,
        };
        gen.normalize_views();
        gen.params.validate(hal)?;
        gen.raster = gen.params.strategy.pattern.is_raster();
        if gen.params.strategy.masked_gemm {
            gen.gemms_nr = 2;
        }
        if gen.params.strategy.lowering && gen.params.can_lower() {
            gen.apply_lowering();
        }
        if gen.params.strategy.flattening && gen.params.can_flatten() {
            gen.apply_flattening();
        }
        if gen.params.op == OpType::Trans
            && hal.supports_te_acceleration
            && !gen.params.strategy.te_acceleration.is_off()
        {
            gen.te_factor = 2;
        }
        Ok(gen)
    }

    /// Unused upper dims come in as 0 from some callers; they mean 1.
    fn normalize_views(&mut self) {
        let mut views = [&mut self.params.a, &mut self.params.b, &mut self.params.c];
        for view in &mut views {
            for d in 2..MAX_DIMS {
                if view.sizes[d] == 0 {
                    view.sizes[d] = 1;
                }
            }
        }
    }

    /// Fold the first filter dimension into the contracted extent, so one
    /// descriptor reads `kw` adjacent input rows instead of looping taps.
    fn apply_lowering(&mut self) {
        let kw = self.params.b.sizes[2];
        debug_assert!(self.params.b.is_contiguous_at(2));
        self.params.a.sizes[0] *= kw;
        self.params.b.sizes[1] *= kw;
        self.params.b.sizes[2] = 1;
        self.params.b.strides[2] = self.params.b.strides[1] * self.params.b.sizes[1];
        self.lowered = true;
    }

    /// Merge output dims 1 and 2 into a single spatial walk.
    fn apply_flattening(&mut self) {
        let folded = self.params.c.sizes[2];
        self.params.a.sizes[1] *= self.params.a.sizes[2];
        self.params.a.sizes[2] = 1;
        self.params.c.sizes[1] *= folded;
        self.params.c.sizes[2] = 1;
        self.flattened = true;
    }

    /// Pick the operand to park in the staging buffer, if any.
    ///
    /// The parked side is the one the inner loop re-reads: with a raster
    /// walk the width sweeps inside each row, so `a` stays put; with the
    /// spatial walk inside, `b` does. A common-dim-outermost walk re-reads
    /// nothing and gets no reuse.
    fn calc_reuse_operand(&self, geo: &GeoAttr) -> Option<Operand> {
        let strategy = &self.params.strategy;
        if !strategy.sb_reuse || self.params.op.is_native_dma() {
            return None;
        }
        if self.params.op.is_gemm() && self.params.batches_nr() > 16 {
            return None;
        }
        let fcd_geos = self.params.fcd_size().div_ceil(geo.geometry_width());
        let sp_geos = self.params.spatial_size().div_ceil(geo.geometry_height());
        match strategy.pattern {
            WalkPattern::Ckf | WalkPattern::Kcf => None,
            WalkPattern::Cfk | WalkPattern::Fck => (fcd_geos > 1)
                .then_some(Operand::A)
                .or((sp_geos > 1).then_some(Operand::B)),
            WalkPattern::Kfc => (sp_geos > 1)
                .then_some(Operand::B)
                .or((fcd_geos > 1).then_some(Operand::A)),
        }
    }

    /// Spread the work over at least `pipeline_level` activations so the
    /// queue can overlap them. Parked tiles pin the depth to the
    /// accumulator count.
    fn apply_pipeline_hint(&self, grids: &mut PlanGrids) {
        let want = self.params.strategy.pipeline_level;
        if want <= 1 {
            return;
        }
        let cap = if grids.reuse.operand.is_some() {
            self.hal.accums_nr
        } else {
            self.hal.loop_steps_max
        };
        let target = want.min(cap);
        match (&mut grids.spatial, self.raster) {
            (SpatialPartition::Work(sp), true) => {
                sp.extend(sp.grid_size().max(target));
                if sp.grid_size() < target {
                    grids.fcd.extend(grids.fcd.grid_size().max(target));
                }
            }
            (SpatialPartition::Work(sp), false) => {
                grids.fcd.extend(grids.fcd.grid_size().max(target));
                if grids.fcd.grid_size() < target {
                    sp.extend(sp.grid_size().max(target));
                }
            }
            (SpatialPartition::Reduction(_), _) => {
                grids.fcd.extend(grids.fcd.grid_size().max(target));
            }
        }
    }

    /// Flags for the second reuse level: the streamed operand's tile
    /// sequence recurs on every outer step after the first.
    fn second_operand_flags(&self, grids: &PlanGrids, sub: &SplitSubViews) -> Vec<bool> {
        if !self.hal.supports_2d_reuse {
            return Vec::new();
        }
        let Some(parked) = grids.reuse.operand else {
            return Vec::new();
        };
        let outer_steps = match parked {
            Operand::A => sub.sp.len(),
            Operand::B | Operand::C => sub.fcd.len(),
        };
        (0..outer_steps).map(|i| i > 0).collect()
    }

    /// Plan the layer.
    ///
    /// # Errors
    ///
    /// Propagates geometry resolution and validation failures.
    pub fn generate(&self) -> Result<MmeRecipe> {
        let geo = GeoAttr::new(&self.params, self.hal)?;
        let reuse_operand = self.calc_reuse_operand(&geo);
        let full_utilization =
            reuse_operand.map_or(true, |o| is_input_aligned(&self.params, self.hal, o));
        let mut grids = build_grids(&PlanInputs {
            params: &self.params,
            geo: &geo,
            hal: self.hal,
            reuse_operand,
            full_utilization,
            gemms_nr: self.gemms_nr,
            te_factor: self.te_factor,
        })?;
        self.apply_pipeline_hint(&mut grids);
        let sub = split_sub_views(&grids);
        let second_operand_reuse = self.second_operand_flags(&grids, &sub);
        let partials_per_gemm = grids.partials_per_gemm();
        let tiles = (sub.fcd.len() * sub.sp.len()) as u64;
        let signal_amount = self.params.strategy.signal_amount.div_ceil(tiles.max(1)).max(1);
        debug!(
            op = ?self.params.op,
            fcd = sub.fcd.len(),
            sp = sub.sp.len(),
            non_spatial = sub.non_spatial.len(),
            reuse = ?grids.reuse.operand,
            "generated recipe"
        );
        Ok(MmeRecipe {
            op: self.params.op,
            raster: self.raster,
            lowered: self.lowered,
            flattened: self.flattened,
            te_factor: self.te_factor,
            gemms_nr: self.gemms_nr,
            a: self.params.a,
            b: self.params.b,
            c: self.params.c,
            fcd_subviews: sub.fcd,
            sp_subviews: sub.sp,
            non_spatial_subviews: sub.non_spatial,
            reuse: grids.reuse,
            partials_per_gemm,
            signal_amount,
            second_operand_reuse,
        })
    }

    /// Walk `recipe` and feed each descriptor's programming to `sink`.
    ///
    /// # Errors
    ///
    /// Propagates geometry resolution failures.
    pub fn emit<S: DescriptorSink>(&self, recipe: &MmeRecipe, sink: &mut S) -> Result<()> {
        let geo = GeoAttr::new(&self.params, self.hal)?;
        sink.set_agu_interleaving(geo.interleaved_spatial_ports_nr());
        if let Some(parked) = recipe.reuse.operand {
            sink.set_sb_repeat_steps(parked, recipe.accumulation_steps());
        }
        for pos in recipe.positions() {
            if let Some(parked) = recipe.reuse.operand {
                let (streamed, outer) = match parked {
                    Operand::A => (Operand::B, pos.sp),
                    Operand::B | Operand::C => (Operand::A, pos.fcd),
                };
                let repeat =
                    recipe.second_operand_reuse.get(outer).copied().unwrap_or(false);
                sink.set_sb_repeat_mask(streamed, repeat);
            }
            let index = recipe.accum_idx(&pos) % self.hal.accums_nr as usize;
            let spec = AccumSpec {
                index,
                store: recipe.store_en(&pos),
                accumulate: recipe.accum_en(&pos),
                reduction: recipe.reduction_en(&pos),
            };
            sink.set_accums(pos, spec);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{AuxViews, SizeArray, Strategy, TensorView};
    use mme_hal::DataType;

    fn sizes(v: &[u64]) -> SizeArray {
        let mut out = [1; MAX_DIMS];
        out[..v.len()].copy_from_slice(v);
        out
    }

    fn layer(op: OpType, a: &[u64], b: &[u64], c: &[u64]) -> LayerParams {
        LayerParams {
            op,
            a: TensorView::dense(sizes(a), DataType::Bf16),
            b: TensorView::dense(sizes(b), DataType::Bf16),
            c: TensorView::dense(sizes(c), DataType::Bf16),
            aux: None,
            strategy: Strategy::default(),
        }
    }

    #[test]
    fn gemm_recipe_covers_the_output() {
        let hal = MmeHal::v2();
        let params = layer(OpType::Ab, &[256, 1000], &[512, 256], &[512, 1000]);
        let recipe = RecipeGenerator::new(params, &hal).unwrap().generate().unwrap();
        let fcd_total: u64 = recipe.fcd_subviews.iter().map(|v| v.size).sum();
        let sp_total: u64 = recipe.sp_subviews.iter().map(|v| v.size).sum();
        assert_eq!(fcd_total, 512);
        assert_eq!(sp_total, 1000);
        assert_eq!(
            recipe.descriptors_nr(),
            recipe.fcd_subviews.len()
                * recipe.sp_subviews.len()
                * recipe.non_spatial_subviews.len().max(1)
        );
    }

    #[test]
    fn lowering_folds_the_filter_width() {
        let hal = MmeHal::v2();
        let mut params = layer(
            OpType::Fwd,
            &[512, 56, 56, 1, 8],
            &[64, 512, 3, 3],
            &[64, 54, 56, 1, 8],
        );
        params.strategy.lowering = true;
        params.strategy.sb_reuse = false;
        let gen = RecipeGenerator::new(params, &hal).unwrap();
        let recipe = gen.generate().unwrap();
        assert!(recipe.lowered);
        assert_eq!(recipe.a.sizes[0], 512 * 3);
        assert_eq!(recipe.b.sizes[1], 512 * 3);
        assert_eq!(recipe.b.sizes[2], 1);
    }

    #[test]
    fn masked_gemm_interleaves_both_contracted_extents() {
        let hal = MmeHal::v2();
        let mut params = layer(OpType::Ab, &[64, 128, 1, 4], &[128, 64, 1, 4], &[128, 128, 1, 4]);
        params.strategy.masked_gemm = true;
        // the mask-side GEMM contracts over its own, longer extent
        params.aux = Some(AuxViews {
            a: TensorView::dense(sizes(&[96, 128, 1, 4]), DataType::Bf16),
            b: TensorView::dense(sizes(&[128, 96, 1, 4]), DataType::Bf16),
        });
        let recipe = RecipeGenerator::new(params, &hal).unwrap().generate().unwrap();
        assert_eq!(recipe.gemms_nr, 2);
        let gemms: Vec<usize> =
            recipe.non_spatial_subviews.iter().map(|v| v.gemm).collect();
        assert!(gemms.contains(&0) && gemms.contains(&1));
        assert!(recipe
            .non_spatial_subviews
            .iter()
            .all(|v| v.sizes[1] == if v.gemm == 0 { 64 } else { 96 }));
    }

    #[test]
    fn zero_batch_dims_normalize_to_one() {
        let hal = MmeHal::v2();
        let mut params = layer(OpType::Ab, &[256, 512], &[512, 256], &[512, 512]);
        params.a.sizes[3] = 0;
        params.b.sizes[4] = 0;
        params.c.sizes[3] = 0;
        let recipe = RecipeGenerator::new(params, &hal).unwrap().generate().unwrap();
        assert_eq!(recipe.a.sizes[3], 1);
        assert_eq!(recipe.b.sizes[4], 1);
        assert_eq!(recipe.c.sizes[3], 1);
    }

    #[test]
    fn zero_low_dims_are_rejected() {
        let hal = MmeHal::v2();
        let mut params = layer(OpType::Ab, &[256, 512], &[512, 256], &[512, 512]);
        params.c.sizes[0] = 0;
        let err = RecipeGenerator::new(params, &hal).unwrap_err();
        assert!(matches!(
            err,
            crate::error::RecipeError::EmptyView { operand: "c", dim: 0 }
        ));
    }

    #[test]
    fn transpose_packs_rows_only_where_supported() {
        let params = layer(OpType::Trans, &[1000, 512], &[1, 1], &[512, 1000]);
        let hal2 = MmeHal::v2();
        let r2 = RecipeGenerator::new(params.clone(), &hal2).unwrap().generate().unwrap();
        assert_eq!(r2.te_factor, 2);
        let hal1 = MmeHal::v1();
        let r1 = RecipeGenerator::new(params, &hal1).unwrap().generate().unwrap();
        assert_eq!(r1.te_factor, 1);
    }

    #[derive(Default)]
    struct RecordingSink {
        interleaving: u64,
        repeat_steps: Vec<(Operand, u64)>,
        accums: Vec<(RecipePosition, AccumSpec)>,
    }

    impl DescriptorSink for RecordingSink {
        fn set_sb_repeat_steps(&mut self, operand: Operand, steps: u64) {
            self.repeat_steps.push((operand, steps));
        }
        fn set_sb_repeat_mask(&mut self, _operand: Operand, _repeat: bool) {}
        fn set_agu_interleaving(&mut self, ports: u64) {
            self.interleaving = ports;
        }
        fn set_accums(&mut self, pos: RecipePosition, spec: AccumSpec) {
            self.accums.push((pos, spec));
        }
    }

    #[test]
    fn emitted_walk_stores_once_per_tile() {
        let hal = MmeHal::v2();
        let mut params = layer(OpType::Ab, &[256, 1000], &[512, 256], &[512, 1000]);
        params.strategy.sb_reuse = false;
        let gen = RecipeGenerator::new(params, &hal).unwrap();
        let recipe = gen.generate().unwrap();
        let mut sink = RecordingSink::default();
        gen.emit(&recipe, &mut sink).unwrap();
        assert_eq!(sink.accums.len(), recipe.descriptors_nr());
        let stores = sink.accums.iter().filter(|(_, s)| s.store).count();
        assert_eq!(
            stores,
            recipe.fcd_subviews.len() * recipe.sp_subviews.len()
        );
        assert!(sink.accums.iter().all(|(_, s)| !s.reduction));
    }

    #[test]
    fn pipeline_hint_deepens_the_walk() {
        let hal = MmeHal::v2();
        let mut params = layer(OpType::Ab, &[256, 4096], &[512, 256], &[512, 4096]);
        params.strategy.sb_reuse = false;
        let shallow = RecipeGenerator::new(params.clone(), &hal).unwrap().generate().unwrap();
        params.strategy.pipeline_level = 4;
        let deep = RecipeGenerator::new(params, &hal).unwrap().generate().unwrap();
        assert!(deep.fcd_subviews.len() >= shallow.fcd_subviews.len());
        assert!(deep.fcd_subviews.len() >= 4 || deep.sp_subviews.len() >= 4);
        let sp_total: u64 = deep.sp_subviews.iter().map(|v| v.size).sum();
        assert_eq!(sp_total, 4096);
    }
}
