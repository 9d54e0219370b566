//! Geometry model: how engines, cores and ports tile the work.
//!
//! [`GeometryGrid`] counts units on the four movement axes (output width,
//! spatial extent, batch, contracted dim). [`GeoAttr`] is the resolved
//! geometry of one layer: core/engine grids for the requested shape, port
//! grids per operand, concurrency folds and the spatial interleaving dim.
//!
//! Construction is eager: everything is computed once in [`GeoAttr::new`]
//! and read through immutable queries afterwards.

use mme_hal::{MmeHal, Geometry};

use crate::error::Result;
use crate::params::{LayerParams, OpType, Operand, MAX_DIMS};

/// Unit counts (or a unit position) on the four movement axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryGrid {
    /// Output-width axis.
    pub fcd: u64,
    /// Spatial axis.
    pub spatial: u64,
    /// Batch axis.
    pub batch: u64,
    /// Contracted-dimension axis.
    pub cd: u64,
}

impl GeometryGrid {
    /// Grid of a single unit.
    #[must_use]
    pub const fn unit() -> Self {
        Self { fcd: 1, spatial: 1, batch: 1, cd: 1 }
    }

    /// Total units in the grid.
    #[must_use]
    pub const fn reduced(&self) -> u64 {
        self.fcd * self.spatial * self.batch * self.cd
    }

    /// Decode a flat unit index into its per-axis position. The contracted
    /// dim is innermost, then batch, then width; spatial is outermost.
    #[must_use]
    pub fn idx_to_grid(&self, idx: u64) -> Self {
        debug_assert!(idx < self.reduced(), "unit index {idx} outside grid");
        let mut rem = idx;
        let cd = rem % self.cd;
        rem /= self.cd;
        let batch = rem % self.batch;
        rem /= self.batch;
        let fcd = rem % self.fcd;
        rem /= self.fcd;
        let spatial = rem % self.spatial;
        rem /= self.spatial;
        debug_assert_eq!(rem, 0, "unit index {idx} does not decompose");
        Self { fcd, spatial, batch, cd }
    }
}

/// Resolved geometry of one layer.
#[derive(Debug, Clone)]
pub struct GeoAttr {
    geometry: Geometry,
    /// Engine arrangement across the chip.
    mme_grid: GeometryGrid,
    /// Core arrangement inside one engine.
    core_grid: GeometryGrid,
    a_ports: GeometryGrid,
    b_ports: GeometryGrid,
    c_ports: GeometryGrid,
    /// Per-core EU width/height, in elements.
    eu_width: u64,
    eu_height: u64,
    /// Spatial dim over which input ports interleave rows.
    sp_interleaving_dim: usize,
    /// Output dim carrying the concurrency split.
    concurrent_dim: usize,
    /// Both cores of an engine read the same weight rows.
    b_shared_between_cores: bool,
    port_constrained: bool,
}

impl GeoAttr {
    /// Resolve the geometry for `params` on `hal`.
    ///
    /// # Errors
    ///
    /// Propagates [`LayerParams::validate`] failures.
    pub fn new(params: &LayerParams, hal: &MmeHal) -> Result<Self> {
        params.validate(hal)?;
        let s = &params.strategy;
        let (core_fcd, core_sp, chip_fcd, chip_sp) = hal.geometry_grid(s.geometry, s.mme_limit);
        let b_spatial_ports = hal.port_advance_spatially(s.geometry, params.b.dtype);
        let mut geo = Self {
            geometry: s.geometry,
            mme_grid: GeometryGrid { fcd: chip_fcd, spatial: chip_sp, ..GeometryGrid::unit() },
            core_grid: GeometryGrid { fcd: core_fcd, spatial: core_sp, ..GeometryGrid::unit() },
            a_ports: GeometryGrid { spatial: hal.input_ports_per_core, ..GeometryGrid::unit() },
            b_ports: if b_spatial_ports {
                GeometryGrid { spatial: hal.input_ports_per_core, ..GeometryGrid::unit() }
            } else {
                GeometryGrid { fcd: hal.input_ports_per_core, ..GeometryGrid::unit() }
            },
            c_ports: GeometryGrid { fcd: hal.output_ports_per_core, ..GeometryGrid::unit() },
            eu_width: hal.eu_elems(params.b.dtype),
            eu_height: hal.eu_elems(params.a.dtype),
            sp_interleaving_dim: 1,
            concurrent_dim: 2,
            b_shared_between_cores: core_sp > 1 && !params.is_transposed(Operand::B),
            port_constrained: hal.port_advance_spatially(s.geometry, params.a.dtype),
        };
        geo.set_chip_concurrency(params);
        geo.set_mme_concurrency(params);
        geo.sp_interleaving_dim = geo.calc_sp_interleaving_dim(params, hal);
        geo.concurrent_dim = geo.calc_concurrent_dim(params);
        Ok(geo)
    }

    /// Whether this operation can trade geometry units for concurrency.
    #[must_use]
    pub fn supports_concurrency(params: &LayerParams) -> bool {
        match params.op {
            op if op.is_dedw() => {
                !(params.strategy.cd_concurrency.is_on() && params.c.dtype.is_fp8())
            }
            OpType::ReductionAdd | OpType::GemmTranspose => false,
            op if op.is_gemm() => true,
            _ => false,
        }
    }

    /// Fold spare engines into concurrent work while a half-size geometry
    /// still covers the output.
    fn set_chip_concurrency(&mut self, params: &LayerParams) {
        if !Self::supports_concurrency(params) {
            return;
        }
        let s = &params.strategy;
        if s.batch_concurrency.is_off() && s.cd_concurrency.is_off() {
            return;
        }
        let to_cd = params.op.is_dedw() && s.cd_concurrency.is_on() && !s.batch_concurrency.is_on();
        while self.mme_grid.fcd > 1 && self.geometry_width() / 2 >= params.fcd_size() {
            self.mme_grid.fcd /= 2;
            if to_cd {
                self.mme_grid.cd *= 2;
            } else {
                self.mme_grid.batch *= 2;
            }
        }
        while self.mme_grid.spatial > 1 && self.geometry_height() / 2 >= params.spatial_size() {
            self.mme_grid.spatial /= 2;
            if to_cd {
                self.mme_grid.cd *= 2;
            } else {
                self.mme_grid.batch *= 2;
            }
        }
    }

    /// Fold cores inside one engine into concurrent work. For the weight
    /// gradient a hybrid request resolves to batch concurrency.
    fn set_mme_concurrency(&mut self, params: &LayerParams) {
        if !Self::supports_concurrency(params) {
            return;
        }
        let s = &params.strategy;
        if params.op.is_dedw() {
            if s.batch_concurrency.is_on() {
                while self.core_grid.fcd > 1 && self.geometry_width() / 2 >= params.fcd_size() {
                    self.core_grid.fcd /= 2;
                    self.core_grid.batch *= 2;
                }
            } else if s.cd_concurrency.is_on() {
                self.core_grid.cd *= self.core_grid.fcd * self.core_grid.spatial;
                self.core_grid.fcd = 1;
                self.core_grid.spatial = 1;
            }
        } else {
            if s.batch_concurrency.is_off() {
                return;
            }
            while self.core_grid.fcd > 1
                && self.geometry_width() / 2 >= params.fcd_size()
                && self.geometry_batch_concurrency() < params.batches_nr()
            {
                self.core_grid.fcd /= 2;
                self.core_grid.batch *= 2;
            }
            while self.core_grid.spatial > 1
                && self.geometry_height() / 2 >= params.spatial_size()
                && self.geometry_batch_concurrency() < params.batches_nr()
            {
                self.core_grid.spatial /= 2;
                self.core_grid.batch *= 2;
            }
        }
    }

    /// Spatial dim over which the weight-gradient input ports interleave.
    /// Moves from rows to columns only when consecutive rows fetch badly
    /// (recurringly misaligned to the memory cache line, or short enough to
    /// keep hitting the same engine line), the realigned rows still fit the
    /// staging buffer, the output is not 8-bit, and the candidate extent
    /// divides evenly across the interleaving ports.
    fn calc_sp_interleaving_dim(&self, params: &LayerParams, hal: &MmeHal) -> usize {
        if !params.op.is_dedw() || self.geometry_cd_concurrency() <= 1 {
            return 1;
        }
        if params.c.dtype.is_fp8() {
            return 1;
        }
        let row_bytes = params.a.strides[1] * params.a.dtype.size_bytes();
        let misaligned = row_bytes % hal.memory_cl_bytes != 0;
        // rows shorter than the engine line refetch the same line each step
        let same_line = row_bytes < hal.cl_bytes;
        if !misaligned && !same_line {
            return 1;
        }
        let ports = self.interleaved_spatial_ports_nr();
        if params.b.sizes[2] % ports != 0 {
            return 1;
        }
        let aligned_row = params.a.sizes[1].next_multiple_of(hal.cl_elems(params.a.dtype));
        if aligned_row * ports > hal.sb_elems_per_port(params.a.dtype) {
            return 1;
        }
        2
    }

    /// Output dim carrying the concurrency split.
    fn calc_concurrent_dim(&self, params: &LayerParams) -> usize {
        if params.op.is_dedw() {
            // first filter dim, unless lowering folded it away
            return if params.c.sizes[2] > 1 { 2 } else { 3 };
        }
        if params.op.is_native_dma() {
            return MAX_DIMS - 1;
        }
        let level = self.geometry_concurrency().max(1);
        let mut best = (u64::MAX, 2);
        for d in 2..MAX_DIMS {
            let size = params.c.sizes[d];
            if size <= 1 {
                continue;
            }
            let waste = size.div_ceil(level) * level - size;
            if waste < best.0 {
                best = (waste, d);
            }
        }
        best.1
    }

    /// Requested output shape.
    #[must_use]
    pub const fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Engine arrangement across the chip.
    #[must_use]
    pub const fn mme_grid(&self) -> &GeometryGrid {
        &self.mme_grid
    }

    /// Core arrangement inside one engine.
    #[must_use]
    pub const fn core_grid(&self) -> &GeometryGrid {
        &self.core_grid
    }

    /// Geometry width in output elements.
    #[must_use]
    pub const fn geometry_width(&self) -> u64 {
        self.mme_grid.fcd * self.core_grid.fcd * self.eu_width
    }

    /// Geometry height in output rows.
    #[must_use]
    pub const fn geometry_height(&self) -> u64 {
        self.mme_grid.spatial * self.core_grid.spatial * self.eu_height
    }

    /// Concurrency level carried on the contracted dim.
    #[must_use]
    pub const fn geometry_cd_concurrency(&self) -> u64 {
        self.mme_grid.cd * self.core_grid.cd
    }

    /// Concurrency level carried on the batch dims.
    #[must_use]
    pub const fn geometry_batch_concurrency(&self) -> u64 {
        self.mme_grid.batch * self.core_grid.batch
    }

    /// Combined concurrency level.
    #[must_use]
    pub const fn geometry_concurrency(&self) -> u64 {
        self.geometry_cd_concurrency() * self.geometry_batch_concurrency()
    }

    /// Output dim the concurrency split lives on.
    #[must_use]
    pub const fn concurrent_dim(&self) -> usize {
        self.concurrent_dim
    }

    /// Spatial dim over which input ports interleave rows.
    #[must_use]
    pub const fn sp_interleaving_dim(&self) -> usize {
        self.sp_interleaving_dim
    }

    /// Ports of one operand within a single core.
    #[must_use]
    pub const fn core_ports(&self, which: Operand) -> &GeometryGrid {
        match which {
            Operand::A => &self.a_ports,
            Operand::B => &self.b_ports,
            Operand::C => &self.c_ports,
        }
    }

    /// Ports of one operand within a single engine.
    #[must_use]
    pub fn mme_ports(&self, which: Operand) -> GeometryGrid {
        let p = self.core_ports(which);
        GeometryGrid {
            fcd: p.fcd * self.core_grid.fcd,
            spatial: p.spatial * self.core_grid.spatial,
            batch: p.batch * self.core_grid.batch,
            cd: p.cd * self.core_grid.cd,
        }
    }

    /// Ports of one operand across the whole chip.
    #[must_use]
    pub fn chip_ports(&self, which: Operand) -> GeometryGrid {
        let p = self.mme_ports(which);
        GeometryGrid {
            fcd: p.fcd * self.mme_grid.fcd,
            spatial: p.spatial * self.mme_grid.spatial,
            batch: p.batch * self.mme_grid.batch,
            cd: p.cd * self.mme_grid.cd,
        }
    }

    /// Input ports that interleave spatial rows between them.
    #[must_use]
    pub const fn interleaved_spatial_ports_nr(&self) -> u64 {
        self.a_ports.spatial * self.core_grid.spatial
    }

    /// Ports collaborating on the contracted dim of `which`. A transposed
    /// operand reads the contracted dim along its ports already.
    #[must_use]
    pub fn cd_collaborating_ports(&self, params: &LayerParams, which: Operand) -> u64 {
        if params.is_transposed(which) {
            1
        } else {
            self.core_ports(which).spatial.max(1) * self.geometry_cd_concurrency()
        }
    }

    /// Operand-visible position of a core inside its engine. Contracted-dim
    /// concurrency folds the cd step into spatial for inputs; a shared
    /// weight port folds the batch step into the width; a transposed
    /// operand advances spatially where others advance along the width.
    #[must_use]
    pub fn core_effective_grid(
        &self,
        params: &LayerParams,
        which: Operand,
        core_idx: u64,
    ) -> GeometryGrid {
        let mut pos = self.core_grid.idx_to_grid(core_idx);
        if which != Operand::C && self.geometry_cd_concurrency() > 1 {
            debug_assert!(
                !params.is_transposed(which),
                "cd concurrency requires non-transposed inputs"
            );
            pos.spatial += pos.cd * self.core_grid.spatial;
            pos.cd = 0;
        }
        if which == Operand::B && self.b_shared_between_cores {
            pos.fcd += pos.batch * self.core_grid.fcd;
            pos.batch = 0;
        }
        if params.is_transposed(which) {
            std::mem::swap(&mut pos.fcd, &mut pos.spatial);
        }
        pos
    }

    /// Whether `which` is replicated rather than partitioned across the
    /// batch. The weight gradient broadcasts its weight-side input; a batch
    /// GEMM broadcasts an operand whose batch extent is 1 while the
    /// output's is not.
    #[must_use]
    pub fn is_operand_broadcast(&self, params: &LayerParams, which: Operand) -> bool {
        if params.op.is_dedw() {
            return which == Operand::B;
        }
        if params.op.is_gemm() && which != Operand::C {
            let v = params.operand(which);
            return (params.op.last_spatial_dim() + 1..MAX_DIMS)
                .any(|d| v.sizes[d] == 1 && params.c.sizes[d] != 1);
        }
        false
    }

    /// Whether the geometry reads through fewer ports than the EU can
    /// consume, leaving reuse as the only way to keep it fed.
    #[must_use]
    pub const fn is_geometry_port_constrained(&self) -> bool {
        self.port_constrained
    }

    /// Whether a single port of `which` serves both cores of the engine.
    /// Only the weight-side input is ever shared, and only when the cores
    /// stack spatially over a non-transposed read.
    #[must_use]
    pub const fn is_port_shared_between_cores(&self, which: Operand) -> bool {
        matches!(which, Operand::B) && self.b_shared_between_cores
    }

    /// Whether the ports of `which` interleave consecutive rows inside one
    /// core, rather than splitting the view into disjoint blocks.
    #[must_use]
    pub fn is_spatially_interleaved_inside_core(
        &self,
        params: &LayerParams,
        which: Operand,
    ) -> bool {
        !params.is_transposed(which) && self.core_ports(which).spatial > 1
    }

    /// Whether the spatial extent of `which` splits across the cores of one
    /// engine. A transposed read sees the core width grid as spatial.
    #[must_use]
    pub fn is_spatially_interleaved_across_cores(
        &self,
        params: &LayerParams,
        which: Operand,
    ) -> bool {
        if params.is_transposed(which) {
            self.core_grid.fcd > 1
        } else {
            self.core_grid.spatial > 1
        }
    }

    /// Whether the spatial extent of `which` splits across engines.
    #[must_use]
    pub fn is_spatially_interleaved_across_mmes(
        &self,
        params: &LayerParams,
        which: Operand,
    ) -> bool {
        if params.is_transposed(which) {
            self.mme_grid.fcd > 1
        } else {
            self.mme_grid.spatial > 1
        }
    }

    /// Whether the ports of `which` start at row-staggered offsets (each
    /// port one row into its neighbour's span) instead of block starts.
    #[must_use]
    pub fn is_port_start_offset(&self, params: &LayerParams, which: Operand) -> bool {
        self.is_spatially_interleaved_inside_core(params, which) && self.sp_interleaving_dim == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{Strategy, TensorView, Toggle};
    use mme_hal::DataType;

    fn sizes(v: &[u64]) -> [u64; MAX_DIMS] {
        let mut out = [1; MAX_DIMS];
        out[..v.len()].copy_from_slice(v);
        out
    }

    fn gemm(m: u64, k: u64, n: u64, batches: u64) -> LayerParams {
        LayerParams {
            op: OpType::Ab,
            a: TensorView::dense(sizes(&[k, m, batches]), DataType::Bf16),
            b: TensorView::dense(sizes(&[n, k, batches]), DataType::Bf16),
            c: TensorView::dense(sizes(&[n, m, batches]), DataType::Bf16),
            aux: None,
            strategy: Strategy::default(),
        }
    }

    #[test]
    fn grid_decode_round_trips() {
        let grid = GeometryGrid { fcd: 2, spatial: 3, batch: 2, cd: 2 };
        let mut seen = Vec::new();
        for idx in 0..grid.reduced() {
            let pos = grid.idx_to_grid(idx);
            assert!(pos.fcd < grid.fcd && pos.spatial < grid.spatial);
            assert!(pos.batch < grid.batch && pos.cd < grid.cd);
            let back = pos.cd
                + grid.cd * (pos.batch + grid.batch * (pos.fcd + grid.fcd * pos.spatial));
            assert_eq!(back, idx);
            seen.push((pos.fcd, pos.spatial, pos.batch, pos.cd));
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len() as u64, grid.reduced());
    }

    #[test]
    fn chip_ports_factor_through_the_grids() {
        let params = gemm(512, 128, 512, 1);
        let geo = GeoAttr::new(&params, &MmeHal::v2()).unwrap();
        for which in [Operand::A, Operand::B, Operand::C] {
            let core = geo.core_ports(which);
            let chip = geo.chip_ports(which);
            assert_eq!(
                chip.reduced(),
                core.reduced() * geo.core_grid().reduced() * geo.mme_grid().reduced()
            );
        }
    }

    #[test]
    fn narrow_batched_gemm_folds_into_batch_concurrency() {
        let mut params = gemm(64, 64, 64, 8);
        params.strategy.batch_concurrency = Toggle::On;
        let geo = GeoAttr::new(&params, &MmeHal::v2()).unwrap();
        assert!(geo.geometry_batch_concurrency() > 1);
        assert!(geo.geometry_width() >= params.fcd_size());
    }

    #[test]
    fn reduction_add_never_gets_concurrency() {
        let mut params = gemm(64, 64, 64, 8);
        params.op = OpType::ReductionAdd;
        params.strategy.batch_concurrency = Toggle::On;
        let geo = GeoAttr::new(&params, &MmeHal::v2()).unwrap();
        assert_eq!(geo.geometry_concurrency(), 1);
    }

    #[test]
    fn dedw_hybrid_request_resolves_to_batch() {
        let mut params = gemm(64, 512, 64, 1);
        params.op = OpType::Dedw;
        params.c.sizes = sizes(&[64, 64, 3, 3]);
        params.strategy.batch_concurrency = Toggle::On;
        params.strategy.cd_concurrency = Toggle::On;
        let geo = GeoAttr::new(&params, &MmeHal::v2()).unwrap();
        assert_eq!(geo.geometry_cd_concurrency(), 1);
        assert_eq!(geo.concurrent_dim(), 2);
    }

    #[test]
    fn effective_core_positions_stay_distinct() {
        let mut params = gemm(64, 512, 64, 1);
        params.op = OpType::Dedw;
        params.c.sizes = sizes(&[64, 64, 3, 3]);
        params.strategy.cd_concurrency = Toggle::On;
        let geo = GeoAttr::new(&params, &MmeHal::v2()).unwrap();
        assert!(geo.geometry_cd_concurrency() > 1);
        for which in [Operand::A, Operand::B] {
            let mut positions: Vec<_> = (0..geo.core_grid().reduced())
                .map(|i| {
                    let p = geo.core_effective_grid(&params, which, i);
                    (p.fcd, p.spatial, p.batch, p.cd)
                })
                .collect();
            positions.sort_unstable();
            positions.dedup();
            assert_eq!(positions.len() as u64, geo.core_grid().reduced());
        }
    }

    #[test]
    fn tall_geometry_shares_the_weight_port_and_interleaves_rows() {
        let mut params = gemm(512, 128, 128, 1);
        params.strategy.geometry = Geometry::FourXh;
        let geo = GeoAttr::new(&params, &MmeHal::v2()).unwrap();
        assert!(geo.is_port_shared_between_cores(Operand::B));
        assert!(!geo.is_port_shared_between_cores(Operand::A));
        assert!(!geo.is_port_shared_between_cores(Operand::C));
        assert!(geo.is_spatially_interleaved_inside_core(&params, Operand::A));
        assert!(geo.is_spatially_interleaved_across_cores(&params, Operand::A));
        assert!(geo.is_spatially_interleaved_across_mmes(&params, Operand::A));
        // no column interleaving, so in-core ports stagger their row starts
        assert!(geo.is_port_start_offset(&params, Operand::A));
    }

    #[test]
    fn transposed_read_sees_width_grids_as_spatial() {
        let mut params = gemm(128, 128, 512, 1);
        params.op = OpType::Atb;
        let geo = GeoAttr::new(&params, &MmeHal::v2()).unwrap();
        // wide geometry: cores and engines stack along the output width
        assert!(!geo.is_spatially_interleaved_inside_core(&params, Operand::A));
        assert!(geo.is_spatially_interleaved_across_cores(&params, Operand::A));
        assert!(geo.is_spatially_interleaved_across_mmes(&params, Operand::A));
        assert!(!geo.is_spatially_interleaved_across_cores(&params, Operand::B));
        assert!(!geo.is_spatially_interleaved_across_mmes(&params, Operand::B));
        assert!(!geo.is_port_start_offset(&params, Operand::A));
    }

    #[test]
    fn dedw_short_aligned_rows_interleave_on_columns() {
        let mut params = gemm(64, 512, 64, 1);
        params.op = OpType::Dedw;
        params.a = TensorView::dense(sizes(&[32, 28, 56]), DataType::Bf16);
        params.b = TensorView::dense(sizes(&[64, 512, 56]), DataType::Bf16);
        params.c = TensorView::dense(sizes(&[512, 32, 3, 3]), DataType::Bf16);
        params.strategy.cd_concurrency = Toggle::On;
        let geo = GeoAttr::new(&params, &MmeHal::v2()).unwrap();
        assert!(geo.geometry_cd_concurrency() > 1);
        // 64-byte rows align to the memory line but land on one engine line
        assert_eq!(geo.sp_interleaving_dim(), 2);

        params.a.strides[1] = 64;
        let geo = GeoAttr::new(&params, &MmeHal::v2()).unwrap();
        assert_eq!(geo.sp_interleaving_dim(), 1);
    }

    #[test]
    fn broadcast_weight_in_weight_gradient() {
        let mut params = gemm(64, 64, 64, 1);
        params.op = OpType::Dedw;
        let geo = GeoAttr::new(&params, &MmeHal::v2()).unwrap();
        assert!(geo.is_operand_broadcast(&params, Operand::B));
        assert!(!geo.is_operand_broadcast(&params, Operand::A));
    }
}
