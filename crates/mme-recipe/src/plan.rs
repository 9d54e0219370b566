//! Tiling plan: one grid per movement axis.
//!
//! [`build_grids`] turns resolved geometry plus a reuse decision into the
//! per-axis grids. The width and (for most ops) the spatial extent get
//! balanced work grids; the contracted extent gets one reduction grid per
//! GEMM. The weight gradient swaps roles: its spatial extent is the
//! reduction and its output filter walk is a work grid.

use mme_hal::MmeHal;
use tracing::debug;

use crate::error::Result;
use crate::geometry::GeoAttr;
use crate::grid::{BalancedGrid, GridRole, ReductionGrid, ReductionParams, ReuseKind};
use crate::params::{LayerParams, Operand, SizeArray, MAX_DIMS};
use crate::reuse::SbReuse;

/// The reuse decision that shaped a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReuseInfo {
    /// Operand parked in the staging buffer, if any.
    pub operand: Option<Operand>,
    /// How the contracted extent is held.
    pub kind: ReuseKind,
    /// Contracted elements held at once (0 without reuse).
    pub sb_span: u64,
    /// Contracted elements one accumulation needs (0 without reuse).
    pub sb_cd_size: u64,
}

impl ReuseInfo {
    /// No reuse.
    #[must_use]
    pub const fn none() -> Self {
        Self { operand: None, kind: ReuseKind::None, sb_span: 0, sb_cd_size: 0 }
    }

    /// Whether accumulation runs in partial products.
    #[must_use]
    pub const fn is_partial(&self) -> bool {
        self.kind.is_partial()
    }
}

/// Partition of the spatial extent.
#[derive(Debug, Clone)]
pub enum SpatialPartition {
    /// Output rows, partitioned as work.
    Work(BalancedGrid),
    /// The weight gradient's spatial reduction.
    Reduction(ReductionGrid),
}

impl SpatialPartition {
    /// Step count of the partition.
    #[must_use]
    pub fn grid_size(&self) -> u64 {
        match self {
            Self::Work(g) => g.grid_size(),
            Self::Reduction(g) => g.grid_size(),
        }
    }
}

/// All grids of one plan.
#[derive(Debug, Clone)]
pub struct PlanGrids {
    /// Output-width walk.
    pub fcd: BalancedGrid,
    /// Spatial walk (or reduction, for the weight gradient).
    pub spatial: SpatialPartition,
    /// Filter-position walk of the weight gradient output.
    pub conv: Option<BalancedGrid>,
    /// Contracted-extent accumulation sets, one per GEMM.
    pub reductions: Vec<ReductionGrid>,
    /// The reuse decision behind the grids.
    pub reuse: ReuseInfo,
}

impl PlanGrids {
    /// Accumulation steps per GEMM (1 without partials).
    #[must_use]
    pub fn partials_per_gemm(&self) -> Vec<u64> {
        if let SpatialPartition::Reduction(g) = &self.spatial {
            return vec![g.partials_nr()];
        }
        self.reductions.iter().map(ReductionGrid::partials_nr).collect()
    }
}

/// Inputs [`build_grids`] needs beyond the layer itself.
#[derive(Debug, Clone, Copy)]
pub struct PlanInputs<'p> {
    /// Layer under planning (views already lowered/flattened).
    pub params: &'p LayerParams,
    /// Resolved geometry.
    pub geo: &'p GeoAttr,
    /// Capability profile.
    pub hal: &'p MmeHal,
    /// Chosen reuse operand.
    pub reuse_operand: Option<Operand>,
    /// False when the reused operand is misaligned to the memory line.
    pub full_utilization: bool,
    /// GEMMs sharing the plan (2 for masked batch-GEMM).
    pub gemms_nr: u64,
    /// Effective-height multiplier from transpose-engine packing.
    pub te_factor: u64,
}

/// Common-dim extents of one GEMM, width dim cleared.
fn common_dim_sizes(params: &LayerParams, gemm: u64) -> (SizeArray, usize, GridRole) {
    if params.op.is_conv() && !params.op.is_dedw() {
        // filter walk over the weight operand
        let fcd_dim = usize::from(params.op.transpose_b());
        let mut sizes = params.b.sizes;
        sizes[fcd_dim] = 1;
        (sizes, 1 - fcd_dim, GridRole::Conv)
    } else {
        // batch walk; dim 1 carries the per-GEMM contracted extent
        let mut sizes: SizeArray = [1; MAX_DIMS];
        sizes[1] = params.single_gemm_cd_of(gemm);
        for d in params.op.last_spatial_dim() + 1..MAX_DIMS {
            sizes[d] = params.c.sizes[d];
        }
        (sizes, 1, GridRole::Batch)
    }
}

/// Highest dim a descriptor can still loop over on its own counters.
fn loop_limited_last_dim(
    sizes: &SizeArray,
    first: usize,
    geo: &GeoAttr,
    hal: &MmeHal,
) -> usize {
    let mut last = first;
    for d in first..MAX_DIMS {
        let mut limit = hal.loop_steps_max;
        if d == geo.concurrent_dim() {
            limit *= geo.geometry_concurrency();
        }
        if sizes[d] > limit {
            break;
        }
        last = d;
    }
    last
}

/// Reduction-grid inputs for one GEMM of the plan.
fn reduction_params_for(
    inp: &PlanInputs<'_>,
    reuse: Option<&SbReuse<'_>>,
    gemm: u64,
    sp_cap: u64,
) -> ReductionParams {
    let params = inp.params;
    let (common_sizes, first_common_dim, role) = common_dim_sizes(params, gemm);
    let role = if params.op.is_dedw() { GridRole::Spatial } else { role };
    match reuse {
        Some(r) => r.plan_common_dim(
            &common_sizes,
            first_common_dim,
            role,
            params.single_gemm_cd_of(gemm),
            inp.gemms_nr,
            1,
            sp_cap,
        ),
        None => {
            let src = if params.op.is_dedw() {
                let mut b_sizes = params.b.sizes;
                b_sizes[0] = 1;
                b_sizes
            } else {
                common_sizes
            };
            let last = loop_limited_last_dim(&src, first_common_dim, inp.geo, inp.hal);
            ReductionParams {
                role,
                kind: ReuseKind::None,
                sizes: src,
                view_size: params.single_gemm_cd_of(gemm),
                first_common_dim,
                last_included_dim: last,
                atomic_unit: src[first_common_dim],
                max_fit: 1,
                slice_dim: None,
            }
        }
    }
}

/// Build the per-axis grids.
///
/// # Errors
///
/// Propagates parameter validation failures.
pub fn build_grids(inp: &PlanInputs<'_>) -> Result<PlanGrids> {
    let params = inp.params;
    let geo = inp.geo;
    let hal = inp.hal;
    params.validate(hal)?;

    let reuse = inp
        .reuse_operand
        .map(|op| SbReuse::new(params, geo, hal, op, inp.full_utilization));

    // preliminary loop caps; the first GEMM's reuse verdict tightens them
    let mut fcd_cap = hal.loop_steps_max;
    let mut sp_cap = hal.loop_steps_max;
    // common-dim planning always sees the untightened spatial capacity
    let plan_cap = sp_cap;

    let reduction_params = reduction_params_for(inp, reuse.as_ref(), 0, plan_cap);
    if let Some(r) = &reuse {
        let (rf, rs) = r.spatial_capacities(
            reduction_params.kind.is_partial(),
            reduction_params.kind.to_memory(),
        );
        fcd_cap = fcd_cap.min(rf);
        sp_cap = sp_cap.min(rs);
    }

    // a transposed weight sliced on its channel dim must stay line-aligned
    if matches!(reduction_params.kind, ReuseKind::PartialNoDim) && params.op.transpose_b() {
        debug_assert_eq!(
            reduction_params.atomic_unit % hal.cl_elems(params.b.dtype),
            0,
            "transposed channel split off the cache line"
        );
    }

    let fcd_step = if params.op == crate::params::OpType::Memcpy {
        params.c.sizes[0]
    } else {
        geo.geometry_width()
    };
    let fcd = BalancedGrid::create_default(params.c.sizes[0], fcd_step, fcd_cap);

    // port interleaving shrinks the usable height when the interleaved dim
    // is shorter than the port count
    let mut available_height = geo.geometry_height() * inp.te_factor.max(1);
    let ports = geo.interleaved_spatial_ports_nr();
    let interleaved_len = params.c.sizes[geo.sp_interleaving_dim()];
    if interleaved_len < ports {
        available_height = (available_height / ports) * interleaved_len.max(1);
    }

    let (spatial, conv, reductions) = if params.op.is_dedw() {
        let spatial = SpatialPartition::Reduction(ReductionGrid::create(&reduction_params));
        let mut conv_sizes = params.c.sizes;
        let conc = geo.concurrent_dim();
        conv_sizes[conc] = conv_sizes[conc].div_ceil(geo.geometry_concurrency());
        let view: u64 = conv_sizes[1..].iter().product();
        let conv = BalancedGrid::create_for_conv(
            view,
            conv_sizes[1],
            available_height,
            sp_cap,
            hal.conv_partial_at_start,
        );
        (spatial, Some(conv), Vec::new())
    } else {
        let spatial = SpatialPartition::Work(BalancedGrid::create_default(
            params.spatial_size(),
            available_height,
            sp_cap,
        ));
        let reductions = (0..inp.gemms_nr)
            .map(|g| {
                ReductionGrid::create(&reduction_params_for(inp, reuse.as_ref(), g, plan_cap))
            })
            .collect();
        (spatial, None, reductions)
    };

    let reuse_info = match &reuse {
        Some(r) => ReuseInfo {
            operand: Some(r.reuse_operand()),
            kind: reduction_params.kind,
            sb_span: r.sb_span(),
            sb_cd_size: r.sb_cd_size(),
        },
        None => ReuseInfo::none(),
    };
    debug!(
        fcd_steps = fcd.grid_size(),
        sp_steps = spatial.grid_size(),
        reductions = reductions.len(),
        kind = ?reuse_info.kind,
        "built plan grids"
    );
    Ok(PlanGrids { fcd, spatial, conv, reductions, reuse: reuse_info })
}
