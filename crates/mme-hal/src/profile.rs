//! Per-generation capability profile.
//!
//! One [`MmeHal`] value captures every fact a scheduling decision needs
//! from the silicon. Consumers take `&MmeHal` and stay generation-blind;
//! the two shipped profiles differ where the silicon differs:
//!
//! | Field | v1 | v2 |
//! |-------|----|----|
//! | cache line | 64 B | 128 B |
//! | SB depth per port | 256 CLs | 512 CLs |
//! | accumulators | 2 | 4 |
//! | engines per chip | 1 | 2 |
//! | conv partial at template start | no (legacy polarity) | yes |
//! | 2-D reuse / TE acceleration | no | yes |

use crate::geometry::{DataType, Geometry};

/// Engine generation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipGeneration {
    /// First-generation engine.
    V1,
    /// Second-generation engine.
    V2,
}

/// Hardware capability profile of one engine generation.
///
/// All magnitudes are in bytes or element counts; nothing here depends on
/// a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmeHal {
    /// Which generation this profile describes.
    pub generation: ChipGeneration,
    /// Engine cache-line size in bytes.
    pub cl_bytes: u64,
    /// Memory-subsystem cache-line size in bytes.
    pub memory_cl_bytes: u64,
    /// Staging-buffer depth per port, in cache lines.
    pub sb_cls_per_port: u64,
    /// Output accumulators per core.
    pub accums_nr: u64,
    /// Hard cap on staging-buffer reuse repetitions (descriptor field width).
    pub max_sb_reuse_steps: u64,
    /// Compute cores per engine.
    pub cores_per_mme: u64,
    /// Engines per chip.
    pub mmes_nr: u64,
    /// Input read ports per core, per operand.
    pub input_ports_per_core: u64,
    /// Output write ports per core.
    pub output_ports_per_core: u64,
    /// Maximum step count of a one-byte descriptor loop counter.
    pub loop_steps_max: u64,
    /// Whether the partial step of a convolution grid template sits at the
    /// template start. The legacy generation reverses this and treats the
    /// last step as partial.
    pub conv_partial_at_start: bool,
    /// Whether per-sub-view (2-D) staging-buffer reuse is available.
    pub supports_2d_reuse: bool,
    /// Whether the transpose engine can pack rows to accelerate transposes.
    pub supports_te_acceleration: bool,
}

impl MmeHal {
    /// First-generation profile.
    #[must_use]
    pub const fn v1() -> Self {
        Self {
            generation: ChipGeneration::V1,
            cl_bytes: 64,
            memory_cl_bytes: 64,
            sb_cls_per_port: 256,
            accums_nr: 2,
            max_sb_reuse_steps: 240,
            cores_per_mme: 2,
            mmes_nr: 1,
            input_ports_per_core: 2,
            output_ports_per_core: 1,
            loop_steps_max: 256,
            conv_partial_at_start: false,
            supports_2d_reuse: false,
            supports_te_acceleration: false,
        }
    }

    /// Second-generation profile.
    #[must_use]
    pub const fn v2() -> Self {
        Self {
            generation: ChipGeneration::V2,
            cl_bytes: 128,
            memory_cl_bytes: 64,
            sb_cls_per_port: 512,
            accums_nr: 4,
            max_sb_reuse_steps: 240,
            cores_per_mme: 2,
            mmes_nr: 2,
            input_ports_per_core: 2,
            output_ports_per_core: 1,
            loop_steps_max: 256,
            conv_partial_at_start: true,
            supports_2d_reuse: true,
            supports_te_acceleration: true,
        }
    }

    /// Cache line in elements of `dt`.
    #[must_use]
    pub const fn cl_elems(&self, dt: DataType) -> u64 {
        self.cl_bytes / dt.size_bytes()
    }

    /// EU-facing width of one input port, in elements. 8-bit inputs feed a
    /// full cache line per cycle, wider types half of one.
    #[must_use]
    pub const fn input_port_elems(&self, dt: DataType) -> u64 {
        if dt.is_fp8() {
            self.cl_bytes / dt.size_bytes()
        } else {
            self.cl_bytes / 2 / dt.size_bytes()
        }
    }

    /// Width of one output port, in elements.
    #[must_use]
    pub const fn output_port_elems(&self, dt: DataType) -> u64 {
        self.cl_bytes / dt.size_bytes()
    }

    /// EU edge length per core, in elements of `dt`. The array is square;
    /// the same figure serves as per-core width and height.
    #[must_use]
    pub const fn eu_elems(&self, dt: DataType) -> u64 {
        2 * self.cl_bytes / dt.size_bytes()
    }

    /// Transpose-engine row height, in elements.
    #[must_use]
    pub const fn te_height_elems(&self, dt: DataType) -> u64 {
        self.cl_bytes / 2 / dt.size_bytes()
    }

    /// Required alignment of a contracted-dimension split, in elements.
    #[must_use]
    pub const fn cd_alignment_elems(&self, dt: DataType) -> u64 {
        self.memory_cl_bytes / dt.size_bytes()
    }

    /// Staging-buffer capacity per port, in elements of `dt`.
    #[must_use]
    pub const fn sb_elems_per_port(&self, dt: DataType) -> u64 {
        self.sb_cls_per_port * self.cl_bytes / dt.size_bytes()
    }

    /// Total compute cores on the chip.
    #[must_use]
    pub const fn cores_nr(&self) -> u64 {
        self.cores_per_mme * self.mmes_nr
    }

    /// Core arrangement for `geometry`, as `(core_fcd, core_spatial)` within
    /// one engine and `(chip_fcd, chip_spatial)` across engines.
    ///
    /// `mme_limit` caps how many engines participate (0 means no cap).
    #[must_use]
    pub fn geometry_grid(&self, geometry: Geometry, mme_limit: u64) -> (u64, u64, u64, u64) {
        let (core_fcd, core_sp) = if geometry.is_wide() {
            (self.cores_per_mme, 1)
        } else {
            (1, self.cores_per_mme)
        };
        let (mut chip_fcd, mut chip_sp) = match geometry {
            Geometry::FourXw => (self.mmes_nr, 1),
            Geometry::TwoXw => (1, self.mmes_nr),
            Geometry::TwoXh => (self.mmes_nr, 1),
            Geometry::FourXh => (1, self.mmes_nr),
        };
        let limit = if mme_limit == 0 { self.mmes_nr } else { mme_limit };
        while chip_fcd * chip_sp > limit {
            if chip_fcd >= chip_sp {
                chip_fcd /= 2;
            } else {
                chip_sp /= 2;
            }
        }
        (core_fcd, core_sp, chip_fcd, chip_sp)
    }

    /// Whether input ports of this geometry advance spatially rather than
    /// along the output width. Tall geometries always do; 8-bit inputs do
    /// regardless of shape because a port already spans a full cache line.
    #[must_use]
    pub const fn port_advance_spatially(&self, geometry: Geometry, dt: DataType) -> bool {
        geometry.is_tall() || dt.is_fp8()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_widths_scale_with_element_size() {
        let hal = MmeHal::v2();
        assert_eq!(hal.input_port_elems(DataType::Fp8_152), 128);
        assert_eq!(hal.input_port_elems(DataType::Bf16), 32);
        assert_eq!(hal.output_port_elems(DataType::Bf16), 64);
        assert_eq!(hal.eu_elems(DataType::Bf16), 128);
        assert_eq!(hal.eu_elems(DataType::Fp32), 64);
    }

    #[test]
    fn geometry_grid_products_cover_all_cores() {
        for hal in [MmeHal::v1(), MmeHal::v2()] {
            for g in [
                Geometry::FourXw,
                Geometry::TwoXw,
                Geometry::TwoXh,
                Geometry::FourXh,
            ] {
                let (cf, cs, mf, ms) = hal.geometry_grid(g, 0);
                assert_eq!(cf * cs * mf * ms, hal.cores_nr());
            }
        }
    }

    #[test]
    fn mme_limit_caps_engine_count() {
        let hal = MmeHal::v2();
        let (_, _, mf, ms) = hal.geometry_grid(Geometry::FourXw, 1);
        assert_eq!(mf * ms, 1);
    }

    #[test]
    fn generations_disagree_on_partial_polarity() {
        assert!(!MmeHal::v1().conv_partial_at_start);
        assert!(MmeHal::v2().conv_partial_at_start);
    }

    #[test]
    fn sb_capacity_in_elements() {
        let hal = MmeHal::v1();
        assert_eq!(hal.sb_elems_per_port(DataType::Bf16), 256 * 64 / 2);
    }
}
