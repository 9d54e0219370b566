//! Output geometries and element types.
//!
//! A geometry names how the engine's cores tile the output: side by side
//! (wide, favouring a long first contracted-free dimension) or stacked
//! (tall, favouring a long spatial extent). The four shapes, widest first:
//!
//! | Geometry | Core arrangement |
//! |----------|------------------|
//! | `FourXw` | all cores in one row |
//! | `TwoXw`  | two wide, two tall |
//! | `TwoXh`  | two tall, two wide |
//! | `FourXh` | all cores in one column |

/// Output tiling shape of the engine's cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Geometry {
    /// All cores side by side; widest output tile.
    FourXw,
    /// Two cores wide, stacked twice.
    TwoXw,
    /// Two cores tall, side by side twice.
    TwoXh,
    /// All cores stacked; tallest output tile.
    FourXh,
}

impl Geometry {
    /// True for the wide shapes (`FourXw`, `TwoXw`).
    #[must_use]
    pub const fn is_wide(self) -> bool {
        matches!(self, Self::FourXw | Self::TwoXw)
    }

    /// True for the tall shapes where input ports advance spatially.
    #[must_use]
    pub const fn is_tall(self) -> bool {
        !self.is_wide()
    }
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::FourXw => "4xw",
            Self::TwoXw => "2xw",
            Self::TwoXh => "2xh",
            Self::FourXh => "4xh",
        })
    }
}

/// Element type of an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// 8-bit float, 1-4-3 split.
    Fp8_143,
    /// 8-bit float, 1-5-2 split.
    Fp8_152,
    /// bfloat16.
    Bf16,
    /// IEEE half.
    Fp16,
    /// IEEE single.
    Fp32,
}

impl DataType {
    /// Element width in bytes.
    #[must_use]
    pub const fn size_bytes(self) -> u64 {
        match self {
            Self::Fp8_143 | Self::Fp8_152 => 1,
            Self::Bf16 | Self::Fp16 => 2,
            Self::Fp32 => 4,
        }
    }

    /// True for either 8-bit float flavour.
    #[must_use]
    pub const fn is_fp8(self) -> bool {
        matches!(self, Self::Fp8_143 | Self::Fp8_152)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Fp8_143 => "fp8_143",
            Self::Fp8_152 => "fp8_152",
            Self::Bf16 => "bf16",
            Self::Fp16 => "fp16",
            Self::Fp32 => "fp32",
        })
    }
}
