//! Execution-plan generator for the MME matrix-multiplication engine.
//!
//! A *recipe* is the complete walk of one layer over the engine: how the
//! output splits into tiles, how the contracted extent splits into
//! accumulation steps, which operand (if any) parks in the staging buffer,
//! and the accumulator programming for every descriptor.
//!
//! The entry point is [`RecipeGenerator`]: feed it a [`LayerParams`] and a
//! capability profile from [`mme_hal`], get an [`MmeRecipe`] back, then
//! walk it through a [`DescriptorSink`].
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`params`] | Layer description: operation, operand views, strategy |
//! | [`geometry`] | Geometry resolution and engine/core port grids |
//! | [`grid`] | Balanced work grids and reduction grids |
//! | [`reuse`] | Staging-buffer reuse planning |
//! | [`plan`] | Per-axis grid assembly |
//! | [`subview`] | Grid materialization into concrete offsets |
//! | [`recipe`] | The finished recipe and its walk order |
//! | [`generator`] | Strategy resolution and recipe assembly |
//! | [`error`] | Error type shared across the crate |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod error;
pub mod generator;
pub mod geometry;
pub mod grid;
pub mod params;
pub mod plan;
pub mod recipe;
pub mod reuse;
pub mod subview;

pub use error::{RecipeError, Result};
pub use generator::{AccumSpec, DescriptorSink, RecipeGenerator};
pub use params::{
    AuxViews, LayerParams, OpType, Operand, SizeArray, Strategy, TensorView, Toggle, WalkPattern,
    MAX_DIMS,
};
pub use recipe::{MmeRecipe, MultiDimSubView, RecipePosition, SingleDimSubView};
