//! Silicon model for the MME matrix-multiplication engine.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the engine: supported output geometries, element types,
//! and the per-generation capability profile (port widths, staging-buffer
//! depth, accumulator count, loop-counter limits).
//!
//! Everything a scheduling decision needs from the silicon is read through
//! [`profile::MmeHal`]; code above this crate never names a generation.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`geometry`] | Output geometries (4xw..4xh), element types and widths |
//! | [`profile`] | Per-generation capability profile and derived queries |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod geometry;
pub mod profile;

pub use geometry::{DataType, Geometry};
pub use profile::{ChipGeneration, MmeHal};
