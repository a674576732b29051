//! Core math and model primitives for `fpcal`.
//!
//! This crate contains:
//! - linear algebra type aliases (`Real`, `Vec2`),
//! - the positioner parameter keys, parameter sets and fit modes,
//! - the two-link kinematic transform model ([`PosTransforms`]),
//! - the Zhao-Burge vector polynomial basis used for the camera distortion field,
//! - the fixed reduced-coordinate laws for camera pixels and focal-plane millimetres.
//!
//! Kinematic chain:
//! `ptl xy <-> flat xy <-> local xy <-> local (t, p) <-> internal (t, p)`

/// Angle helpers.
pub mod angle;
/// Linear algebra type aliases.
pub mod math;
/// Positioner parameters and kinematic models.
pub mod models;
/// Reduced `[-1, 1]` coordinate laws.
pub mod reduced;
/// Deterministic synthetic data helpers.
pub mod synthetic;
/// Zhao-Burge vector polynomials and the similarity transform.
pub mod zhaoburge;

pub use angle::*;
pub use math::*;
pub use models::*;
pub use zhaoburge::{Similarity, ZbCorrection, ZbCorrectionError};
