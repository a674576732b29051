//! Positioner parameter definitions and the kinematic transform model.
//!
//! - [`params`]: the eight calibration keys, complete parameter sets, bounds and fit modes.
//! - [`kinematics`]: the [`KinematicModel`] trait and the two-link [`PosTransforms`] model.

pub mod kinematics;
pub mod params;

pub use kinematics::*;
pub use params::*;
