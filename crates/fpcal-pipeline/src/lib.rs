//! Calibration pipelines built on the fpcal crates.
//!
//! - [`fvc2fp`]: Zhao-Burge transform between FVC pixels and focal-plane mm.
//! - [`posparams`]: batch positioner parameter fits driven by a JSON config.
//! - [`tables`]: CSV spot, metrology and sample tables.

pub mod fvc2fp;
pub mod posparams;
pub mod tables;

pub use fvc2fp::{FitQuality, FvcFpZhaoBurge, TransformError};
pub use posparams::{fit_params_batch, fit_positioners, PositionerFit, PosparamsConfig};
pub use tables::{MetrologyRow, PosSamples, SampleRow, Spot};
