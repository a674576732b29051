//! Bounded non-linear least squares and the positioner calibration problem.
//!
//! Problems implement [`BoundedProblem`]; solvers implement
//! [`BoundedMinimizer`]. The default solver is [`LmBackend`], a projected
//! Levenberg-Marquardt built on the `levenberg-marquardt` crate.

pub mod backend_lm;
pub mod numdiff;
pub mod problems;
pub mod traits;

pub use crate::backend_lm::LmBackend;
pub use crate::problems::posparams;
pub use crate::traits::{Bound, BoundedMinimizer, BoundedProblem, SolveOptions, SolveReport};
