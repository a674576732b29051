use fpcal_core::Real;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Closed interval `[min, max]` for one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub min: Real,
    pub max: Real,
}

impl Bound {
    pub fn new(min: Real, max: Real) -> Self {
        Self { min, max }
    }

    /// Unbounded on both sides.
    pub fn free() -> Self {
        Self::new(Real::NEG_INFINITY, Real::INFINITY)
    }

    #[inline]
    pub fn clamp(&self, x: Real) -> Real {
        x.clamp(self.min, self.max)
    }

    #[inline]
    pub fn contains(&self, x: Real) -> bool {
        x >= self.min && x <= self.max
    }

    /// `min <= max` and neither side is NaN.
    pub fn is_valid(&self) -> bool {
        !self.min.is_nan() && !self.max.is_nan() && self.min <= self.max
    }
}

/// Least-squares problem with a dense parameter vector.
///
/// Implementations must be pure: `residuals` may be called many times, in
/// any order, and from several threads.
pub trait BoundedProblem {
    /// Number of parameters in the optimization vector.
    fn num_params(&self) -> usize;
    /// Number of residual rows in the problem.
    fn num_residuals(&self) -> usize;

    fn residuals(&self, x: &DVector<Real>) -> DVector<Real>;

    /// Scalar figure of merit reported to callers.
    ///
    /// Defaults to the sum of squared residuals.
    fn objective(&self, x: &DVector<Real>) -> Real {
        self.residuals(x).norm_squared()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveOptions {
    /// Maximum number of solver iterations before termination.
    ///
    /// The LM backend follows the MINPACK convention and caps function
    /// evaluations at `max_iters * (n + 1)`.
    pub max_iters: usize,
    /// Relative tolerance on the objective (cost) reduction.
    pub ftol: Real,
    /// Orthogonality/gradient tolerance.
    pub gtol: Real,
    /// Relative tolerance on parameter updates.
    pub xtol: Real,
    /// Log every solve at debug level.
    pub verbose: bool,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            max_iters: 200,
            ftol: 1e-10,
            gtol: 1e-10,
            xtol: 1e-10,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveReport {
    /// Residual evaluations spent by the solver.
    pub iterations: usize,
    /// [`BoundedProblem::objective`] at the returned point.
    pub final_cost: Real,
    pub converged: bool,
    /// Human-readable termination reason.
    pub termination: String,
}

impl SolveReport {
    /// Report for a solve that had nothing to do.
    pub fn trivial(final_cost: Real) -> Self {
        Self {
            iterations: 0,
            final_cost,
            converged: true,
            termination: "nothing to optimize".to_string(),
        }
    }
}

/// Minimizer that never evaluates a problem outside the given bounds.
pub trait BoundedMinimizer {
    /// `bounds` has one entry per parameter; `x0` is clamped into them first.
    fn minimize<P: BoundedProblem + ?Sized>(
        &self,
        problem: &P,
        x0: DVector<Real>,
        bounds: &[Bound],
        opts: &SolveOptions,
    ) -> (DVector<Real>, SolveReport);
}

/// Clamp every component of `x` into its bound.
pub fn project(x: &mut DVector<Real>, bounds: &[Bound]) {
    debug_assert_eq!(x.len(), bounds.len());
    for (xi, b) in x.iter_mut().zip(bounds) {
        *xi = b.clamp(*xi);
    }
}
