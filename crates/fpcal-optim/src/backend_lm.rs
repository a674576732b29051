use crate::numdiff::{bounded_jacobian, step};
use crate::traits::project;
use crate::{Bound, BoundedMinimizer, BoundedProblem, SolveOptions, SolveReport};
use fpcal_core::Real;
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, MinimizationReport};
use log::{debug, warn};
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn};

/// Parameters sitting on a bound whose descent direction leaves the box.
///
/// `jac` and `r` are evaluated at `x`; the gradient of `0.5 |r|^2` is
/// `jac^T r`.
fn blocked_by_bounds(
    jac: &DMatrix<Real>,
    r: &DVector<Real>,
    x: &DVector<Real>,
    bounds: &[Bound],
) -> Vec<bool> {
    let grad = jac.tr_mul(r);
    x.iter()
        .zip(bounds)
        .zip(grad.iter())
        .map(|((&xj, b), &g)| {
            let tol = step(xj);
            (xj - b.min <= tol && g > 0.0) || (b.max - xj <= tol && g < 0.0)
        })
        .collect()
}

/// Adapter that projects every trial point into the bounds before evaluation.
///
/// Jacobian columns of parameters blocked by their bound are zeroed, so the
/// step never spends its predicted reduction on a clamped direction.
/// Residuals are zero-padded to at least one row per parameter, since the LM
/// solver needs a tall Jacobian.
struct LmWrapper<'a, P: BoundedProblem + ?Sized> {
    problem: &'a P,
    bounds: &'a [Bound],
    params: DVector<Real>,
    rows: usize,
}

impl<'a, P: BoundedProblem + ?Sized> LmWrapper<'a, P> {
    fn padded(&self, r: DVector<Real>) -> DVector<Real> {
        if r.len() >= self.rows {
            r
        } else {
            r.resize_vertically(self.rows, 0.0)
        }
    }
}

impl<'a, P: BoundedProblem + ?Sized> LeastSquaresProblem<Real, Dyn, Dyn> for LmWrapper<'a, P> {
    type ResidualStorage = Owned<Real, Dyn>;
    type JacobianStorage = Owned<Real, Dyn, Dyn>;
    type ParameterStorage = Owned<Real, Dyn>;

    fn set_params(&mut self, x: &DVector<Real>) {
        self.params.clone_from(x);
        project(&mut self.params, self.bounds);
    }

    fn params(&self) -> DVector<Real> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<Real>> {
        Some(self.padded(self.problem.residuals(&self.params)))
    }

    fn jacobian(&self) -> Option<DMatrix<Real>> {
        let r0 = self.problem.residuals(&self.params);
        let mut jac = bounded_jacobian(self.problem, &self.params, &r0, self.bounds);
        let blocked = blocked_by_bounds(&jac, &r0, &self.params, self.bounds);
        for j in (0..blocked.len()).filter(|&j| blocked[j]) {
            jac.column_mut(j).fill(0.0);
        }
        if jac.nrows() >= self.rows {
            Some(jac)
        } else {
            Some(jac.resize_vertically(self.rows, 0.0))
        }
    }
}

/// `problem` with every parameter outside `free` held at its value in `base`.
struct Restricted<'a, P: ?Sized> {
    problem: &'a P,
    base: DVector<Real>,
    free: Vec<usize>,
}

impl<P: BoundedProblem + ?Sized> Restricted<'_, P> {
    fn expand(&self, sub: &DVector<Real>) -> DVector<Real> {
        let mut x = self.base.clone();
        for (&j, &v) in self.free.iter().zip(sub.iter()) {
            x[j] = v;
        }
        x
    }
}

impl<P: BoundedProblem + ?Sized> BoundedProblem for Restricted<'_, P> {
    fn num_params(&self) -> usize {
        self.free.len()
    }

    fn num_residuals(&self) -> usize {
        self.problem.num_residuals()
    }

    fn residuals(&self, x: &DVector<Real>) -> DVector<Real> {
        self.problem.residuals(&self.expand(x))
    }
}

/// Projected Levenberg-Marquardt with an active set.
///
/// Each round runs LM over the parameters that are not blocked by their
/// bound, then recomputes the blocked set at the new point. Parameters whose
/// gradient points back into the box are released. The solve ends once the
/// blocked set no longer changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct LmBackend;

impl LmBackend {
    fn run<P: BoundedProblem + ?Sized>(
        lm: &LevenbergMarquardt<Real>,
        problem: &P,
        x0: DVector<Real>,
        bounds: &[Bound],
    ) -> (DVector<Real>, MinimizationReport<Real>) {
        let wrapper = LmWrapper {
            problem,
            bounds,
            rows: problem.num_residuals().max(x0.len()),
            params: x0,
        };
        let (wrapper, report) = lm.minimize(wrapper);
        (wrapper.params, report)
    }
}

impl BoundedMinimizer for LmBackend {
    fn minimize<P: BoundedProblem + ?Sized>(
        &self,
        problem: &P,
        mut x0: DVector<Real>,
        bounds: &[Bound],
        opts: &SolveOptions,
    ) -> (DVector<Real>, SolveReport) {
        project(&mut x0, bounds);

        if x0.is_empty() || problem.num_residuals() == 0 {
            let cost = problem.objective(&x0);
            return (x0, SolveReport::trivial(cost));
        }

        let lm = LevenbergMarquardt::new()
            .with_ftol(opts.ftol)
            .with_xtol(opts.xtol)
            .with_gtol(opts.gtol)
            .with_patience(opts.max_iters.max(1));

        let n = x0.len();
        let mut x = x0;
        let mut blocked = vec![false; n];
        let mut evaluations = 0;
        let mut converged = true;
        let mut termination = String::from("all parameters on an active bound");

        for round in 0..=2 * n {
            let free: Vec<usize> = (0..n).filter(|&j| !blocked[j]).collect();
            if !free.is_empty() {
                let sub_bounds: Vec<Bound> = free.iter().map(|&j| bounds[j]).collect();
                let sub_x0 = DVector::from_iterator(free.len(), free.iter().map(|&j| x[j]));
                let sub = Restricted {
                    problem,
                    base: x.clone(),
                    free,
                };
                let (sub_x, report) = Self::run(&lm, &sub, sub_x0, &sub_bounds);
                x = sub.expand(&sub_x);
                evaluations += report.number_of_evaluations;
                converged = report.termination.was_successful();
                termination = format!("{:?}", report.termination);
            }

            let r = problem.residuals(&x);
            let jac = bounded_jacobian(problem, &x, &r, bounds);
            let next = blocked_by_bounds(&jac, &r, &x, bounds);
            if next == blocked {
                break;
            }
            debug!("active set changed after round {round}: {next:?}");
            blocked = next;
        }

        let final_cost = problem.objective(&x);
        if !converged {
            warn!(
                "LM terminated without convergence after {} evaluations: {}",
                evaluations, termination
            );
        } else if opts.verbose {
            debug!(
                "LM converged after {} evaluations (cost {:.3e}): {}",
                evaluations, final_cost, termination
            );
        }

        (
            x,
            SolveReport {
                iterations: evaluations,
                final_cost,
                converged,
                termination,
            },
        )
    }
}
