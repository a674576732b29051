//! Finite-difference Jacobians that respect parameter bounds.

use crate::{Bound, BoundedProblem};
use fpcal_core::Real;
use nalgebra::{DMatrix, DVector};

/// Step for parameter value `x`: `sqrt(eps) * max(|x|, 1)`.
#[inline]
pub(crate) fn step(x: Real) -> Real {
    Real::EPSILON.sqrt() * x.abs().max(1.0)
}

/// Jacobian of `problem.residuals` at `x` (assumed inside `bounds`).
///
/// Central differences where both probes fit inside the bound, otherwise a
/// one-sided difference pointing into the interval. A column whose interval is
/// narrower than the step is left at zero. `r0` must be the residuals at `x`.
pub fn bounded_jacobian<P: BoundedProblem + ?Sized>(
    problem: &P,
    x: &DVector<Real>,
    r0: &DVector<Real>,
    bounds: &[Bound],
) -> DMatrix<Real> {
    let n = x.len();
    let m = r0.len();
    let mut jac = DMatrix::<Real>::zeros(m, n);
    let mut probe = x.clone();

    for j in 0..n {
        let xj = x[j];
        let h = step(xj);
        let b = bounds[j];
        let fits_up = b.contains(xj + h);
        let fits_down = b.contains(xj - h);

        let col = if fits_up && fits_down {
            probe[j] = xj + h;
            let r_up = problem.residuals(&probe);
            probe[j] = xj - h;
            let r_down = problem.residuals(&probe);
            (r_up - r_down) / (2.0 * h)
        } else if fits_up {
            probe[j] = xj + h;
            (problem.residuals(&probe) - r0) / h
        } else if fits_down {
            probe[j] = xj - h;
            (r0 - problem.residuals(&probe)) / h
        } else {
            continue;
        };
        probe[j] = xj;
        jac.set_column(j, &col);
    }
    jac
}
