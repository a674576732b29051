//! Similarity + Zhao-Burge correction fit.
//!
//! Model, in reduced coordinates:
//!
//! ```text
//! p   = a * z + b                (complex form of the similarity, z = x + iy)
//! dst = p + Σ c_k F_k(p)
//! ```
//!
//! With `a = s e^{iθ}` and `b = a * offset` the model is linear in
//! `(Re a, Im a, Re b, Im b, c_k)` once the basis is evaluated at a fixed
//! estimate of `p`. The fit starts from a similarity-only solution, then
//! alternates between solving the joint linear system and re-evaluating the
//! basis at the new `p` until `p` stops moving.

use fpcal_core::zhaoburge::{zb_terms, ZB_DEFAULT_FIT_POLIDS};
use fpcal_core::{max_abs_diff, Real, Similarity, Vec2, ZbCorrection, ZbCorrectionError};
use log::debug;
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Errors that can occur during the transform fit.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ZbFitError {
    /// Source and target point lists differ in length.
    #[error("source and target point counts differ ({0} vs {1})")]
    LengthMismatch(usize, usize),
    /// Not enough points for the number of unknowns.
    #[error("need at least {0} points, got {1}")]
    NotEnoughPoints(usize, usize),
    /// SVD failed during the linear solve.
    #[error("svd failed during transform fit")]
    SvdFailed,
    /// Degenerate solution (zero scale).
    #[error("degenerate similarity: zero scale")]
    Degenerate,
    #[error(transparent)]
    Correction(#[from] ZbCorrectionError),
}

/// Options controlling the similarity + correction fit.
#[derive(Debug, Clone, PartialEq)]
pub struct ZhaoBurgeFitOptions {
    /// Correction terms to fit, in output order.
    pub polids: Vec<u32>,
    /// Maximum number of relinearization passes.
    pub max_iters: usize,
    /// Stop once the predicted points move less than this (reduced units).
    pub tol: Real,
}

impl Default for ZhaoBurgeFitOptions {
    fn default() -> Self {
        Self {
            polids: ZB_DEFAULT_FIT_POLIDS.to_vec(),
            max_iters: 10,
            tol: 1e-13,
        }
    }
}

/// Result of [`fit_scale_rotation_offset`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleRotationOffsetFit {
    pub similarity: Similarity,
    pub correction: ZbCorrection,
    /// RMS point residual in reduced units.
    pub rms: Real,
    pub iterations: usize,
}

/// Fit the similarity alone: `dst ≈ scale * R(rotation) * (src + offset)`.
pub fn fit_similarity(src: &[Vec2], dst: &[Vec2]) -> Result<Similarity, ZbFitError> {
    check_inputs(src, dst, 0)?;
    let x = solve_joint(src, dst, None, &[])?;
    similarity_from_solution(&x)
}

/// Fit the similarity and a Zhao-Burge correction mapping `src` onto `dst`.
///
/// Both point sets are in reduced coordinates.
pub fn fit_scale_rotation_offset(
    src: &[Vec2],
    dst: &[Vec2],
    opts: &ZhaoBurgeFitOptions,
) -> Result<ScaleRotationOffsetFit, ZbFitError> {
    // validates the term list before any numeric work
    ZbCorrection::new(opts.polids.clone(), vec![0.0; opts.polids.len()])?;
    check_inputs(src, dst, opts.polids.len())?;

    let mut similarity = fit_similarity(src, dst)?;
    let mut predicted: Vec<Vec2> = src.iter().map(|&z| similarity.apply(z)).collect();
    let mut coeffs = vec![0.0; opts.polids.len()];
    let mut iterations = 0;

    for _ in 0..opts.max_iters {
        iterations += 1;
        let x = solve_joint(src, dst, Some(&predicted), &opts.polids)?;
        similarity = similarity_from_solution(&x)?;
        coeffs = x.iter().skip(4).copied().collect();

        let next: Vec<Vec2> = src.iter().map(|&z| similarity.apply(z)).collect();
        let moved = max_abs_diff(&next, &predicted);
        predicted = next;
        if moved < opts.tol {
            break;
        }
    }

    let correction = ZbCorrection::new(opts.polids.clone(), coeffs)?;
    let sum_sq: Real = src
        .iter()
        .zip(dst)
        .map(|(&z, t)| (correction.apply(similarity.apply(z)) - t).norm_squared())
        .sum();
    let rms = (sum_sq / src.len() as Real).sqrt();
    debug!(
        "zhao-burge fit: {} points, {} terms, {} iterations, rms {:.3e}",
        src.len(),
        opts.polids.len(),
        iterations,
        rms
    );

    Ok(ScaleRotationOffsetFit {
        similarity,
        correction,
        rms,
        iterations,
    })
}

fn check_inputs(src: &[Vec2], dst: &[Vec2], n_terms: usize) -> Result<(), ZbFitError> {
    if src.len() != dst.len() {
        return Err(ZbFitError::LengthMismatch(src.len(), dst.len()));
    }
    // two rows per point, 4 similarity unknowns plus one per term
    let min_points = (4 + n_terms).div_ceil(2).max(2);
    if src.len() < min_points {
        return Err(ZbFitError::NotEnoughPoints(min_points, src.len()));
    }
    Ok(())
}

/// Least-squares solution `[Re a, Im a, Re b, Im b, c_0, ...]`.
///
/// Correction columns are evaluated at `basis_at` when given.
fn solve_joint(
    src: &[Vec2],
    dst: &[Vec2],
    basis_at: Option<&[Vec2]>,
    polids: &[u32],
) -> Result<DVector<Real>, ZbFitError> {
    let n = src.len();
    let n_cols = 4 + if basis_at.is_some() { polids.len() } else { 0 };
    let mut a = DMatrix::<Real>::zeros(2 * n, n_cols);
    let mut b = DVector::<Real>::zeros(2 * n);
    let terms = zb_terms();

    for (i, (z, t)) in src.iter().zip(dst).enumerate() {
        let (rx, ry) = (2 * i, 2 * i + 1);
        // x' = ar x - ai y + br
        a[(rx, 0)] = z.x;
        a[(rx, 1)] = -z.y;
        a[(rx, 2)] = 1.0;
        // y' = ai x + ar y + bi
        a[(ry, 0)] = z.y;
        a[(ry, 1)] = z.x;
        a[(ry, 3)] = 1.0;

        if let Some(points) = basis_at {
            for (k, &id) in polids.iter().enumerate() {
                let f = terms[id as usize].eval(points[i]);
                a[(rx, 4 + k)] = f.x;
                a[(ry, 4 + k)] = f.y;
            }
        }

        b[rx] = t.x;
        b[ry] = t.y;
    }

    let svd = a.svd(true, true);
    svd.solve(&b, 1e-12).map_err(|_| ZbFitError::SvdFailed)
}

fn similarity_from_solution(x: &DVector<Real>) -> Result<Similarity, ZbFitError> {
    let (ar, ai, br, bi) = (x[0], x[1], x[2], x[3]);
    let mod2 = ar * ar + ai * ai;
    if mod2 <= Real::EPSILON * Real::EPSILON {
        return Err(ZbFitError::Degenerate);
    }
    // offset = b / a
    let offset = Vec2::new((br * ar + bi * ai) / mod2, (bi * ar - br * ai) / mod2);
    Ok(Similarity {
        scale: mod2.sqrt(),
        rotation: ai.atan2(ar),
        offset,
    })
}
