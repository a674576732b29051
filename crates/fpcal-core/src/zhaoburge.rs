//! Zhao-Burge style vector polynomials on the unit disk.
//!
//! Each term is a 2D vector field built from a Zernike polynomial `Z_n^m`:
//!
//! - **S** terms: the gradient `∇Z`, curl free.
//! - **T** terms: the gradient rotated by +90°, `(-∂Z/∂y, ∂Z/∂x)`, divergence free.
//!   Only defined for `m < n`; for `m = n` the rotated gradient duplicates an S term.
//!
//! Fields are scaled by `N / sqrt(2n(n+1))` with `N` the Zernike normalization,
//! which makes the two first-order S terms the unit vectors.
//!
//! Term identifiers are positions in a fixed table ordered by radial order `n`,
//! then S before T, then `m` ascending, then cosine before sine. The table is
//! part of the persisted format: identifiers must never be renumbered.
//!
//! | ids | n | content |
//! |-----|---|---------|
//! | 0–1 | 1 | offsets |
//! | 2–5 | 2 | scale (2), shears (3, 4), rotation (5) |
//! | 6–11 | 3 | quadratic fields |
//! | 12–19 | 4 | cubic fields |
//! | 20–29 | 5 | quartic fields |
//! | 30–41 | 6 | quintic fields |

use crate::{max_abs_diff, Real, Rot2, Vec2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// Highest Zernike radial order in the term table.
pub const ZB_MAX_ORDER: u32 = 6;

/// Iteration cap for [`ZbCorrection::remove`].
pub const ZB_INVERSE_MAX_ITERS: usize = 20;
/// Convergence threshold (max absolute change, reduced units) for [`ZbCorrection::remove`].
pub const ZB_INVERSE_TOL: Real = 1e-12;

/// Term list implied by version-1 transform files.
pub const ZB_LEGACY_POLIDS: [u32; 8] = [2, 5, 6, 9, 20, 28, 29, 30];

/// Terms fitted by default: everything up to `n = 4` except the offset,
/// scale and rotation fields, which the similarity transform already covers.
pub const ZB_DEFAULT_FIT_POLIDS: [u32; 16] = [3, 4, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19];

/// Polynomial in `x, y` stored as `(px, py) -> coefficient`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Poly2 {
    terms: BTreeMap<(u32, u32), Real>,
}

impl Poly2 {
    pub fn monomial(coeff: Real, px: u32, py: u32) -> Self {
        let mut p = Self::default();
        p.add_term(coeff, px, py);
        p
    }

    pub fn add_term(&mut self, coeff: Real, px: u32, py: u32) {
        if coeff != 0.0 {
            *self.terms.entry((px, py)).or_insert(0.0) += coeff;
        }
    }

    pub fn add(&self, other: &Poly2) -> Poly2 {
        let mut out = self.clone();
        for (&(px, py), &c) in &other.terms {
            out.add_term(c, px, py);
        }
        out
    }

    pub fn mul(&self, other: &Poly2) -> Poly2 {
        let mut out = Poly2::default();
        for (&(ax, ay), &ac) in &self.terms {
            for (&(bx, by), &bc) in &other.terms {
                out.add_term(ac * bc, ax + bx, ay + by);
            }
        }
        out
    }

    pub fn scale(&self, s: Real) -> Poly2 {
        Poly2 {
            terms: self.terms.iter().map(|(&k, &c)| (k, c * s)).collect(),
        }
    }

    pub fn d_dx(&self) -> Poly2 {
        let mut out = Poly2::default();
        for (&(px, py), &c) in &self.terms {
            if px > 0 {
                out.add_term(c * px as Real, px - 1, py);
            }
        }
        out
    }

    pub fn d_dy(&self) -> Poly2 {
        let mut out = Poly2::default();
        for (&(px, py), &c) in &self.terms {
            if py > 0 {
                out.add_term(c * py as Real, px, py - 1);
            }
        }
        out
    }

    pub fn eval(&self, x: Real, y: Real) -> Real {
        self.terms
            .iter()
            .map(|(&(px, py), &c)| c * x.powi(px as i32) * y.powi(py as i32))
            .sum()
    }
}

/// Angular dependence of a Zernike term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    Cos,
    Sin,
}

/// Kind of vector field derived from a Zernike term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZbKind {
    S,
    T,
}

/// One entry of the term table.
#[derive(Debug, Clone)]
pub struct ZbTerm {
    pub kind: ZbKind,
    pub n: u32,
    pub m: u32,
    pub parity: Parity,
    fx: Poly2,
    fy: Poly2,
}

impl ZbTerm {
    #[inline]
    pub fn eval(&self, p: Vec2) -> Vec2 {
        Vec2::new(self.fx.eval(p.x, p.y), self.fy.eval(p.x, p.y))
    }
}

impl fmt::Display for ZbTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ZbKind::S => 'S',
            ZbKind::T => 'T',
        };
        let m = match self.parity {
            Parity::Cos => self.m as i64,
            Parity::Sin => -(self.m as i64),
        };
        write!(f, "{kind}({},{m})", self.n)
    }
}

fn factorial(k: u32) -> Real {
    (1..=k).map(Real::from).product()
}

fn binomial(n: u32, k: u32) -> Real {
    factorial(n) / (factorial(k) * factorial(n - k))
}

/// Zernike polynomial `Z_n^{±m}` (unnormalized) in cartesian form.
fn zernike(n: u32, m: u32, parity: Parity) -> Poly2 {
    // r^m cos(m θ) = Re((x + iy)^m), r^m sin(m θ) = Im((x + iy)^m)
    let mut angular = Poly2::default();
    for j in 0..=m {
        let wanted = match parity {
            Parity::Cos => j % 2 == 0,
            Parity::Sin => j % 2 == 1,
        };
        if wanted {
            let sign = if (j / 2) % 2 == 0 { 1.0 } else { -1.0 };
            angular.add_term(sign * binomial(m, j), m - j, j);
        }
    }

    // R_n^m(r) / r^m as a polynomial in s = x^2 + y^2
    let half = (n - m) / 2;
    let mut radial = Poly2::default();
    for k in 0..=half {
        let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
        let c = sign * factorial(n - k)
            / (factorial(k) * factorial((n + m) / 2 - k) * factorial(half - k));
        let q = half - k;
        for l in 0..=q {
            radial.add_term(c * binomial(q, l), 2 * l, 2 * (q - l));
        }
    }

    radial.mul(&angular)
}

fn make_term(kind: ZbKind, n: u32, m: u32, parity: Parity) -> ZbTerm {
    let norm = if m == 0 {
        Real::from(n + 1).sqrt()
    } else {
        Real::from(2 * (n + 1)).sqrt()
    };
    let z = zernike(n, m, parity).scale(norm / Real::from(2 * n * (n + 1)).sqrt());
    let (dx, dy) = (z.d_dx(), z.d_dy());
    let (fx, fy) = match kind {
        ZbKind::S => (dx, dy),
        ZbKind::T => (dy.scale(-1.0), dx),
    };
    ZbTerm {
        kind,
        n,
        m,
        parity,
        fx,
        fy,
    }
}

fn build_terms() -> Vec<ZbTerm> {
    let mut terms = Vec::new();
    for n in 1..=ZB_MAX_ORDER {
        for kind in [ZbKind::S, ZbKind::T] {
            for m in (n % 2..=n).step_by(2) {
                if kind == ZbKind::T && m == n {
                    continue;
                }
                let parities: &[Parity] = if m == 0 {
                    &[Parity::Cos]
                } else {
                    &[Parity::Cos, Parity::Sin]
                };
                for &parity in parities {
                    terms.push(make_term(kind, n, m, parity));
                }
            }
        }
    }
    terms
}

/// The full term table, indexed by term identifier.
pub fn zb_terms() -> &'static [ZbTerm] {
    static TERMS: OnceLock<Vec<ZbTerm>> = OnceLock::new();
    TERMS.get_or_init(build_terms)
}

/// Look up a term by identifier.
pub fn zb_term(polid: u32) -> Option<&'static ZbTerm> {
    zb_terms().get(polid as usize)
}

/// Errors building a [`ZbCorrection`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ZbCorrectionError {
    #[error("zbpolids and zbcoeffs differ in length ({0} vs {1})")]
    LengthMismatch(usize, usize),
    #[error("unknown Zhao-Burge term id {0} (table has {1} terms)")]
    UnknownTerm(u32, usize),
}

/// Polynomial correction field: co-indexed term identifiers and coefficients.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZbCorrection {
    polids: Vec<u32>,
    coeffs: Vec<Real>,
}

impl ZbCorrection {
    pub fn new(polids: Vec<u32>, coeffs: Vec<Real>) -> Result<Self, ZbCorrectionError> {
        if polids.len() != coeffs.len() {
            return Err(ZbCorrectionError::LengthMismatch(polids.len(), coeffs.len()));
        }
        let n_terms = zb_terms().len();
        if let Some(&bad) = polids.iter().find(|&&id| id as usize >= n_terms) {
            return Err(ZbCorrectionError::UnknownTerm(bad, n_terms));
        }
        Ok(Self { polids, coeffs })
    }

    /// Correction with no terms (identity).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn polids(&self) -> &[u32] {
        &self.polids
    }

    pub fn coeffs(&self) -> &[Real] {
        &self.coeffs
    }

    pub fn len(&self) -> usize {
        self.polids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polids.is_empty()
    }

    /// Correction vector at `p` (reduced coordinates).
    pub fn eval(&self, p: Vec2) -> Vec2 {
        let terms = zb_terms();
        self.polids
            .iter()
            .zip(&self.coeffs)
            .fold(Vec2::zeros(), |acc, (&id, &c)| {
                acc + terms[id as usize].eval(p) * c
            })
    }

    /// Correction vectors at every point.
    pub fn eval_many(&self, points: &[Vec2]) -> Vec<Vec2> {
        points.iter().map(|&p| self.eval(p)).collect()
    }

    /// `p + correction(p)`.
    pub fn apply(&self, p: Vec2) -> Vec2 {
        p + self.eval(p)
    }

    /// Undo [`apply`](Self::apply) by fixed-point iteration.
    ///
    /// The correction is evaluated where it was applied, i.e. before it was
    /// added, so `d = correction(target - d)` is iterated from `d = 0` until the
    /// largest change over all points and both axes drops below
    /// [`ZB_INVERSE_TOL`], or [`ZB_INVERSE_MAX_ITERS`] passes have run. The last
    /// estimate is used either way.
    pub fn remove(&self, targets: &[Vec2]) -> Vec<Vec2> {
        let mut d = vec![Vec2::zeros(); targets.len()];
        for _ in 0..ZB_INVERSE_MAX_ITERS {
            let next: Vec<Vec2> = targets
                .iter()
                .zip(&d)
                .map(|(t, di)| self.eval(t - di))
                .collect();
            let dmax = max_abs_diff(&next, &d);
            d = next;
            if dmax < ZB_INVERSE_TOL {
                break;
            }
        }
        targets.iter().zip(&d).map(|(t, di)| t - di).collect()
    }
}

/// Similarity transform `p = scale * R(rotation) * (x + offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Similarity {
    pub scale: Real,
    /// Radians, counter-clockwise.
    pub rotation: Real,
    pub offset: Vec2,
}

impl Default for Similarity {
    fn default() -> Self {
        Self {
            scale: 1.0,
            rotation: 0.0,
            offset: Vec2::zeros(),
        }
    }
}

impl Similarity {
    pub fn apply(&self, p: Vec2) -> Vec2 {
        Rot2::new(self.rotation) * (p + self.offset) * self.scale
    }

    /// Divide by the scale, rotate back, then remove the offset.
    pub fn invert(&self, q: Vec2) -> Vec2 {
        Rot2::new(-self.rotation) * (q / self.scale) - self.offset
    }
}

/// Forward transform in reduced coordinates: similarity, then correction.
pub fn transform(points: &[Vec2], similarity: &Similarity, correction: &ZbCorrection) -> Vec<Vec2> {
    let moved: Vec<Vec2> = points.iter().map(|&p| similarity.apply(p)).collect();
    let dp = correction.eval_many(&moved);
    moved.iter().zip(dp).map(|(p, d)| p + d).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Vec2, b: Vec2, tol: Real) {
        assert!((a - b).amax() <= tol, "{a:?} vs {b:?}");
    }

    #[test]
    fn table_layout() {
        let terms = zb_terms();
        assert_eq!(terms.len(), 42);
        let names: Vec<String> = terms[..12].iter().map(|t| t.to_string()).collect();
        assert_eq!(
            names,
            [
                "S(1,1)", "S(1,-1)", "S(2,0)", "S(2,2)", "S(2,-2)", "T(2,0)", "S(3,1)",
                "S(3,-1)", "S(3,3)", "S(3,-3)", "T(3,1)", "T(3,-1)"
            ]
        );
        for id in ZB_LEGACY_POLIDS {
            assert!(zb_term(id).is_some());
        }
        assert!(zb_term(42).is_none());
    }

    #[test]
    fn low_order_fields_have_expected_shape() {
        let p = Vec2::new(0.3, -0.7);
        close(zb_terms()[0].eval(p), Vec2::new(1.0, 0.0), 1e-15);
        close(zb_terms()[1].eval(p), Vec2::new(0.0, 1.0), 1e-15);
        // radial scale and rotation
        close(zb_terms()[2].eval(p), p * 2.0, 1e-14);
        close(zb_terms()[5].eval(p), Vec2::new(-p.y, p.x) * 2.0, 1e-14);
    }

    #[test]
    fn s_terms_are_curl_free_and_t_terms_divergence_free() {
        for term in zb_terms() {
            match term.kind {
                ZbKind::S => {
                    let curl = term.fy.d_dx().add(&term.fx.d_dy().scale(-1.0));
                    assert!(curl.eval(0.4, -0.2).abs() < 1e-10, "{term}");
                }
                ZbKind::T => {
                    let div = term.fx.d_dx().add(&term.fy.d_dy());
                    assert!(div.eval(0.4, -0.2).abs() < 1e-10, "{term}");
                }
            }
        }
    }

    #[test]
    fn correction_requires_matching_lists() {
        assert_eq!(
            ZbCorrection::new(vec![1, 2], vec![0.1]),
            Err(ZbCorrectionError::LengthMismatch(2, 1))
        );
        assert_eq!(
            ZbCorrection::new(vec![99], vec![0.1]),
            Err(ZbCorrectionError::UnknownTerm(99, 42))
        );
    }

    #[test]
    fn remove_inverts_apply() {
        let corr = ZbCorrection::new(
            ZB_LEGACY_POLIDS.to_vec(),
            vec![1e-3, -2e-3, 5e-4, 1e-4, -3e-4, 2e-4, 1e-4, -1e-4],
        )
        .unwrap();
        let points: Vec<Vec2> = (0..25)
            .map(|i| Vec2::new(-0.8 + 0.07 * i as Real, 0.6 - 0.05 * i as Real))
            .collect();
        let distorted: Vec<Vec2> = points.iter().map(|&p| corr.apply(p)).collect();
        let restored = corr.remove(&distorted);
        assert!(max_abs_diff(&restored, &points) < 1e-12);
    }

    #[test]
    fn similarity_invert_round_trips() {
        let sim = Similarity {
            scale: 0.93,
            rotation: 0.2,
            offset: Vec2::new(0.01, -0.03),
        };
        let p = Vec2::new(0.4, -0.25);
        close(sim.invert(sim.apply(p)), p, 1e-15);
    }
}
