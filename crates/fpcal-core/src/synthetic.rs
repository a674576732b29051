//! Deterministic synthetic positioner data.
//!
//! Noise comes from a SplitMix64 stream keyed by `(seed, sample index)` so
//! datasets do not depend on any RNG crate's internals.

use crate::{KinematicModel, RangeWrap, Real, Vec2};

/// Deterministic uniform per-axis noise in `[-max_abs, +max_abs]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UniformNoise {
    pub seed: u64,
    pub max_abs: Real,
}

impl UniformNoise {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn sample(&self, idx: usize) -> Vec2 {
        let max_abs = self.max_abs.abs();
        if max_abs == 0.0 {
            return Vec2::zeros();
        }
        let key = self.seed ^ (idx as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let u = u64_to_unit_f64(splitmix64(key));
        let v = u64_to_unit_f64(splitmix64(key ^ 0x94D0_49BB_1331_11EB));
        Vec2::new((u - 0.5) * 2.0 * max_abs, (v - 0.5) * 2.0 * max_abs)
    }
}

#[inline]
fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[inline]
fn u64_to_unit_f64(x: u64) -> Real {
    // top 53 bits -> [0, 1)
    (x >> 11) as Real / (1u64 << 53) as Real
}

/// Internal angle pairs sweeping theta over a full turn at several phi values.
///
/// Produces `n_theta * n_phi` points, phi major. Phi stays inside `(0, 180)`
/// so the arm never folds flat.
pub fn posint_sweep(n_theta: usize, n_phi: usize) -> Vec<Vec2> {
    let mut out = Vec::with_capacity(n_theta * n_phi);
    for j in 0..n_phi {
        let phi = 20.0 + 140.0 * (j as Real + 0.5) / n_phi.max(1) as Real;
        for i in 0..n_theta {
            let theta = -170.0 + 340.0 * i as Real / n_theta.max(1) as Real;
            out.push(Vec2::new(theta, phi));
        }
    }
    out
}

/// Measured (ptl) positions for commanded angles under a static geometry.
pub fn static_samples<M: KinematicModel>(
    model: &M,
    posint: &[Vec2],
    noise: &UniformNoise,
) -> Vec<Vec2> {
    posint
        .iter()
        .enumerate()
        .map(|(i, &tp)| model.flat_xy_to_ptl_xy(model.posint_tp_to_flat_xy(tp)) + noise.sample(i))
        .collect()
}

/// Measured (ptl) positions for a sequence of moves whose achieved rotation is
/// `scales` times the commanded one.
///
/// The first commanded position is taken as achieved exactly.
pub fn dynamic_samples<M: KinematicModel>(
    model: &M,
    commanded: &[Vec2],
    scales: Vec2,
    noise: &UniformNoise,
) -> Vec<Vec2> {
    let mut out = Vec::with_capacity(commanded.len());
    let mut actual = match commanded.first() {
        Some(&tp) => tp,
        None => return out,
    };
    for (i, &tp) in commanded.iter().enumerate() {
        if i > 0 {
            let delta = model.delta_posint_tp(tp, commanded[i - 1], RangeWrap::None);
            actual = model.addto_posint_tp(actual, delta.component_mul(&scales), RangeWrap::None);
        }
        let flat = model.posint_tp_to_flat_xy(actual);
        out.push(model.flat_xy_to_ptl_xy(flat) + noise.sample(i));
    }
    out
}
