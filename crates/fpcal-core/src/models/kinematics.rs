//! Two-link positioner kinematics.
//!
//! Angles are in degrees, lengths in millimetres. Coordinate systems:
//!
//! - **posint** `(t, p)`: internally tracked joint angles.
//! - **posloc** `(t, p)`: joint angles after the zero-point offsets.
//! - **flat** `(x, y)`: cartesian frame of the kinematic model, centred on the
//!   focal plane origin.
//! - **ptl** `(x, y)`: externally measured frame; related to flat through a
//!   [`SurfaceModel`].

use crate::{wrap_at_180, ParamKey, ParamSet, Real, Vec2};
use serde::{Deserialize, Serialize};

/// Whether angle arithmetic is folded back into the travel range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeWrap {
    /// Plain arithmetic in unwrapped angle space.
    #[default]
    None,
    /// Shift theta by whole turns into the targetable range and clamp phi.
    Targetable,
}

/// Targetable ranges of the internal joint angles, degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeLimits {
    pub theta: (Real, Real),
    pub phi: (Real, Real),
}

impl Default for RangeLimits {
    fn default() -> Self {
        Self {
            theta: (-195.0, 195.0),
            phi: (-20.0, 200.0),
        }
    }
}

impl RangeLimits {
    /// Fold an internal angle pair into the targetable range.
    ///
    /// Theta is moved by ±360 only when that lands it inside the range.
    pub fn wrap(&self, tp: Vec2) -> Vec2 {
        let (t_min, t_max) = self.theta;
        let mut t = tp.x;
        while t > t_max && t - 360.0 >= t_min {
            t -= 360.0;
        }
        while t < t_min && t + 360.0 <= t_max {
            t += 360.0;
        }
        let p = tp.y.clamp(self.phi.0, self.phi.1);
        Vec2::new(t, p)
    }
}

/// Mapping between the measured (ptl) frame and the flat frame.
pub trait SurfaceModel {
    fn ptl_to_flat(&self, ptl: Vec2) -> Vec2;
    fn flat_to_ptl(&self, flat: Vec2) -> Vec2;
}

/// Planar focal surface: ptl and flat coincide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanarSurface;

impl SurfaceModel for PlanarSurface {
    #[inline]
    fn ptl_to_flat(&self, ptl: Vec2) -> Vec2 {
        ptl
    }

    #[inline]
    fn flat_to_ptl(&self, flat: Vec2) -> Vec2 {
        flat
    }
}

/// Coordinate transform model of a single positioner.
///
/// Implementations hold their full parameter set by value; cloning a model
/// gives an independent instance that shares no state with the original.
pub trait KinematicModel: Clone {
    fn params(&self) -> &ParamSet;
    fn set_param(&mut self, key: ParamKey, value: Real);

    /// Internal angles -> flat xy.
    fn posint_tp_to_flat_xy(&self, tp: Vec2) -> Vec2;

    /// Flat xy -> internal angles, plus `true` if the point is out of reach
    /// (in which case the nearest reachable point is used).
    fn flat_xy_to_posint_tp(&self, xy: Vec2) -> (Vec2, bool);

    fn ptl_xy_to_flat_xy(&self, xy: Vec2) -> Vec2;
    fn flat_xy_to_ptl_xy(&self, xy: Vec2) -> Vec2;

    /// `tp1 - tp0`.
    fn delta_posint_tp(&self, tp1: Vec2, tp0: Vec2, wrap: RangeWrap) -> Vec2;

    /// `tp0 + dtdp`.
    fn addto_posint_tp(&self, tp0: Vec2, dtdp: Vec2, wrap: RangeWrap) -> Vec2;

    fn set_params(&mut self, params: &ParamSet) {
        for (key, value) in params.iter() {
            self.set_param(key, value);
        }
    }
}

/// Two-link arm transform (`theta` arm of length `R1`, `phi` arm of length `R2`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PosTransforms<S = PlanarSurface> {
    params: ParamSet,
    limits: RangeLimits,
    surface: S,
}

impl PosTransforms<PlanarSurface> {
    /// Model on a planar surface, seeded with `params`.
    pub fn stateless(params: ParamSet) -> Self {
        Self::with_surface(params, PlanarSurface)
    }
}

impl Default for PosTransforms<PlanarSurface> {
    fn default() -> Self {
        Self::stateless(ParamSet::nominal())
    }
}

impl<S: SurfaceModel> PosTransforms<S> {
    pub fn with_surface(params: ParamSet, surface: S) -> Self {
        Self {
            params,
            limits: RangeLimits::default(),
            surface,
        }
    }

    fn posint_to_posloc(&self, tp: Vec2) -> Vec2 {
        Vec2::new(
            tp.x + self.params.get(ParamKey::OffsetT),
            tp.y + self.params.get(ParamKey::OffsetP),
        )
    }

    fn posloc_to_posint(&self, tp: Vec2) -> Vec2 {
        Vec2::new(
            tp.x - self.params.get(ParamKey::OffsetT),
            tp.y - self.params.get(ParamKey::OffsetP),
        )
    }

    fn center(&self) -> Vec2 {
        Vec2::new(
            self.params.get(ParamKey::OffsetX),
            self.params.get(ParamKey::OffsetY),
        )
    }

    /// Forward kinematics in the local (arm-centred) frame.
    fn posloc_tp_to_xy(&self, tp: Vec2) -> Vec2 {
        let r1 = self.params.get(ParamKey::LengthR1);
        let r2 = self.params.get(ParamKey::LengthR2);
        let t = tp.x.to_radians();
        let tp_sum = (tp.x + tp.y).to_radians();
        Vec2::new(
            r1 * t.cos() + r2 * tp_sum.cos(),
            r1 * t.sin() + r2 * tp_sum.sin(),
        )
    }

    /// Inverse kinematics in the local frame, elbow branch `p in [0, 180]`.
    fn xy_to_posloc_tp(&self, xy: Vec2) -> (Vec2, bool) {
        let r1 = self.params.get(ParamKey::LengthR1);
        let r2 = self.params.get(ParamKey::LengthR2);
        let r_min = (r1 - r2).abs();
        let r_max = r1 + r2;
        let r = xy.norm();
        let unreachable = r < r_min || r > r_max;
        let r = r.clamp(r_min, r_max);

        let cos_p = ((r * r - r1 * r1 - r2 * r2) / (2.0 * r1 * r2)).clamp(-1.0, 1.0);
        let p = cos_p.acos();
        let t = xy.y.atan2(xy.x) - (r2 * p.sin()).atan2(r1 + r2 * p.cos());
        (
            Vec2::new(wrap_at_180(t.to_degrees()), p.to_degrees()),
            unreachable,
        )
    }
}

impl<S: SurfaceModel + Clone> KinematicModel for PosTransforms<S> {
    fn params(&self) -> &ParamSet {
        &self.params
    }

    fn set_param(&mut self, key: ParamKey, value: Real) {
        self.params.set(key, value);
    }

    fn posint_tp_to_flat_xy(&self, tp: Vec2) -> Vec2 {
        self.posloc_tp_to_xy(self.posint_to_posloc(tp)) + self.center()
    }

    fn flat_xy_to_posint_tp(&self, xy: Vec2) -> (Vec2, bool) {
        let (posloc, unreachable) = self.xy_to_posloc_tp(xy - self.center());
        (self.posloc_to_posint(posloc), unreachable)
    }

    fn ptl_xy_to_flat_xy(&self, xy: Vec2) -> Vec2 {
        self.surface.ptl_to_flat(xy)
    }

    fn flat_xy_to_ptl_xy(&self, xy: Vec2) -> Vec2 {
        self.surface.flat_to_ptl(xy)
    }

    fn delta_posint_tp(&self, tp1: Vec2, tp0: Vec2, wrap: RangeWrap) -> Vec2 {
        let delta = tp1 - tp0;
        match wrap {
            RangeWrap::None => delta,
            RangeWrap::Targetable => self.limits.wrap(tp1) - self.limits.wrap(tp0),
        }
    }

    fn addto_posint_tp(&self, tp0: Vec2, dtdp: Vec2, wrap: RangeWrap) -> Vec2 {
        let sum = tp0 + dtdp;
        match wrap {
            RangeWrap::None => sum,
            RangeWrap::Targetable => self.limits.wrap(sum),
        }
    }
}
