use nalgebra::{Rotation2, Vector2};

/// Scalar type used throughout the library (currently `f64`).
pub type Real = f64;

/// 2D vector with [`Real`] components.
///
/// Used both for cartesian points `(x, y)` and for angle pairs `(theta, phi)`.
pub type Vec2 = Vector2<Real>;
/// 2D rotation using [`Real`].
pub type Rot2 = Rotation2<Real>;

/// Largest absolute component difference between two point sets.
///
/// Returns `0.0` for empty inputs.
pub fn max_abs_diff(a: &[Vec2], b: &[Vec2]) -> Real {
    a.iter()
        .zip(b)
        .map(|(p, q)| (p - q).amax())
        .fold(0.0, Real::max)
}
