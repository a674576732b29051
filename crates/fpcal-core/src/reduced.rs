//! Fixed affine laws mapping camera pixels and focal-plane millimetres into a
//! shared `[-1, 1]` frame.
//!
//! These are not configuration: stored transform coefficients are expressed in
//! this frame, so the constants must stay exactly as they are.

use crate::{Real, Vec2};

/// Half extent of the focal plane in millimetres.
pub const FP_HALF_EXTENT_MM: Real = 420.0;
/// Centre (and half range) of the fiber view camera detector in pixels.
pub const FVC_CENTER_PIX: Real = 3000.0;

/// Focal-plane `[-420, 420]` mm -> `[-1, 1]`, flipping the x axis.
#[inline]
pub fn reduce_xyfp(p: Vec2) -> Vec2 {
    Vec2::new(-p.x / FP_HALF_EXTENT_MM, p.y / FP_HALF_EXTENT_MM)
}

/// Inverse of [`reduce_xyfp`].
#[inline]
pub fn expand_xyfp(r: Vec2) -> Vec2 {
    Vec2::new(-r.x * FP_HALF_EXTENT_MM, r.y * FP_HALF_EXTENT_MM)
}

/// Camera pixels `[0, 6000]` -> `[-1, 1]`.
#[inline]
pub fn reduce_xyfvc(p: Vec2) -> Vec2 {
    Vec2::new(
        (p.x - FVC_CENTER_PIX) / FVC_CENTER_PIX,
        (p.y - FVC_CENTER_PIX) / FVC_CENTER_PIX,
    )
}

/// Inverse of [`reduce_xyfvc`].
#[inline]
pub fn expand_xyfvc(r: Vec2) -> Vec2 {
    Vec2::new((r.x + 1.0) * FVC_CENTER_PIX, (r.y + 1.0) * FVC_CENTER_PIX)
}
