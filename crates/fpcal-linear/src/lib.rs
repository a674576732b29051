//! Linear (SVD) estimators for the camera-to-focal-plane mapping.
//!
//! - [`fit_similarity`]: scale, rotation and offset only.
//! - [`fit_scale_rotation_offset`]: similarity plus a Zhao-Burge correction field.

mod zb_fit;

pub use zb_fit::*;
