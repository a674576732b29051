use crate::Real;

/// Wrap an angle in degrees into `(-180, 180]`.
///
/// The angle is reduced modulo 360 (floored, so the remainder is never
/// negative) and anything above 180 is shifted down by a full turn.
///
/// ```
/// use fpcal_core::wrap_at_180;
/// assert_eq!(wrap_at_180(541.0), -179.0);
/// assert_eq!(wrap_at_180(-180.0), 180.0);
/// ```
pub fn wrap_at_180(angle: Real) -> Real {
    let mut wrapped = angle.rem_euclid(360.0);
    if wrapped > 180.0 {
        wrapped -= 360.0;
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_reference_angles() {
        let cases = [
            (-540.0, 180.0),
            (-180.0, 180.0),
            (0.0, 0.0),
            (180.0, 180.0),
            (359.0, -1.0),
            (541.0, -179.0),
        ];
        for (input, expected) in cases {
            assert_eq!(wrap_at_180(input), expected, "wrap_at_180({input})");
        }
    }

    #[test]
    fn output_stays_in_half_open_interval() {
        let mut angle = -1000.0;
        while angle < 1000.0 {
            let w = wrap_at_180(angle);
            assert!(w > -180.0 && w <= 180.0, "{angle} -> {w}");
            angle += 7.3;
        }
    }

    #[test]
    fn idempotent() {
        for angle in [-179.5, -12.0, 0.25, 179.999, 180.0] {
            assert_eq!(wrap_at_180(wrap_at_180(angle)), wrap_at_180(angle));
        }
    }
}
