use glam::DVec2;
use serde::{Deserialize, Serialize};

/// Four corners of a projected sensor footprint, clockwise from top-left.
pub type Quad = [DVec2; 4];

/// Rectangular area covered by one capture, in millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorFootprint {
    pub width: f64,
    pub height: f64,
}

impl SensorFootprint {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Shrinks both sides by `margin` so neighbouring captures overlap.
    pub fn shrunk(&self, margin: f64) -> Self {
        Self {
            width: self.width - margin,
            height: self.height - margin,
        }
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            width: self.width * factor,
            height: self.height * factor,
        }
    }
}

/// Rotates `p` about `pivot` by `angle_degrees`.
pub fn rotate_point(p: DVec2, angle_degrees: f64, pivot: DVec2) -> DVec2 {
    let (s, c) = angle_degrees.to_radians().sin_cos();
    let d = p - pivot;
    DVec2::new(d.x * c - d.y * s, d.x * s + d.y * c) + pivot
}

/// Footprint of a capture taken at (`radius`, `angle_degrees`).
///
/// The sensor rectangle sits at `(0, radius)` before rotation, i.e. offset on
/// the y axis only. Its corners are rotated about the origin and only then
/// translated by `center`, so `center` places the disc on a canvas without
/// affecting the rotation.
pub fn projected_footprint(
    radius: f64,
    angle_degrees: f64,
    footprint: SensorFootprint,
    center: DVec2,
) -> Quad {
    let half_w = footprint.width / 2.0;
    let half_h = footprint.height / 2.0;
    let corners = [
        DVec2::new(-half_w, radius - half_h),
        DVec2::new(half_w, radius - half_h),
        DVec2::new(half_w, radius + half_h),
        DVec2::new(-half_w, radius + half_h),
    ];
    corners.map(|p| rotate_point(p, angle_degrees, DVec2::ZERO) + center)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    fn assert_quad_eq(a: &Quad, b: &Quad, epsilon: f64) {
        for (p, q) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(p.x, q.x, epsilon = epsilon);
            assert_abs_diff_eq!(p.y, q.y, epsilon = epsilon);
        }
    }

    #[test]
    fn unrotated_footprint_is_axis_aligned() {
        let quad = projected_footprint(27.0, 0.0, SensorFootprint::new(3.6, 2.7), DVec2::ZERO);
        let expected = [
            DVec2::new(-1.8, 25.65),
            DVec2::new(1.8, 25.65),
            DVec2::new(1.8, 28.35),
            DVec2::new(-1.8, 28.35),
        ];
        assert_quad_eq(&quad, &expected, 1e-12);

        let centroid = quad.iter().copied().sum::<DVec2>() / 4.0;
        assert_abs_diff_eq!(centroid.x, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(centroid.y, 27.0, epsilon = 1e-12);
    }

    #[test]
    fn center_only_translates() {
        let footprint = SensorFootprint::new(36.0, 27.0);
        let center = DVec2::new(550.0, 550.0);
        let at_origin = projected_footprint(270.0, 45.0, footprint, DVec2::ZERO);
        let on_canvas = projected_footprint(270.0, 45.0, footprint, center);
        assert_quad_eq(&at_origin.map(|p| p + center), &on_canvas, 1e-9);
    }

    #[test]
    fn quarter_turn_moves_sensor_to_negative_x() {
        let quad = projected_footprint(10.0, 90.0, SensorFootprint::new(2.0, 2.0), DVec2::ZERO);
        let centroid = quad.iter().copied().sum::<DVec2>() / 4.0;
        assert_abs_diff_eq!(centroid.x, -10.0, epsilon = 1e-12);
        assert_abs_diff_eq!(centroid.y, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn shrunk_subtracts_margin_from_both_sides() {
        let f = SensorFootprint::new(3.6, 2.7).shrunk(0.1);
        assert_abs_diff_eq!(f.width, 3.5, epsilon = 1e-12);
        assert_abs_diff_eq!(f.height, 2.6, epsilon = 1e-12);
    }

    proptest! {
        #[test]
        fn rotation_round_trips(
            radius in 0.0..500.0f64,
            angle in -720.0..720.0f64,
            w in 0.1..50.0f64,
            h in 0.1..50.0f64,
            cx in -100.0..100.0f64,
            cy in -100.0..100.0f64,
        ) {
            let center = DVec2::new(cx, cy);
            let footprint = SensorFootprint::new(w, h);
            let unrotated = projected_footprint(radius, 0.0, footprint, center);
            let rotated = projected_footprint(radius, angle, footprint, center);
            let back = rotated.map(|p| rotate_point(p, -angle, center));
            assert_quad_eq(&back, &unrotated, 1e-9);
        }

        #[test]
        fn rotation_preserves_side_lengths(radius in 0.0..500.0f64, angle in 0.0..360.0f64) {
            let footprint = SensorFootprint::new(3.5, 2.6);
            let quad = projected_footprint(radius, angle, footprint, DVec2::ZERO);
            prop_assert!((quad[0].distance(quad[1]) - 3.5).abs() < 1e-9);
            prop_assert!((quad[1].distance(quad[2]) - 2.6).abs() < 1e-9);
        }
    }
}
