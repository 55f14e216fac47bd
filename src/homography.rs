//! Planar homography between an image rectangle and a footprint quad.
//!
//! Four exact correspondences determine the transform, so it is solved in
//! closed form (unit square to quad, then composed with the rectangle's
//! scaling) instead of by least squares.

use glam::{DMat3, DVec2, DVec3};
use scancam_plan::Quad;

// relative to the quad's squared extent
const DEGENERATE_EPS: f64 = 1e-9;

#[derive(Debug, thiserror::Error)]
pub enum HomographyError {
    #[error("degenerate quadrilateral {0:?}: three corners are collinear")]
    Degenerate(Quad),
    #[error("source rectangle {width}x{height} is empty")]
    EmptySource { width: f64, height: f64 },
}

/// `x' ~ H x` in homogeneous coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    matrix: DMat3,
}

fn cross(o: DVec2, a: DVec2, b: DVec2) -> f64 {
    (a - o).perp_dot(b - o)
}

fn is_degenerate(quad: &Quad) -> bool {
    let extent = quad
        .iter()
        .map(|p| p.distance_squared(quad[0]))
        .fold(0.0, f64::max);
    if extent == 0.0 {
        return true;
    }
    (0..4).any(|i| {
        let (a, b, c) = (quad[i], quad[(i + 1) % 4], quad[(i + 2) % 4]);
        cross(a, b, c).abs() <= DEGENERATE_EPS * extent
    })
}

impl Homography {
    /// Maps the corners of the unit square, (0,0) (1,0) (1,1) (0,1), onto
    /// `quad` in order.
    pub fn unit_square_to_quad(quad: &Quad) -> Result<Self, HomographyError> {
        if is_degenerate(quad) {
            return Err(HomographyError::Degenerate(*quad));
        }
        let [p0, p1, p2, p3] = *quad;

        let s = p0 - p1 + p2 - p3;
        let d1 = p1 - p2;
        let d2 = p3 - p2;
        let den = d1.perp_dot(d2);
        let g = s.perp_dot(d2) / den;
        let h = d1.perp_dot(s) / den;

        let a = p1 - p0 + g * p1;
        let b = p3 - p0 + h * p3;
        let matrix = DMat3::from_cols(
            DVec3::new(a.x, a.y, g),
            DVec3::new(b.x, b.y, h),
            DVec3::new(p0.x, p0.y, 1.0),
        );
        Ok(Self { matrix })
    }

    /// Maps an image of `width` x `height` pixels onto `quad`: top-left to
    /// `quad[0]`, top-right to `quad[1]`, bottom-right to `quad[2]`,
    /// bottom-left to `quad[3]`.
    pub fn rect_to_quad(width: f64, height: f64, quad: &Quad) -> Result<Self, HomographyError> {
        if width <= 0.0 || height <= 0.0 {
            return Err(HomographyError::EmptySource { width, height });
        }
        let unit = Self::unit_square_to_quad(quad)?;
        let normalize = DMat3::from_diagonal(DVec3::new(1.0 / width, 1.0 / height, 1.0));
        Ok(Self {
            matrix: unit.matrix * normalize,
        })
    }

    pub fn apply(&self, p: DVec2) -> DVec2 {
        let v = self.matrix * p.extend(1.0);
        DVec2::new(v.x / v.z, v.y / v.z)
    }

    pub fn inverse(&self) -> Result<Self, HomographyError> {
        let det = self.matrix.determinant();
        if !det.is_finite() || det.abs() < f64::EPSILON {
            let corners = [DVec2::ZERO, DVec2::X, DVec2::ONE, DVec2::Y].map(|p| self.apply(p));
            return Err(HomographyError::Degenerate(corners));
        }
        Ok(Self {
            matrix: self.matrix.inverse(),
        })
    }

    pub fn matrix(&self) -> &DMat3 {
        &self.matrix
    }
}
