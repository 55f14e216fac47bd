use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::footprint::SensorFootprint;
use crate::PlanError;

/// A single stop of the stage: distance from the disc center along the
/// linear axis and rotation of the turntable axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapturePosition {
    pub radius: f64,
    pub angle_degrees: f64,
}

impl CapturePosition {
    pub const CENTER: CapturePosition = CapturePosition {
        radius: 0.0,
        angle_degrees: 0.0,
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ring {
    pub radius: f64,
    /// Stops in traversal order.
    pub stops: Vec<CapturePosition>,
}

/// Concentric capture positions covering a disc, in the order they are shot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingPlan {
    rings: Vec<Ring>,
}

impl RingPlan {
    pub fn rings(&self) -> &[Ring] {
        &self.rings
    }

    /// Total number of captures.
    pub fn len(&self) -> usize {
        self.rings.iter().map(|r| r.stops.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(ring_index, stop_index, position)` in traversal order.
    pub fn positions(&self) -> impl Iterator<Item = (usize, usize, CapturePosition)> + '_ {
        self.rings.iter().enumerate().flat_map(|(i, ring)| {
            ring.stops
                .iter()
                .enumerate()
                .map(move |(j, stop)| (i, j, *stop))
        })
    }

    pub fn outer_radius(&self) -> f64 {
        self.rings.last().map(|r| r.radius).unwrap_or(0.0)
    }
}

fn check_positive(name: &'static str, value: f64) -> Result<(), PlanError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(PlanError::InvalidInput { name, value })
    }
}

/// Computes the rings needed to cover a disc of `diameter` with captures of
/// size `footprint`.
///
/// Ring 0 is the center capture. Ring `i` sits at `i * footprint.height`; its
/// stop count is derived from the circumference through the sensor's outer
/// edge, not its center, so there are no gaps at the outside of a ring. Odd
/// rings are walked backwards so the turntable never unwinds a full turn
/// between rings.
pub fn compute_ring_plan(diameter: f64, footprint: SensorFootprint) -> Result<RingPlan, PlanError> {
    check_positive("diameter", diameter)?;
    check_positive("footprint width", footprint.width)?;
    check_positive("footprint height", footprint.height)?;

    // ring 0 covers the center, so only half a sensor is left to the edge
    let num_rings = ((diameter - footprint.height) / 2.0 / footprint.height).ceil();
    let num_rings = if num_rings < 1.0 { 1 } else { num_rings as usize };

    let rings = (0..num_rings)
        .map(|i| {
            let radius = i as f64 * footprint.height;
            if i == 0 {
                return Ring {
                    radius,
                    stops: vec![CapturePosition::CENTER],
                };
            }

            let circumference = 2.0 * PI * (radius + footprint.height / 2.0);
            let stop_count = (circumference / footprint.width).ceil() as usize;
            let mut stops: Vec<CapturePosition> = (0..stop_count)
                .map(|j| CapturePosition {
                    radius,
                    angle_degrees: j as f64 / stop_count as f64 * 360.0,
                })
                .collect();
            if i % 2 == 1 {
                stops.reverse();
            }
            Ring { radius, stops }
        })
        .collect();

    Ok(RingPlan { rings })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    fn stop_counts(plan: &RingPlan) -> Vec<usize> {
        plan.rings().iter().map(|r| r.stops.len()).collect()
    }

    #[test]
    fn reference_table() {
        let plan = compute_ring_plan(60.0, SensorFootprint::new(3.5, 2.6)).unwrap();
        assert_eq!(
            stop_counts(&plan),
            vec![1, 8, 12, 17, 22, 26, 31, 36, 40, 45, 50, 54]
        );
        assert_eq!(plan.len(), 342);
        assert_abs_diff_eq!(plan.outer_radius(), 28.6, epsilon = 1e-9);
    }

    #[test]
    fn rig_defaults_match_reference_table() {
        let footprint = SensorFootprint::new(3.6, 2.7).shrunk(0.1);
        let plan = compute_ring_plan(60.0, footprint).unwrap();
        assert_eq!(plan.rings().len(), 12);
        assert_eq!(stop_counts(&plan)[1], 8);
    }

    #[test]
    fn center_ring_is_single_stop() {
        let plan = compute_ring_plan(60.0, SensorFootprint::new(3.5, 2.6)).unwrap();
        assert_eq!(plan.rings()[0].stops, vec![CapturePosition::CENTER]);
    }

    #[test]
    fn footprint_taller_than_disc_yields_center_only() {
        let plan = compute_ring_plan(2.0, SensorFootprint::new(3.5, 2.6)).unwrap();
        assert_eq!(plan.rings().len(), 1);
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn odd_rings_are_reversed() {
        let plan = compute_ring_plan(60.0, SensorFootprint::new(3.5, 2.6)).unwrap();
        let ring1 = &plan.rings()[1].stops;
        assert_abs_diff_eq!(ring1[0].angle_degrees, 315.0, epsilon = 1e-9);
        assert_abs_diff_eq!(ring1[7].angle_degrees, 0.0, epsilon = 1e-9);
        let ring2 = &plan.rings()[2].stops;
        assert_abs_diff_eq!(ring2[0].angle_degrees, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(ring2[1].angle_degrees, 30.0, epsilon = 1e-9);
    }

    #[test]
    fn positions_follow_traversal_order() {
        let plan = compute_ring_plan(10.0, SensorFootprint::new(3.5, 2.6)).unwrap();
        let positions: Vec<_> = plan.positions().collect();
        assert_eq!(positions.len(), plan.len());
        assert_eq!(positions[0], (0, 0, CapturePosition::CENTER));
        assert_eq!(positions[1].0, 1);
        assert_eq!(positions[1].1, 0);
        assert_eq!(positions[1].2, plan.rings()[1].stops[0]);
    }

    #[test]
    fn rejects_non_positive_input() {
        assert!(compute_ring_plan(0.0, SensorFootprint::new(3.5, 2.6)).is_err());
        assert!(compute_ring_plan(60.0, SensorFootprint::new(-1.0, 2.6)).is_err());
        assert!(compute_ring_plan(f64::NAN, SensorFootprint::new(3.5, 2.6)).is_err());
    }

    proptest! {
        #[test]
        fn ring_count_matches_formula(diameter in 1.0..200.0f64, w in 0.5..10.0f64, h in 0.5..10.0f64) {
            prop_assume!(diameter > h);
            let plan = compute_ring_plan(diameter, SensorFootprint::new(w, h)).unwrap();
            let expected = ((diameter - h) / 2.0 / h).ceil() as usize;
            prop_assert_eq!(plan.rings().len(), expected.max(1));
            prop_assert_eq!(&plan.rings()[0].stops, &vec![CapturePosition::CENTER]);
        }

        #[test]
        fn stops_share_ring_radius(diameter in 1.0..200.0f64, w in 0.5..10.0f64, h in 0.5..10.0f64) {
            let plan = compute_ring_plan(diameter, SensorFootprint::new(w, h)).unwrap();
            let mut previous = -1.0;
            for (i, ring) in plan.rings().iter().enumerate() {
                prop_assert!(ring.radius > previous);
                previous = ring.radius;
                for stop in &ring.stops {
                    prop_assert_eq!(stop.radius, i as f64 * h);
                }
            }
        }

        #[test]
        fn stops_are_evenly_spaced(diameter in 5.0..200.0f64, w in 0.5..10.0f64, h in 0.5..10.0f64) {
            let plan = compute_ring_plan(diameter, SensorFootprint::new(w, h)).unwrap();
            for (i, ring) in plan.rings().iter().enumerate().skip(1) {
                let n = ring.stops.len();
                let step = 360.0 / n as f64;
                let mut angles: Vec<f64> = ring.stops.iter().map(|s| s.angle_degrees).collect();
                if i % 2 == 1 {
                    angles.reverse();
                }
                for (j, pair) in angles.windows(2).enumerate() {
                    prop_assert!((pair[1] - pair[0] - step).abs() < 1e-9, "ring {} gap {}", i, j);
                }
                prop_assert!(angles[0].abs() < 1e-12);
            }
        }

        #[test]
        fn odd_ring_is_exact_reverse(diameter in 5.0..200.0f64, w in 0.5..10.0f64, h in 0.5..10.0f64) {
            let plan = compute_ring_plan(diameter, SensorFootprint::new(w, h)).unwrap();
            for (i, ring) in plan.rings().iter().enumerate().skip(1) {
                let n = ring.stops.len();
                let forward: Vec<f64> = (0..n).map(|j| j as f64 / n as f64 * 360.0).collect();
                let actual: Vec<f64> = ring.stops.iter().map(|s| s.angle_degrees).collect();
                if i % 2 == 1 {
                    let reversed: Vec<f64> = forward.iter().rev().copied().collect();
                    prop_assert_eq!(actual, reversed);
                } else {
                    prop_assert_eq!(actual, forward);
                }
            }
        }
    }
}
