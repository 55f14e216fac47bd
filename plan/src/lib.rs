//! Shared contract between the capture driver and the offline compositor.
//!
//! The two programs never share a process. Everything they agree on lives
//! here: where the sensor goes ([`rings`]), what area a capture covers
//! ([`footprint`]) and how a capture's position is written into its file name
//! ([`tag`]).

pub mod footprint;
pub mod logging;
pub mod rings;
pub mod tag;

pub use footprint::{projected_footprint, rotate_point, Quad, SensorFootprint};
pub use rings::{compute_ring_plan, CapturePosition, Ring, RingPlan};
pub use tag::{CalibrationTag, CaptureTag, IMAGE_EXTENSION};

/// Errors produced while planning a scan or decoding its artifacts.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("invalid {name}: {value} (must be finite and > 0)")]
    InvalidInput { name: &'static str, value: f64 },
    #[error("malformed capture file name {name:?}: {reason}")]
    MalformedTag { name: String, reason: String },
}
