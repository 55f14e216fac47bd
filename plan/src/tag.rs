//! File names are the only record of where a capture was taken, so they are
//! modelled as a serialize/parse pair rather than formatted ad hoc.
//!
//! Scan captures: `{sequence:05}-{ring:05}-{stop:05}_{radius:06.3}_{angle:06.3}.jpg`
//! Calibration captures: `calibrate_{endstop:06.2}_{index:05}_{radius:06.3}_{angle:06.3}.jpg`

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::rings::CapturePosition;
use crate::PlanError;

pub const IMAGE_EXTENSION: &str = "jpg";

const CALIBRATION_PREFIX: &str = "calibrate_";

/// Metadata of one scan capture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureTag {
    /// 1-based position in the whole scan.
    pub sequence: u32,
    pub ring: u32,
    /// Index within the ring, in traversal order.
    pub stop: u32,
    pub radius: f64,
    pub angle_degrees: f64,
}

impl CaptureTag {
    pub fn position(&self) -> CapturePosition {
        CapturePosition {
            radius: self.radius,
            angle_degrees: self.angle_degrees,
        }
    }

    pub fn file_name(&self) -> String {
        self.to_string()
    }

    pub fn from_path(path: &Path) -> Result<Self, PlanError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| malformed(&path.display().to_string(), "not a UTF-8 file name"))?;
        name.parse()
    }
}

impl fmt::Display for CaptureTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:05}-{:05}-{:05}_{:06.3}_{:06.3}.{}",
            self.sequence, self.ring, self.stop, self.radius, self.angle_degrees, IMAGE_EXTENSION
        )
    }
}

impl FromStr for CaptureTag {
    type Err = PlanError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let stem = strip_extension(name)?;
        let fields: Vec<&str> = stem.split('_').collect();
        let [indices, radius, angle] = fields[..] else {
            return Err(malformed(name, "expected 3 '_'-separated fields"));
        };
        let indices: Vec<&str> = indices.split('-').collect();
        let [sequence, ring, stop] = indices[..] else {
            return Err(malformed(name, "expected sequence-ring-stop"));
        };

        Ok(CaptureTag {
            sequence: parse_field(name, "sequence", sequence)?,
            ring: parse_field(name, "ring", ring)?,
            stop: parse_field(name, "stop", stop)?,
            radius: parse_field(name, "radius", radius)?,
            angle_degrees: parse_field(name, "angle", angle)?,
        })
    }
}

/// Metadata of a calibration-mode capture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTag {
    pub endstop_distance: f64,
    pub index: u32,
    pub radius: f64,
    pub angle_degrees: f64,
}

impl CalibrationTag {
    pub fn file_name(&self) -> String {
        self.to_string()
    }

    pub fn matches(name: &str) -> bool {
        name.starts_with(CALIBRATION_PREFIX)
    }
}

impl fmt::Display for CalibrationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:06.2}_{:05}_{:06.3}_{:06.3}.{}",
            CALIBRATION_PREFIX,
            self.endstop_distance,
            self.index,
            self.radius,
            self.angle_degrees,
            IMAGE_EXTENSION
        )
    }
}

impl FromStr for CalibrationTag {
    type Err = PlanError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let stem = strip_extension(name)?;
        let rest = stem
            .strip_prefix(CALIBRATION_PREFIX)
            .ok_or_else(|| malformed(name, "missing calibrate_ prefix"))?;
        let fields: Vec<&str> = rest.split('_').collect();
        let [endstop, index, radius, angle] = fields[..] else {
            return Err(malformed(name, "expected 4 '_'-separated fields"));
        };
        Ok(CalibrationTag {
            endstop_distance: parse_field(name, "endstop distance", endstop)?,
            index: parse_field(name, "index", index)?,
            radius: parse_field(name, "radius", radius)?,
            angle_degrees: parse_field(name, "angle", angle)?,
        })
    }
}

fn malformed(name: &str, reason: &str) -> PlanError {
    PlanError::MalformedTag {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn strip_extension(name: &str) -> Result<&str, PlanError> {
    match name.rsplit_once('.') {
        Some((stem, ext)) if ext.eq_ignore_ascii_case(IMAGE_EXTENSION) => Ok(stem),
        _ => Err(malformed(name, "expected a .jpg extension")),
    }
}

fn parse_field<T: FromStr>(name: &str, field: &str, text: &str) -> Result<T, PlanError> {
    text.parse()
        .map_err(|_| malformed(name, &format!("bad {field} field {text:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reference_name() {
        let tag: CaptureTag = "00012-00003-00002_027.000_090.000.jpg".parse().unwrap();
        assert_eq!(
            tag,
            CaptureTag {
                sequence: 12,
                ring: 3,
                stop: 2,
                radius: 27.0,
                angle_degrees: 90.0,
            }
        );
    }

    #[test]
    fn formats_with_fixed_width_fields() {
        let tag = CaptureTag {
            sequence: 1,
            ring: 0,
            stop: 0,
            radius: 0.0,
            angle_degrees: 0.0,
        };
        assert_eq!(tag.file_name(), "00001-00000-00000_00.000_00.000.jpg");

        let tag = CaptureTag {
            sequence: 42,
            ring: 3,
            stop: 7,
            radius: 7.8,
            angle_degrees: 148.23529411764704,
        };
        assert_eq!(tag.file_name(), "00042-00003-00007_07.800_148.235.jpg");
    }

    #[test]
    fn round_trips_through_file_name() {
        let tag = CaptureTag {
            sequence: 100,
            ring: 11,
            stop: 53,
            radius: 28.6,
            angle_degrees: 6.666,
        };
        let parsed: CaptureTag = tag.file_name().parse().unwrap();
        assert_eq!(parsed, tag);
    }

    #[test]
    fn file_names_sort_in_capture_order() {
        let mut names: Vec<String> = [9u32, 10, 100, 2]
            .iter()
            .map(|&sequence| {
                CaptureTag {
                    sequence,
                    ring: 1,
                    stop: 0,
                    radius: 2.6,
                    angle_degrees: 0.0,
                }
                .file_name()
            })
            .collect();
        names.sort();
        let order: Vec<u32> = names.iter().map(|n| n.parse::<CaptureTag>().unwrap().sequence).collect();
        assert_eq!(order, vec![2, 9, 10, 100]);
    }

    #[test]
    fn from_path_uses_file_name_only() {
        let tag = CaptureTag::from_path(Path::new("/home/pi/storage/00003-00001-00001_02.600_45.000.jpg"))
            .unwrap();
        assert_eq!(tag.sequence, 3);
        assert_eq!(tag.angle_degrees, 45.0);
    }

    #[test]
    fn rejects_malformed_names() {
        for name in [
            "00012-00003-00002_027.000_090.000.png",
            "00012-00003_027.000_090.000.jpg",
            "00012-00003-00002_027.000.jpg",
            "00012-00003-0000x_027.000_090.000.jpg",
            "00012-00003-00002_abc_090.000.jpg",
            "notes.txt",
        ] {
            assert!(name.parse::<CaptureTag>().is_err(), "{name} should not parse");
        }
    }

    #[test]
    fn calibration_tag_round_trips() {
        let tag = CalibrationTag {
            endstop_distance: 37.7,
            index: 3,
            radius: 0.0,
            angle_degrees: 67.5,
        };
        let name = tag.file_name();
        assert_eq!(name, "calibrate_037.70_00003_00.000_67.500.jpg");
        assert!(CalibrationTag::matches(&name));
        assert_eq!(name.parse::<CalibrationTag>().unwrap(), tag);
        assert!(name.parse::<CaptureTag>().is_err());
    }
}
