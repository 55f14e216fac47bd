use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use scancam_plan::SensorFootprint;
use serde::{Deserialize, Serialize};

/// Serial line to the grbl controller.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SerialConfig {
    /// Tried in order, the first one that opens is used.
    pub ports: Vec<PathBuf>,
    pub baud_rate: u32,
    pub read_timeout: f64,
    pub write_timeout: f64,
    /// Time the controller needs after the port opens before it prints its greeting.
    pub startup_delay: f64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            ports: vec![
                PathBuf::from("/dev/ttyUSB0"),
                PathBuf::from("/dev/tty.wchusbserial14210"),
                PathBuf::from("/dev/tty.usbserial-14420"),
            ],
            baud_rate: 115200,
            read_timeout: 0.5,
            write_timeout: 0.5,
            startup_delay: 1.0,
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.write_timeout)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs_f64(self.startup_delay)
    }
}

/// Feedrates in mm/min and the idle-poll policy.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MotionConfig {
    pub feedrate: u32,
    pub feedrate_x: u32,
    pub feedrate_y: u32,
    /// Pause between two status queries while waiting for idle.
    pub poll_interval: f64,
    /// `None` polls until the controller reports idle, however long that takes.
    pub max_polls: Option<u64>,
    pub homing_settle: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            feedrate: 400,
            feedrate_x: 150,
            feedrate_y: 500,
            poll_interval: 0.0,
            max_polls: None,
            homing_settle: 0.5,
        }
    }
}

impl MotionConfig {
    pub fn idle_policy(&self) -> IdlePolicy {
        IdlePolicy {
            poll_interval: Duration::from_secs_f64(self.poll_interval),
            max_polls: self.max_polls,
        }
    }

    pub fn homing_settle(&self) -> Duration {
        Duration::from_secs_f64(self.homing_settle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdlePolicy {
    pub poll_interval: Duration,
    pub max_polls: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CaptureConfig {
    pub pre_capture_wait: f64,
    pub post_capture_wait: f64,
    /// Preferred still resolutions, best first; the first one the sensor accepts wins.
    pub resolutions: Vec<[u32; 2]>,
    /// Frames dropped before the kept one so exposure can settle.
    pub warmup_frames: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            pre_capture_wait: 0.5,
            post_capture_wait: 0.1,
            resolutions: vec![[4056, 3040], [3280, 2464], [2592, 1944]],
            warmup_frames: 4,
        }
    }
}

impl CaptureConfig {
    pub fn pre_capture_wait(&self) -> Duration {
        Duration::from_secs_f64(self.pre_capture_wait)
    }

    pub fn post_capture_wait(&self) -> Duration {
        Duration::from_secs_f64(self.post_capture_wait)
    }
}

/// Everything that differs between rigs. One struct replaces the per-rig
/// copies of the driver.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ScanConfig {
    /// Distance from the X endstop to the disc center, in mm.
    pub endstop_distance: f64,
    /// Diameter of the disc to cover, in mm.
    pub diameter: f64,
    pub sensor: SensorFootprint,
    /// Subtracted from both sensor sides to force overlap between captures.
    pub overlap_margin: f64,
    pub output_dir: PathBuf,
    pub serial: SerialConfig,
    pub motion: MotionConfig,
    pub capture: CaptureConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            endstop_distance: 37.70,
            diameter: 60.0,
            sensor: SensorFootprint::new(3.6, 2.7),
            overlap_margin: 0.1,
            output_dir: PathBuf::from("/home/pi/storage"),
            serial: SerialConfig::default(),
            motion: MotionConfig::default(),
            capture: CaptureConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("diameter {diameter} mm exceeds the travel of the stage ({max} mm from endstop distance {endstop} mm)")]
    DiameterExceedsTravel { diameter: f64, endstop: f64, max: f64 },
    #[error("overlap margin {margin} mm leaves no sensor area")]
    MarginTooLarge { margin: f64 },
    #[error("{name} must be a finite number of seconds >= 0, got {value}")]
    InvalidDuration { name: &'static str, value: f64 },
}

impl ScanConfig {
    fn durations(&self) -> [(&'static str, f64); 7] {
        [
            ("serial.read_timeout", self.serial.read_timeout),
            ("serial.write_timeout", self.serial.write_timeout),
            ("serial.startup_delay", self.serial.startup_delay),
            ("motion.poll_interval", self.motion.poll_interval),
            ("motion.homing_settle", self.motion.homing_settle),
            ("capture.pre_capture_wait", self.capture.pre_capture_wait),
            ("capture.post_capture_wait", self.capture.post_capture_wait),
        ]
    }

    /// Footprint used for planning: the sensor minus the overlap margin.
    pub fn effective_footprint(&self) -> SensorFootprint {
        self.sensor.shrunk(self.overlap_margin)
    }

    /// Checks made before any device is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // keep 1 mm of clearance on both sides of the travel
        let max = self.endstop_distance * 2.0 - 2.0;
        if self.diameter > max {
            return Err(ConfigError::DiameterExceedsTravel {
                diameter: self.diameter,
                endstop: self.endstop_distance,
                max,
            });
        }
        let footprint = self.effective_footprint();
        if footprint.width <= 0.0 || footprint.height <= 0.0 {
            return Err(ConfigError::MarginTooLarge {
                margin: self.overlap_margin,
            });
        }
        // Duration::from_secs_f64 panics on these
        for (name, value) in self.durations() {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidDuration { name, value });
            }
        }
        Ok(())
    }
}

fn decorate_with_path(e: std::io::Error, path: &Path) -> std::io::Error {
    let p = path.display();
    std::io::Error::new(e.kind(), format!("{p}: {e}"))
}

pub fn load_config(path: &Path) -> Result<ScanConfig> {
    let file = std::fs::File::open(path).map_err(|e| decorate_with_path(e, path))?;
    let mut reader = std::io::BufReader::new(file);

    let mut buffer = String::new();
    reader
        .read_to_string(&mut buffer)
        .map_err(|e| decorate_with_path(e, path))?;

    let config = serde_json::from_str(&buffer)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_fit_the_stage() {
        let config = ScanConfig::default();
        config.validate().unwrap();
        let footprint = config.effective_footprint();
        approx::assert_abs_diff_eq!(footprint.width, 3.5, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(footprint.height, 2.6, epsilon = 1e-12);
    }

    #[test]
    fn rejects_diameter_beyond_travel() {
        let config = ScanConfig {
            diameter: 74.0,
            ..ScanConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DiameterExceedsTravel { .. })
        ));
    }

    #[test]
    fn rejects_margin_larger_than_sensor() {
        let config = ScanConfig {
            overlap_margin: 3.0,
            ..ScanConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MarginTooLarge { .. })
        ));
    }

    #[test]
    fn rejects_negative_or_non_finite_durations() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "capture": {{ "pre_capture_wait": -0.5 }} }}"#).unwrap();
        let config = load_config(file.path()).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDuration {
                name: "capture.pre_capture_wait",
                ..
            })
        ));

        let mut config = ScanConfig::default();
        config.serial.write_timeout = f64::INFINITY;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDuration {
                name: "serial.write_timeout",
                ..
            })
        ));

        let mut config = ScanConfig::default();
        config.motion.poll_interval = f64::NAN;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDuration {
                name: "motion.poll_interval",
                ..
            })
        ));

        let mut config = ScanConfig::default();
        config.motion.homing_settle = 0.0;
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "diameter": 40.0, "motion": {{ "feedrate_x": 200, "max_polls": 5000 }} }}"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.diameter, 40.0);
        assert_eq!(config.endstop_distance, 37.70);
        assert_eq!(config.motion.feedrate_x, 200);
        assert_eq!(config.motion.feedrate_y, 500);
        assert_eq!(config.motion.idle_policy().max_polls, Some(5000));
        assert_eq!(config.serial.baud_rate, 115200);
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load_config(Path::new("/nonexistent/scancam.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/scancam.json"));
    }
}
