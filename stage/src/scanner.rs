use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};
use scancam_plan::{CalibrationTag, CapturePosition, CaptureTag, RingPlan};

use crate::cameras::Camera;
use crate::config::{MotionConfig, ScanConfig};
use crate::grbl::{Grbl, MachineState, StageError};
use crate::motor::SerialLink;

/// One thing the stage does, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Announce(String),
    Command(String),
    WaitIdle,
    Settle(Duration),
    Capture { file_name: String },
}

fn move_x(x: f64, feedrate: u32) -> String {
    format!("G1 X{x:.3} F{feedrate}")
}

fn move_y(y: f64, feedrate: u32) -> String {
    format!("G1 Y{y:.3} F{feedrate}")
}

/// Commands sent once after homing: absolute positioning, zero offsets,
/// millimeters, base feedrate, work origin at the endstop distance, then the
/// move to the disc center.
pub fn setup_commands(config: &ScanConfig) -> Vec<String> {
    let motion = &config.motion;
    vec![
        "G90".to_string(),
        "G10 P0 L20 X0 Y0 Z0".to_string(),
        "G21".to_string(),
        format!("G1 F{}", motion.feedrate),
        format!("G92 X{:.3} Y0 Z0", config.endstop_distance),
        format!("G1 X0 F{}", motion.feedrate_x),
        format!("G1 Y0 F{}", motion.feedrate_y),
    ]
}

/// Moves to `position` one axis at a time, since the linear and rotary axes
/// need different feedrates.
fn approach(position: &CapturePosition, motion: &MotionConfig) -> [Step; 4] {
    [
        Step::Command(move_x(position.radius, motion.feedrate_x)),
        Step::WaitIdle,
        Step::Command(move_y(position.angle_degrees, motion.feedrate_y)),
        Step::WaitIdle,
    ]
}

fn return_home() -> [Step; 3] {
    [
        Step::Announce("return home".to_string()),
        Step::Command("G1 X0.000 Y0.000".to_string()),
        Step::WaitIdle,
    ]
}

fn shoot(file_name: String, config: &ScanConfig) -> [Step; 3] {
    [
        Step::Settle(config.capture.pre_capture_wait()),
        Step::Capture { file_name },
        Step::Settle(config.capture.post_capture_wait()),
    ]
}

/// The full still-mode sequence for `plan`, ending back at the origin.
pub fn capture_steps(plan: &RingPlan, config: &ScanConfig) -> Vec<Step> {
    let total = plan.len();
    let rings = plan.rings().len();
    let mut steps = Vec::with_capacity(total * 8 + 3);

    for (n, (i, j, position)) in plan.positions().enumerate() {
        let sequence = n as u32 + 1;
        let ring_len = plan.rings()[i].stops.len();
        steps.push(Step::Announce(format!(
            "POS {sequence}/{total} | R: {i}/{rings} I: {j}/{ring_len}"
        )));
        steps.extend(approach(&position, &config.motion));

        let tag = CaptureTag {
            sequence,
            ring: i as u32,
            stop: j as u32,
            radius: position.radius,
            angle_degrees: position.angle_degrees,
        };
        steps.extend(shoot(tag.file_name(), config));
    }

    steps.extend(return_home());
    steps
}

/// Half a turn in 22.5° increments at the disc center.
pub fn calibration_positions() -> Vec<CapturePosition> {
    (0..=8)
        .map(|k| CapturePosition {
            radius: 0.0,
            angle_degrees: k as f64 * 22.5,
        })
        .collect()
}

pub fn calibration_steps(config: &ScanConfig) -> Vec<Step> {
    let positions = calibration_positions();
    let mut steps = Vec::new();
    for (index, position) in positions.iter().enumerate() {
        steps.push(Step::Announce(format!("POS {index}/{}", positions.len())));
        steps.extend(approach(position, &config.motion));
        let tag = CalibrationTag {
            endstop_distance: config.endstop_distance,
            index: index as u32,
            radius: position.radius,
            angle_degrees: position.angle_degrees,
        };
        steps.extend(shoot(tag.file_name(), config));
    }
    steps.extend(return_home());
    steps
}

/// A single combined move, used by the `move` and `video` modes.
pub fn move_steps(x: Option<f64>, y: Option<f64>, feedrate: u32) -> Vec<Step> {
    let mut command = "G1".to_string();
    if let Some(x) = x {
        command.push_str(&format!(" X{x:.3}"));
    }
    if let Some(y) = y {
        command.push_str(&format!(" Y{y:.3}"));
    }
    command.push_str(&format!(" F{feedrate}"));
    vec![Step::Command(command), Step::WaitIdle]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Homing,
    Idle,
    Moving,
}

/// Open devices of one run. Dropping the session closes them, whatever path
/// the run leaves by.
pub struct Session<L: SerialLink = Box<dyn SerialLink>> {
    grbl: Grbl<L>,
    camera: Option<Box<dyn Camera>>,
    config: ScanConfig,
    state: SessionState,
}

impl<L: SerialLink> Session<L> {
    /// Takes over an opened link, waits for the controller to boot and drops
    /// its banner.
    pub fn connect(link: L, config: &ScanConfig) -> Result<Self> {
        let mut session = Session {
            grbl: Grbl::new(link),
            camera: None,
            config: config.clone(),
            state: SessionState::Connected,
        };
        thread::sleep(config.serial.startup_delay());
        session.grbl.discard_input()?;
        info!("connected to {}", session.grbl.name());
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn link(&self) -> &L {
        self.grbl.link()
    }

    pub fn attach_camera(&mut self, camera: Box<dyn Camera>) {
        self.camera = Some(camera);
    }

    /// Clears an alarm lock (`$X`), leaving the motors free.
    pub fn unlock(&mut self) -> Result<Option<String>> {
        Ok(self.grbl.send_command("$X")?)
    }

    /// Homes the machine and runs the setup sequence; the carriage ends at
    /// the disc center.
    pub fn home(&mut self) -> Result<()> {
        self.state = SessionState::Homing;
        let policy = self.config.motion.idle_policy();

        info!("starting homing");
        self.grbl
            .send_command_allow_silence("$H")
            .context("homing failed")?;
        self.grbl.wait_for_idle(&policy).context("homing failed")?;
        thread::sleep(self.config.motion.homing_settle());

        // one extra read if the first comes back empty
        let status = match self.grbl.status() {
            Ok(MachineState::Unknown(word)) if word.is_empty() => self.grbl.status(),
            Err(StageError::EmptyResponse { .. }) => {
                debug!("empty status after homing, reading again");
                self.grbl.status()
            }
            other => other,
        }
        .context("homing failed")?;
        if status != MachineState::Idle {
            return Err(StageError::Homing { state: status }.into());
        }
        info!("homing successful");

        for command in setup_commands(&self.config) {
            self.grbl
                .send_command(&command)
                .with_context(|| format!("initializing grbl failed with cmd {command:?}"))?;
        }
        self.grbl.wait_for_idle(&policy)?;
        self.state = SessionState::Idle;
        info!("initialized and centered");
        Ok(())
    }

    /// Executes `steps`, writing captures into `output_dir`.
    pub fn run(&mut self, steps: &[Step], output_dir: &Path) -> Result<()> {
        let policy = self.config.motion.idle_policy();
        for step in steps {
            match step {
                Step::Announce(message) => info!("{message}"),
                Step::Command(command) => {
                    self.grbl.send_command(command)?;
                    self.state = SessionState::Moving;
                }
                Step::WaitIdle => {
                    self.grbl.wait_for_idle(&policy)?;
                    self.state = SessionState::Idle;
                }
                Step::Settle(duration) => thread::sleep(*duration),
                Step::Capture { file_name } => {
                    let camera = self
                        .camera
                        .as_mut()
                        .context("capture requested but no camera attached")?;
                    let path = output_dir.join(file_name);
                    debug!("TRIGGER {file_name}");
                    camera
                        .capture(&path)
                        .with_context(|| format!("capture to {} failed", path.display()))?;
                    debug!("FILE: {file_name}");
                }
            }
        }
        Ok(())
    }

    /// Closes the camera and the serial link. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }
        info!("closing device connections");
        if let Some(mut camera) = self.camera.take() {
            camera.close();
        }
        self.grbl.close();
        self.state = SessionState::Disconnected;
    }
}

impl<L: SerialLink> Drop for Session<L> {
    fn drop(&mut self) {
        self.close();
    }
}
