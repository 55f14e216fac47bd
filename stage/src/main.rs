mod cameras;
mod config;
mod grbl;
mod motor;
mod scanner;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use scancam_plan::{compute_ring_plan, logging};

use cameras::CameraType;
use config::{load_config, ScanConfig};
use motor::{make_serial_link, LinkType};
use scanner::Session;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Capture the full ring plan
    Still,
    /// Single move at the given feedrate, for filming
    Video,
    /// Move to X/Y at the base feedrate
    Move,
    /// Home, center and wait
    Wait,
    /// Half a turn of captures at the center
    Calibrate,
    /// Unlock the controller and release the motors
    Disable,
}

#[derive(Parser)]
#[clap(about = "Drives the scancam stage and camera")]
struct Cli {
    #[clap(value_enum, default_value = "still")]
    command: Mode,
    /// X axis units [mm]
    #[clap(short = 'x', allow_negative_numbers = true, default_value_t = 0.0)]
    x: f64,
    /// Y axis units [deg]
    #[clap(short = 'y', allow_negative_numbers = true, default_value_t = 0.0)]
    y: f64,
    /// Movement speed [mm/min], defaults to the configured base feedrate
    #[clap(short = 'f', long)]
    feedrate: Option<u32>,
    /// Wait mode duration [s]
    #[clap(short = 'd', long, default_value_t = 10)]
    delay: u64,
    /// Write placeholder frames instead of opening the camera
    #[clap(long)]
    no_camera: bool,
    /// Talk to a simulated controller instead of a serial port
    #[clap(long)]
    no_device: bool,
    /// Print debug messages
    #[clap(long)]
    debug: bool,
    /// JSON rig configuration; built-in defaults when absent
    #[clap(long)]
    config: Option<PathBuf>,
    /// Overrides the configured output directory
    #[clap(long)]
    output_dir: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.debug);

    // the session is dropped inside run(), so devices are closed before exiting
    if let Err(e) = run(cli) {
        error!("{e:#}");
        std::process::exit(-1);
    }
}

fn run(cli: Cli) -> Result<()> {
    info!("init");
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ScanConfig::default(),
    };
    if let Some(dir) = &cli.output_dir {
        config.output_dir = dir.clone();
    }
    config.validate()?;

    let link_type = if cli.no_device {
        LinkType::Simulated
    } else {
        real_link()
    };
    let link = make_serial_link(link_type, &config.serial)?;
    let mut session = Session::connect(link, &config)?;

    if cli.command == Mode::Disable {
        info!("disabling motors...");
        let reply = session.unlock()?;
        info!("grbl: {}", reply.unwrap_or_default());
        session.close();
        info!("motors disabled");
        return Ok(());
    }

    session.home()?;

    let steps = match cli.command {
        Mode::Still => {
            info!("STILL MODE");
            let plan = compute_ring_plan(config.diameter, config.effective_footprint())?;
            info!(
                "{} rings, {} captures, outer radius {:.3} mm",
                plan.rings().len(),
                plan.len(),
                plan.outer_radius()
            );
            scanner::capture_steps(&plan, &config)
        }
        Mode::Calibrate => {
            info!("CALIBRATE MODE");
            scanner::calibration_steps(&config)
        }
        Mode::Move => {
            info!("MOVE | X: {:5.2} Y: {:5.2}", cli.x, cli.y);
            scanner::move_steps(Some(cli.x), Some(cli.y), config.motion.feedrate)
        }
        Mode::Video => {
            let feedrate = cli.feedrate.unwrap_or(config.motion.feedrate);
            info!("VIDEO | X: {:5.2} Y: {:5.2} F: {}", cli.x, cli.y, feedrate);
            scanner::move_steps(Some(cli.x), Some(cli.y), feedrate)
        }
        Mode::Wait => {
            info!("WAIT {} s", cli.delay);
            std::thread::sleep(Duration::from_secs(cli.delay));
            Vec::new()
        }
        Mode::Disable => unreachable!("handled before homing"),
    };

    if matches!(cli.command, Mode::Still | Mode::Calibrate) {
        std::fs::create_dir_all(&config.output_dir)?;
        let camera_type = if cli.no_camera {
            CameraType::Placeholder {
                width: 400,
                height: 300,
            }
        } else {
            real_camera(&config)
        };
        session.attach_camera(cameras::make_camera(camera_type)?);
    }

    session.run(&steps, &config.output_dir)?;
    session.close();
    info!("DONE");
    Ok(())
}

#[cfg(feature = "motor")]
fn real_link() -> LinkType {
    LinkType::Uart
}

#[cfg(not(feature = "motor"))]
fn real_link() -> LinkType {
    warn!("built without the motor feature, using a simulated controller");
    LinkType::Simulated
}

#[cfg(feature = "camera")]
fn real_camera(config: &ScanConfig) -> CameraType {
    CameraType::RaspberryPi(config.capture.clone())
}

#[cfg(not(feature = "camera"))]
fn real_camera(_config: &ScanConfig) -> CameraType {
    warn!("built without the camera feature, writing placeholder frames");
    CameraType::Placeholder {
        width: 400,
        height: 300,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    #[test]
    fn cli_parses_original_flags() {
        let cli = Cli::parse_from([
            "scancam", "video", "-x", "12.5", "-y", "90", "-f", "300", "--no-camera", "--debug",
        ]);
        assert_eq!(cli.command, Mode::Video);
        assert_eq!(cli.x, 12.5);
        assert_eq!(cli.y, 90.0);
        assert_eq!(cli.feedrate, Some(300));
        assert!(cli.no_camera);
        assert!(cli.debug);
        assert!(!cli.no_device);
    }

    #[test]
    fn dry_run_still_scan_completes() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("rig.json");
        std::fs::write(
            &config_path,
            r#"{ "diameter": 14.0,
                 "serial": { "startup_delay": 0.0 },
                 "motion": { "homing_settle": 0.0, "max_polls": 100 },
                 "capture": { "pre_capture_wait": 0.0, "post_capture_wait": 0.0 } }"#,
        )
        .unwrap();
        let output = dir.path().join("captures");

        let args: Vec<OsString> = vec![
            "scancam".into(),
            "still".into(),
            "--no-camera".into(),
            "--no-device".into(),
            "--config".into(),
            config_path.into_os_string(),
            "--output-dir".into(),
            output.clone().into_os_string(),
        ];
        run(Cli::parse_from(args)).unwrap();

        let count = std::fs::read_dir(&output).unwrap().count();
        assert_eq!(count, 1 + 8 + 12);
    }

    #[test]
    fn oversized_diameter_fails_before_device_io() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("rig.json");
        std::fs::write(&config_path, r#"{ "diameter": 100.0 }"#).unwrap();
        let args: Vec<OsString> = vec![
            "scancam".into(),
            "still".into(),
            "--config".into(),
            config_path.into_os_string(),
        ];
        let err = run(Cli::parse_from(args)).unwrap_err();
        assert!(err.downcast_ref::<config::ConfigError>().is_some());
    }
}
