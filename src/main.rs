mod composite;
mod homography;
mod preview;

use composite::{CompositeConfig, Paint};
use scancam_plan::{compute_ring_plan, logging, SensorFootprint};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[clap(about = "Stitches scancam captures back into one image")]
struct Cli {
    #[clap(subcommand)]
    cmd: Commands,
    /// Print debug messages
    #[clap(long, global = true)]
    debug: bool,
}

#[derive(Args)]
struct CanvasArgs {
    /// Canvas side length [px]
    #[clap(long = "canvas", default_value_t = 1100)]
    canvas_size: u32,
    /// Canvas pixels per millimeter
    #[clap(long, default_value_t = 10.0)]
    scale: f64,
    /// Sensor footprint width [mm]
    #[clap(long, default_value_t = 3.6)]
    sensor_width: f64,
    /// Sensor footprint height [mm]
    #[clap(long, default_value_t = 2.7)]
    sensor_height: f64,
    /// Frame every step into this directory as 00000.png, 00001.png, ...
    #[clap(long)]
    frames: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Composite a directory of tagged captures
    Stitch {
        input_dir: PathBuf,
        #[clap(short, long, default_value = "composite.png")]
        output: PathBuf,
        /// Also write a grayscale copy next to the output
        #[clap(long)]
        grayscale: bool,
        #[clap(long)]
        flip_horizontal: bool,
        #[clap(long)]
        flip_vertical: bool,
        /// Paint each footprint with the capture's mean color instead of its pixels
        #[clap(long)]
        mean_color: bool,
        #[clap(flatten)]
        canvas: CanvasArgs,
    },
    /// Draw the footprint coverage of a ring plan
    Preview {
        /// Scan diameter [mm]
        #[clap(long, default_value_t = 60.0)]
        diameter: f64,
        /// Overlap margin subtracted from the footprint [mm]
        #[clap(long, default_value_t = 0.1)]
        margin: f64,
        #[clap(short, long, default_value = "preview.png")]
        output: PathBuf,
        #[clap(flatten)]
        canvas: CanvasArgs,
    },
}

impl CanvasArgs {
    fn config(&self, footprint: SensorFootprint) -> CompositeConfig {
        CompositeConfig {
            canvas_size: self.canvas_size,
            scale: self.scale,
            footprint,
            flip_horizontal: false,
            flip_vertical: false,
            paint: Paint::Warp,
        }
    }

    fn footprint(&self) -> SensorFootprint {
        SensorFootprint::new(self.sensor_width, self.sensor_height)
    }

    fn frames_dir(&self) -> Result<Option<&Path>> {
        if let Some(dir) = &self.frames {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(self.frames.as_deref())
    }
}

fn grayscale_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("composite");
    output.with_file_name(format!("{stem}_gray.png"))
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.debug);

    if let Err(e) = run(cli.cmd) {
        error!("{e:#}");
        std::process::exit(-1);
    }
}

fn run(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Stitch {
            input_dir,
            output,
            grayscale,
            flip_horizontal,
            flip_vertical,
            mean_color,
            canvas,
        } => {
            let config = CompositeConfig {
                flip_horizontal,
                flip_vertical,
                paint: if mean_color { Paint::MeanColor } else { Paint::Warp },
                ..canvas.config(canvas.footprint())
            };
            let image = composite::stitch(&input_dir, &config, canvas.frames_dir()?)?.into_image();

            image
                .save(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            info!("wrote {}", output.display());

            if grayscale {
                let gray_path = grayscale_path(&output);
                image::DynamicImage::ImageRgba8(image)
                    .to_luma8()
                    .save(&gray_path)
                    .with_context(|| format!("writing {}", gray_path.display()))?;
                info!("wrote {}", gray_path.display());
            }
        }
        Commands::Preview {
            diameter,
            margin,
            output,
            canvas,
        } => {
            let footprint = canvas.footprint().shrunk(margin);
            let plan = compute_ring_plan(diameter, footprint)?;
            for ring in plan.rings() {
                info!("pos: {:.3} stops: {}", ring.radius, ring.stops.len());
            }
            let image = preview::render_plan(&plan, &canvas.config(footprint), canvas.frames_dir()?)?;
            image
                .save(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            info!("wrote {}", output.display());
        }
    }
    Ok(())
}
