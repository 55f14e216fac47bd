use std::path::Path;

use anyhow::Result;
use image::{Rgba, RgbaImage};
use log::info;
use scancam_plan::{CaptureTag, RingPlan};

use crate::composite::{Canvas, CompositeConfig};

const RING_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const FOOTPRINT_FILL: Rgba<u8> = Rgba([255, 255, 255, 90]);

/// Renders how the footprints of `plan` cover the disc, without any
/// captures: one outline per ring and a translucent footprint per stop.
/// With `frames`, the canvas is also saved after every stop.
pub fn render_plan(plan: &RingPlan, config: &CompositeConfig, frames: Option<&Path>) -> Result<RgbaImage> {
    let mut canvas = Canvas::new(config.canvas_size);
    let center = config.center();

    for ring in plan.rings().iter().filter(|r| r.radius > 0.0) {
        canvas.outline_circle(center, ring.radius * config.scale, RING_COLOR);
    }

    for (i, (ring, stop, position)) in plan.positions().enumerate() {
        let tag = CaptureTag {
            sequence: i as u32 + 1,
            ring: ring as u32,
            stop: stop as u32,
            radius: position.radius,
            angle_degrees: position.angle_degrees,
        };
        canvas.fill_quad(&config.quad_for(&tag), FOOTPRINT_FILL);

        if let Some(frames) = frames {
            canvas.image().save(frames.join(format!("{i:05}.png")))?;
        }
    }
    info!("previewed {} stops on {} rings", plan.len(), plan.rings().len());
    Ok(canvas.into_image())
}
