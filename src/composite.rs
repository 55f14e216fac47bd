use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glam::DVec2;
use image::{Rgba, RgbaImage};
use log::{debug, info, trace};
use scancam_plan::{projected_footprint, CalibrationTag, CaptureTag, Quad, SensorFootprint, IMAGE_EXTENSION};

use crate::homography::Homography;

/// How one capture is painted onto the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paint {
    /// Perspective-warp the pixels into the footprint.
    Warp,
    /// Fill the footprint with the capture's mean color at half opacity.
    MeanColor,
}

#[derive(Debug, Clone)]
pub struct CompositeConfig {
    /// Canvas side length in pixels; the disc center sits in the middle.
    pub canvas_size: u32,
    /// Canvas pixels per millimeter of stage travel.
    pub scale: f64,
    /// Footprint of one capture on the subject, in millimeters.
    pub footprint: SensorFootprint,
    /// Mirror captures to undo the camera's mounting orientation.
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
    pub paint: Paint,
}

impl CompositeConfig {
    pub fn center(&self) -> DVec2 {
        DVec2::splat(self.canvas_size as f64 / 2.0)
    }

    /// Footprint of `tag` in canvas pixels.
    pub fn quad_for(&self, tag: &CaptureTag) -> Quad {
        projected_footprint(
            tag.radius * self.scale,
            tag.angle_degrees,
            self.footprint.scaled(self.scale),
            self.center(),
        )
    }
}

pub struct TaggedImage {
    pub tag: CaptureTag,
    pub pixels: RgbaImage,
}

impl TaggedImage {
    pub fn load(path: &Path) -> Result<Self> {
        let tag = CaptureTag::from_path(path)?;
        let pixels = image::open(path)
            .with_context(|| format!("reading {}", path.display()))?
            .into_rgba8();
        Ok(Self { tag, pixels })
    }
}

/// Capture files of `dir` in file name order, which is capture order.
/// Calibration shots and files without the image extension are skipped.
pub fn list_captures(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in dir
        .read_dir()
        .with_context(|| format!("listing {}", dir.display()))?
    {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(IMAGE_EXTENSION));
        if !path.is_file() || !is_image {
            continue;
        }
        if CalibrationTag::matches(name) {
            debug!("skipping calibration capture {name}");
            continue;
        }
        paths.push(path);
    }
    paths.sort();
    Ok(paths)
}

/// Fixed-size raster the captures are painted into, later ones on top.
pub struct Canvas {
    pixels: RgbaImage,
}

impl Canvas {
    pub fn new(size: u32) -> Self {
        Self {
            pixels: RgbaImage::from_pixel(size, size, Rgba([0, 0, 0, 255])),
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn into_image(self) -> RgbaImage {
        self.pixels
    }

    /// Paints one capture into its footprint.
    pub fn paint(&mut self, capture: &TaggedImage, config: &CompositeConfig) -> Result<()> {
        let quad = config.quad_for(&capture.tag);
        let mut source = capture.pixels.clone();
        if config.flip_horizontal {
            image::imageops::flip_horizontal_in_place(&mut source);
        }
        if config.flip_vertical {
            image::imageops::flip_vertical_in_place(&mut source);
        }

        match config.paint {
            Paint::Warp => self.warp(&source, &quad),
            Paint::MeanColor => {
                let [r, g, b, _] = mean_color(&source).0;
                self.fill_quad(&quad, Rgba([r, g, b, 128]));
                Ok(())
            }
        }
    }

    /// Replaces every canvas pixel inside `quad` with the matching source
    /// pixel, found through the inverse homography.
    pub fn warp(&mut self, source: &RgbaImage, quad: &Quad) -> Result<()> {
        let (w, h) = source.dimensions();
        let to_canvas = Homography::rect_to_quad(w as f64, h as f64, quad)?;
        trace!("homography {:?}", to_canvas.matrix());
        let to_source = to_canvas.inverse()?;

        for (x, y) in covered_pixels(quad, self.pixels.dimensions()) {
            let p = to_source.apply(DVec2::new(x as f64 + 0.5, y as f64 + 0.5));
            // clear, then add: overlapping earlier captures do not bleed through
            self.pixels.put_pixel(x, y, bilinear(source, p));
        }
        Ok(())
    }

    /// Alpha-blends `color` over every pixel inside `quad`.
    pub fn fill_quad(&mut self, quad: &Quad, color: Rgba<u8>) {
        let alpha = color.0[3] as f64 / 255.0;
        for (x, y) in covered_pixels(quad, self.pixels.dimensions()) {
            let pixel = self.pixels.get_pixel_mut(x, y);
            for c in 0..3 {
                let blended = pixel.0[c] as f64 * (1.0 - alpha) + color.0[c] as f64 * alpha;
                pixel.0[c] = blended.round() as u8;
            }
        }
    }

    pub fn outline_circle(&mut self, center: DVec2, radius: f64, color: Rgba<u8>) {
        let steps = ((2.0 * std::f64::consts::PI * radius).ceil() as usize * 2).max(16);
        for k in 0..steps {
            let t = k as f64 / steps as f64 * std::f64::consts::TAU;
            let p = center + radius * DVec2::new(t.cos(), t.sin());
            if p.x >= 0.0 && p.y >= 0.0 {
                let (x, y) = (p.x as u32, p.y as u32);
                if x < self.pixels.width() && y < self.pixels.height() {
                    self.pixels.put_pixel(x, y, color);
                }
            }
        }
    }
}

fn inside_convex(quad: &Quad, p: DVec2) -> bool {
    let mut sign = 0.0;
    for i in 0..4 {
        let a = quad[i];
        let b = quad[(i + 1) % 4];
        let c = (b - a).perp_dot(p - a);
        if c == 0.0 {
            continue;
        }
        if sign == 0.0 {
            sign = c.signum();
        } else if c.signum() != sign {
            return false;
        }
    }
    true
}

/// Canvas pixels whose centers fall inside `quad`, clipped to the canvas.
fn covered_pixels(quad: &Quad, (width, height): (u32, u32)) -> impl Iterator<Item = (u32, u32)> + '_ {
    let min = quad.iter().copied().reduce(DVec2::min).unwrap_or(DVec2::ZERO);
    let max = quad.iter().copied().reduce(DVec2::max).unwrap_or(DVec2::ZERO);
    let x0 = min.x.floor().max(0.0) as u32;
    let y0 = min.y.floor().max(0.0) as u32;
    let x1 = (max.x.ceil().max(0.0) as u32).min(width);
    let y1 = (max.y.ceil().max(0.0) as u32).min(height);

    (y0..y1)
        .flat_map(move |y| (x0..x1).map(move |x| (x, y)))
        .filter(move |&(x, y)| inside_convex(quad, DVec2::new(x as f64 + 0.5, y as f64 + 0.5)))
}

/// Samples `image` at continuous coordinates, pixel centers at +0.5.
fn bilinear(image: &RgbaImage, p: DVec2) -> Rgba<u8> {
    let (w, h) = image.dimensions();
    let x = (p.x - 0.5).clamp(0.0, (w - 1) as f64);
    let y = (p.y - 0.5).clamp(0.0, (h - 1) as f64);
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (fx, fy) = (x - x0 as f64, y - y0 as f64);

    let mut out = [0u8; 4];
    for (c, value) in out.iter_mut().enumerate() {
        let top = image.get_pixel(x0, y0).0[c] as f64 * (1.0 - fx) + image.get_pixel(x1, y0).0[c] as f64 * fx;
        let bottom = image.get_pixel(x0, y1).0[c] as f64 * (1.0 - fx) + image.get_pixel(x1, y1).0[c] as f64 * fx;
        *value = (top * (1.0 - fy) + bottom * fy).round() as u8;
    }
    Rgba(out)
}

pub fn mean_color(image: &RgbaImage) -> Rgba<u8> {
    let mut sum = [0u64; 4];
    for pixel in image.pixels() {
        for (s, v) in sum.iter_mut().zip(pixel.0) {
            *s += v as u64;
        }
    }
    let n = (image.width() as u64 * image.height() as u64).max(1);
    Rgba(sum.map(|s| (s / n) as u8))
}

/// Paints every capture of `dir` onto a fresh canvas. When `frames` is set,
/// the canvas is also saved there after each capture.
pub fn stitch(dir: &Path, config: &CompositeConfig, frames: Option<&Path>) -> Result<Canvas> {
    let paths = list_captures(dir)?;
    info!("compositing {} captures from {}", paths.len(), dir.display());

    let mut canvas = Canvas::new(config.canvas_size);
    for (i, path) in paths.iter().enumerate() {
        let capture = TaggedImage::load(path)?;
        debug!(
            "{} -> r {:.3} mm, {:.3} deg",
            path.display(),
            capture.tag.radius,
            capture.tag.angle_degrees
        );
        canvas
            .paint(&capture, config)
            .with_context(|| format!("compositing {}", path.display()))?;

        if let Some(frames) = frames {
            let frame = frames.join(format!("{i:05}.png"));
            canvas.image().save(&frame)?;
        }
    }
    Ok(canvas)
}
