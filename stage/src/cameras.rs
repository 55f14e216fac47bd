use std::path::Path;

use anyhow::Result;
use log::info;

#[cfg(feature = "camera")]
use crate::config::CaptureConfig;

pub enum CameraType {
    /// Writes a flat gray frame instead of a photo; used for dry runs.
    Placeholder { width: u32, height: u32 },
    #[cfg(feature = "camera")]
    RaspberryPi(CaptureConfig),
}

pub trait Camera {
    /// Takes one still and stores it at `path`; the extension picks the encoding.
    fn capture(&mut self, path: &Path) -> Result<()>;
    fn name(&self) -> String;
    fn close(&mut self) {}
}

pub fn make_camera(camera_type: CameraType) -> Result<Box<dyn Camera>> {
    let camera: Box<dyn Camera> = match camera_type {
        CameraType::Placeholder { width, height } => Box::new(PlaceholderCamera::new(width, height)),
        #[cfg(feature = "camera")]
        CameraType::RaspberryPi(config) => Box::new(real_camera::PiCamera::new(config)?),
    };
    info!("camera: {}", camera.name());
    Ok(camera)
}

pub struct PlaceholderCamera {
    width: u32,
    height: u32,
    shots: u32,
}

impl PlaceholderCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            shots: 0,
        }
    }
}

impl Camera for PlaceholderCamera {
    fn capture(&mut self, path: &Path) -> Result<()> {
        self.shots += 1;
        // alternate shades so neighbouring tiles stay distinguishable in a composite
        let level = if self.shots % 2 == 0 { 96 } else { 160 };
        let frame = image::RgbImage::from_pixel(self.width, self.height, image::Rgb([level; 3]));
        frame.save(path)?;
        Ok(())
    }

    fn name(&self) -> String {
        format!("placeholder {}x{}", self.width, self.height)
    }
}

#[cfg(feature = "camera")]
pub mod real_camera {
    use super::*;
    use anyhow::{anyhow, Context};
    use drm_fourcc::DrmFourcc;
    use libcamera::{
        camera::CameraConfigurationStatus,
        camera_manager::CameraManager,
        framebuffer::AsFrameBuffer,
        framebuffer_allocator::{FrameBuffer, FrameBufferAllocator},
        framebuffer_map::MemoryMappedFrameBuffer,
        geometry::Size,
        pixel_format::PixelFormat,
        properties,
        stream::StreamRole,
    };
    use log::{debug, warn};
    use std::time::Duration;

    // byte order in memory is B, G, R
    const RGB888: PixelFormat = PixelFormat::new(DrmFourcc::Rgb888 as u32, 0);

    const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

    /// libcamera still capture. The camera is acquired for each shot, since
    /// the manager, camera and buffers borrow from one another.
    pub struct PiCamera {
        config: CaptureConfig,
        model: String,
    }

    impl PiCamera {
        pub fn new(config: CaptureConfig) -> Result<Self> {
            let mngr = CameraManager::new()?;
            let cameras = mngr.cameras();
            let cam = cameras.get(0).ok_or_else(|| anyhow!("no cameras found"))?;
            let model = cam.properties().get::<properties::Model>()?.to_string();
            Ok(Self { config, model })
        }
    }

    impl Camera for PiCamera {
        fn capture(&mut self, path: &Path) -> Result<()> {
            let mngr = CameraManager::new()?;
            let cameras = mngr.cameras();
            let cam = cameras.get(0).ok_or_else(|| anyhow!("no cameras found"))?;
            let mut cam = cam.acquire()?;

            let mut cfgs = cam
                .generate_configuration(&[StreamRole::StillCapture])
                .ok_or_else(|| anyhow!("no still capture configuration"))?;

            let mut configured = false;
            for [width, height] in &self.config.resolutions {
                {
                    let mut cfg = cfgs.get_mut(0).ok_or_else(|| anyhow!("no stream configuration"))?;
                    cfg.set_pixel_format(RGB888);
                    cfg.set_size(Size {
                        width: *width,
                        height: *height,
                    });
                }
                match cfgs.validate() {
                    CameraConfigurationStatus::Valid => {
                        info!("camera resolution set to {width}x{height}");
                        configured = true;
                        break;
                    }
                    CameraConfigurationStatus::Adjusted => {
                        debug!("resolution {width}x{height} adjusted: {:#?}", cfgs);
                        configured = true;
                        break;
                    }
                    CameraConfigurationStatus::Invalid => {
                        debug!("resolution {width}x{height} rejected, trying next");
                    }
                }
            }
            if !configured {
                return Err(anyhow!("no usable camera resolution"));
            }

            cam.configure(&mut cfgs)?;

            let cfg = cfgs.get(0).ok_or_else(|| anyhow!("no stream configuration"))?;
            let frame_size = cfg.get_size();
            let stride = cfg.get_stride() as usize;
            let stream = cfg.stream().ok_or_else(|| anyhow!("stream not configured"))?;

            let mut alloc = FrameBufferAllocator::new(&cam);
            let buffer = alloc
                .alloc(&stream)?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("no frame buffer allocated"))?;
            let buffer = MemoryMappedFrameBuffer::new(buffer)?;
            let mut req = cam
                .create_request(None)
                .ok_or_else(|| anyhow!("cannot create capture request"))?;
            req.add_buffer(&stream, buffer)?;

            let (tx, rx) = std::sync::mpsc::channel();
            cam.on_request_completed(move |req| {
                let _ = tx.send(req);
            });
            cam.start(None)?;

            // recycle one request so auto exposure settles before the kept frame
            for _ in 0..self.config.warmup_frames {
                cam.queue_request(req)?;
                req = rx
                    .recv_timeout(REQUEST_TIMEOUT)
                    .context("camera request timed out")?;
                req.reuse(libcamera::request::ReuseFlag::REUSE_BUFFERS);
            }
            cam.queue_request(req)?;
            let req = rx
                .recv_timeout(REQUEST_TIMEOUT)
                .context("camera request timed out")?;

            let framebuffer: &MemoryMappedFrameBuffer<FrameBuffer> = req
                .buffer(&stream)
                .ok_or_else(|| anyhow!("request carries no buffer"))?;
            let planes = framebuffer.data();
            let data = planes.first().ok_or_else(|| anyhow!("frame has no planes"))?;

            let (width, height) = (frame_size.width as usize, frame_size.height as usize);
            if data.len() < stride * height {
                warn!("short frame: {} bytes for {}x{}", data.len(), width, height);
                return Err(anyhow!("short frame from camera"));
            }
            let mut rgb = Vec::with_capacity(width * height * 3);
            for row in data.chunks(stride).take(height) {
                for bgr in row[..width * 3].chunks_exact(3) {
                    rgb.extend_from_slice(&[bgr[2], bgr[1], bgr[0]]);
                }
            }

            cam.stop()?;

            let image = image::RgbImage::from_raw(frame_size.width, frame_size.height, rgb)
                .ok_or_else(|| anyhow!("frame does not match its size"))?;
            image.save(path)?;
            Ok(())
        }

        fn name(&self) -> String {
            format!("libcamera {}", self.model)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_writes_decodable_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00001-00000-00000_00.000_00.000.jpg");
        let mut camera = make_camera(CameraType::Placeholder {
            width: 40,
            height: 30,
        })
        .unwrap();
        camera.capture(&path).unwrap();

        let frame = image::open(&path).unwrap();
        assert_eq!((frame.width(), frame.height()), (40, 30));
    }
}
