//! Camera capture through nokhwa.

use super::{CameraInfo, CaptureBackend, CaptureConfig};
use crate::frame::{SampleFormat, VideoSample};
use anyhow::{anyhow, Result};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Webcam producing NV12 where the device allows it.
pub struct NokhwaCapture {
    camera: Camera,
    width: u32,
    height: u32,
    started: Instant,
}

impl NokhwaCapture {
    pub fn list_devices() -> Result<Vec<CameraInfo>> {
        let devices = nokhwa::query(ApiBackend::Auto)?;
        Ok(devices
            .into_iter()
            .map(|d| CameraInfo { index: d.index().as_index().unwrap_or(0), name: d.human_name().to_string() })
            .collect())
    }

    /// Open the camera, preferring the requested size and planar formats.
    pub fn open(config: CaptureConfig) -> Result<Self> {
        let requested = Resolution::new(config.width, config.height);
        // Planar first: it skips the CPU conversion entirely.
        let seeds = [
            CameraFormat::new(requested, FrameFormat::NV12, config.fps),
            CameraFormat::new(requested, FrameFormat::YUYV, config.fps),
            CameraFormat::new(requested, FrameFormat::MJPEG, config.fps),
            CameraFormat::new(Resolution::new(1280, 720), FrameFormat::NV12, 30),
            CameraFormat::new(Resolution::new(1280, 720), FrameFormat::YUYV, 30),
            CameraFormat::new(Resolution::new(640, 480), FrameFormat::YUYV, 30),
            CameraFormat::new(Resolution::new(640, 480), FrameFormat::MJPEG, 30),
        ];

        let mut camera = None;
        for seed in seeds {
            let request = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(seed));
            match Camera::new(CameraIndex::Index(config.device), request) {
                // Creating the camera is not enough for some drivers; the stream must open too.
                Ok(mut cam) => match cam.open_stream() {
                    Ok(()) => {
                        info!("Camera {} opened with {:?}", config.device, seed);
                        camera = Some(cam);
                        break;
                    }
                    Err(e) => debug!("Stream with {:?} failed: {}", seed, e),
                },
                Err(e) => debug!("Format {:?} rejected: {}", seed, e),
            }
        }
        let camera =
            camera.ok_or_else(|| anyhow!("Could not open a stream on camera {} with any format", config.device))?;

        let resolution = camera.resolution();
        if (resolution.width(), resolution.height()) != (config.width, config.height) {
            warn!(
                "Camera delivers {}x{} instead of the requested {}x{}",
                resolution.width(),
                resolution.height(),
                config.width,
                config.height
            );
        }

        Ok(Self { camera, width: resolution.width(), height: resolution.height(), started: Instant::now() })
    }
}

impl CaptureBackend for NokhwaCapture {
    fn next_sample(&mut self) -> Result<Option<VideoSample>> {
        let frame = self.camera.frame()?;
        let timestamp = self.started.elapsed();
        let (width, height) = (self.width, self.height);

        let sample = match frame.source_frame_format() {
            FrameFormat::NV12 => {
                let data = frame.buffer();
                let luma_len = width as usize * height as usize;
                let chroma_len = (width.div_ceil(2) * 2) as usize * height.div_ceil(2) as usize;
                if data.len() < luma_len + chroma_len {
                    return Err(anyhow!("NV12 frame holds {} bytes, expected {}", data.len(), luma_len + chroma_len));
                }
                let (luma, chroma) = data.split_at(luma_len);
                VideoSample::nv12(width, height, luma.to_vec(), chroma[..chroma_len].to_vec())
            }
            FrameFormat::YUYV => yuyv_to_nv12(width, height, frame.buffer())?,
            _ => {
                let rgb = frame.decode_image::<RgbFormat>()?.into_raw();
                let mut rgba = Vec::with_capacity(rgb.len() / 3 * 4);
                for px in rgb.chunks_exact(3) {
                    rgba.extend_from_slice(&[px[0], px[1], px[2], 255]);
                }
                VideoSample::packed(width, height, SampleFormat::Rgba, rgba)
            }
        };
        Ok(Some(sample.with_timestamp(timestamp)))
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Repack interleaved 4:2:2 into NV12 planes.
pub(crate) fn yuyv_to_nv12(width: u32, height: u32, yuyv: &[u8]) -> Result<VideoSample> {
    let (w, h) = (width as usize, height as usize);
    let luma_len = w * h;
    let chroma_stride = w + (w % 2);
    let mut nv12 = vec![0u8; luma_len + chroma_stride * h.div_ceil(2)];

    let color = || {
        ezk_image::ColorInfo::YUV(ezk_image::YuvColorInfo {
            transfer: ezk_image::ColorTransfer::Linear,
            primaries: ezk_image::ColorPrimaries::BT709,
            space: ezk_image::ColorSpace::BT709,
            full_range: false,
        })
    };
    {
        let src = ezk_image::Image::from_buffer(ezk_image::PixelFormat::YUYV, yuyv, None, w, h, color())
            .map_err(|e| anyhow!("YUYV buffer rejected: {:?}", e))?;
        let mut dst = ezk_image::Image::from_buffer(ezk_image::PixelFormat::NV12, &mut nv12[..], None, w, h, color())
            .map_err(|e| anyhow!("NV12 buffer rejected: {:?}", e))?;
        ezk_image::convert(&src, &mut dst).map_err(|e| anyhow!("YUYV to NV12 failed: {:?}", e))?;
    }

    let chroma = nv12.split_off(luma_len);
    Ok(VideoSample::nv12(width, height, nv12, chroma))
}
