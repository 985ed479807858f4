//! Producers of raw samples: cameras, decoded files and test patterns.

mod ffmpeg;
mod nokhwa_backend;
mod synthetic;

pub use ffmpeg::FfmpegDecoder;
pub use nokhwa_backend::NokhwaCapture;
pub use synthetic::{Pattern, SyntheticSource};

use crate::frame::VideoSample;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A source of timestamped samples feeding a [`FrameSource`](crate::ingest::FrameSource).
pub trait CaptureBackend {
    /// Next sample, or `None` once the stream has ended.
    fn next_sample(&mut self) -> Result<Option<VideoSample>>;

    /// Dimensions of the samples produced.
    fn frame_size(&self) -> (u32, u32);

    /// Row alignment of the sample planes.
    fn alignment(&self) -> usize {
        1
    }
}

/// Information about a camera device.
#[derive(Debug, Clone)]
pub struct CameraInfo {
    /// Device index
    pub index: u32,
    /// Human-readable name
    pub name: String,
}

/// Requested capture geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CaptureConfig {
    /// Camera device index
    pub device: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { device: 0, width: 1280, height: 720, fps: 30 }
    }
}
