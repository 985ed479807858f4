//! PNG export of presented frames.

use super::{read_rgba, FrameSink};
use crate::frame::FrameMetadata;
use crate::gpu::{GpuContext, Texture};
use anyhow::{Context, Result};
use image::RgbaImage;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Writes every presented frame as `frame-NNNNNN.png` into a directory.
pub struct PngSequenceSink {
    dir: PathBuf,
    written: u64,
    /// Stop writing after this many frames
    limit: Option<u64>,
}

impl PngSequenceSink {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create output directory {:?}", dir))?;
        info!("Writing frames to {:?}", dir);
        Ok(Self { dir, written: 0, limit: None })
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    fn path_for(&self, meta: &FrameMetadata) -> PathBuf {
        self.dir.join(format!("frame-{:06}.png", meta.sequence))
    }
}

impl FrameSink for PngSequenceSink {
    fn present(&mut self, ctx: &dyn GpuContext, frame: &Texture, meta: &FrameMetadata) -> Result<()> {
        if self.limit.is_some_and(|limit| self.written >= limit) {
            return Ok(());
        }
        let pixels = read_rgba(ctx, frame)?;
        let image = RgbaImage::from_raw(frame.width(), frame.height(), pixels)
            .context("Readback does not match the frame size")?;
        let path = self.path_for(meta);
        image.save(&path).with_context(|| format!("Failed to write {:?}", path))?;
        self.written += 1;
        debug!("Wrote {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CaptureFormat, Orientation};
    use crate::gpu::{CpuContext, TextureFormat};
    use std::time::Duration;

    #[test]
    fn test_writes_numbered_pngs_up_to_limit() {
        let dir = std::env::temp_dir().join(format!("veneer-png-{}", std::process::id()));
        let ctx = CpuContext::new();
        let mut texture = ctx.allocate_texture(3, 2, TextureFormat::Rgba8).unwrap();
        ctx.upload_texture(&mut texture, &[90; 24], 12).unwrap();

        let mut sink = PngSequenceSink::new(&dir).unwrap().with_limit(1);
        for sequence in 0..3 {
            let meta = FrameMetadata {
                timestamp: Duration::ZERO,
                sequence,
                rotation: Orientation::None,
                capture: CaptureFormat::Packed,
                width: 3,
                height: 2,
            };
            sink.present(&ctx, &texture, &meta).unwrap();
        }
        assert_eq!(sink.written(), 1);

        let image = image::open(dir.join("frame-000000.png")).unwrap().to_rgba8();
        assert_eq!(image.dimensions(), (3, 2));
        assert_eq!(image.get_pixel(2, 1).0, [90, 90, 90, 90]);
        assert!(!dir.join("frame-000001.png").exists());
        fs::remove_dir_all(&dir).unwrap();
    }
}
