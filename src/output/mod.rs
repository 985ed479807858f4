//! Destinations for processed frames.

pub mod png_sink;

pub use png_sink::PngSequenceSink;

use crate::error::PipelineError;
use crate::frame::FrameMetadata;
use crate::gpu::{GpuContext, Texture, TextureFormat};
use anyhow::Result;
use std::sync::mpsc::Sender;
use tracing::debug;

/// Receives the output of every frame that makes it through the pipeline.
///
/// Called on the render thread. The texture belongs to the pipeline and is
/// only valid for the duration of the call.
pub trait FrameSink: Send {
    /// Consume a finished frame.
    fn present(&mut self, ctx: &dyn GpuContext, frame: &Texture, meta: &FrameMetadata) -> Result<()>;

    /// A frame accepted for rendering produced no output.
    fn frame_dropped(&mut self, meta: &FrameMetadata, error: &PipelineError) {
        debug!("Frame {} dropped ({})", meta.sequence, error.kind());
    }
}

/// Discards every frame.
#[derive(Debug, Default)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn present(&mut self, _ctx: &dyn GpuContext, _frame: &Texture, _meta: &FrameMetadata) -> Result<()> {
        Ok(())
    }
}

/// A frame read back to host memory as tightly packed RGBA.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentedFrame {
    pub meta: FrameMetadata,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl PresentedFrame {
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2], self.pixels[i + 3]]
    }
}

/// Reads every frame back and forwards it over a channel.
pub struct ChannelSink {
    frames: Sender<PresentedFrame>,
}

impl ChannelSink {
    pub fn new(frames: Sender<PresentedFrame>) -> Self {
        Self { frames }
    }
}

impl FrameSink for ChannelSink {
    fn present(&mut self, ctx: &dyn GpuContext, frame: &Texture, meta: &FrameMetadata) -> Result<()> {
        let pixels = read_rgba(ctx, frame)?;
        self.frames.send(PresentedFrame { meta: *meta, width: frame.width(), height: frame.height(), pixels })?;
        Ok(())
    }
}

/// Read a color texture back as RGBA bytes.
pub fn read_rgba(ctx: &dyn GpuContext, texture: &Texture) -> Result<Vec<u8>> {
    let mut bytes = ctx.read_texture(texture)?;
    match texture.format() {
        TextureFormat::Rgba8 => {}
        TextureFormat::Bgra8 => bytes.chunks_exact_mut(4).for_each(|px| px.swap(0, 2)),
        other => anyhow::bail!("cannot present a {:?} texture", other),
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CaptureFormat, Orientation};
    use crate::gpu::CpuContext;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    fn meta() -> FrameMetadata {
        FrameMetadata {
            timestamp: Duration::ZERO,
            sequence: 7,
            rotation: Orientation::None,
            capture: CaptureFormat::Packed,
            width: 2,
            height: 1,
        }
    }

    #[test]
    fn test_channel_sink_forwards_rgba() {
        let ctx = CpuContext::new();
        let mut texture = ctx.allocate_texture(2, 1, TextureFormat::Bgra8).unwrap();
        ctx.upload_texture(&mut texture, &[1, 2, 3, 4, 5, 6, 7, 8], 8).unwrap();

        let (tx, rx) = channel();
        ChannelSink::new(tx).present(&ctx, &texture, &meta()).unwrap();
        let frame = rx.recv().unwrap();
        assert_eq!(frame.meta.sequence, 7);
        assert_eq!(frame.pixel(0, 0), [3, 2, 1, 4]);
        assert_eq!(frame.pixel(1, 0), [7, 6, 5, 8]);
    }

    #[test]
    fn test_non_color_textures_are_rejected() {
        let ctx = CpuContext::new();
        let texture = ctx.allocate_texture(2, 1, TextureFormat::R8).unwrap();
        assert!(read_rgba(&ctx, &texture).is_err());
    }
}
