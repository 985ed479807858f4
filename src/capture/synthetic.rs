//! Deterministic NV12 test patterns.

use super::CaptureBackend;
use crate::frame::{aligned_stride, VideoSample};
use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ROW_ALIGNMENT: usize = 16;

/// What the synthetic camera shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pattern {
    /// One uniform colour
    Solid { y: u8, cb: u8, cr: u8 },
    /// Horizontal luma ramp over neutral chroma
    Gradient,
    /// Noisy skin tone on the left, dark hair on the right
    #[default]
    SkinEdge,
}

/// Camera stand-in producing frames at a fixed interval.
pub struct SyntheticSource {
    pattern: Pattern,
    width: u32,
    height: u32,
    interval: Duration,
    produced: u64,
    limit: Option<u64>,
    rng: StdRng,
}

impl SyntheticSource {
    pub fn new(pattern: Pattern, width: u32, height: u32, fps: u32) -> Self {
        Self {
            pattern,
            width,
            height,
            interval: Duration::from_secs(1) / fps.max(1),
            produced: 0,
            limit: None,
            rng: StdRng::seed_from_u64(0),
        }
    }

    /// End the stream after `frames` samples.
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn render(&mut self) -> VideoSample {
        let (w, h) = (self.width as usize, self.height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let luma_stride = aligned_stride(w, ROW_ALIGNMENT);
        let chroma_stride = aligned_stride(cw * 2, ROW_ALIGNMENT);
        let mut luma = vec![0u8; luma_stride * h];
        let mut chroma = vec![0u8; chroma_stride * ch];
        // Skin covers the left 60%.
        let boundary = w * 3 / 5;
        let span = w.saturating_sub(1).max(1);

        for (row_index, row) in luma.chunks_mut(luma_stride).enumerate().take(h) {
            for (x, px) in row[..w].iter_mut().enumerate() {
                *px = match self.pattern {
                    Pattern::Solid { y, .. } => y,
                    Pattern::Gradient => (16 + x * 219 / span) as u8,
                    Pattern::SkinEdge if x < boundary => 170u8.saturating_add_signed(self.rng.random_range(-4..=4)),
                    Pattern::SkinEdge => 30 + (row_index % 2) as u8,
                };
            }
        }
        for row in chroma.chunks_mut(chroma_stride).take(ch) {
            for (x, pair) in row[..cw * 2].chunks_exact_mut(2).enumerate() {
                let (cb, cr) = match self.pattern {
                    Pattern::Solid { cb, cr, .. } => (cb, cr),
                    Pattern::Gradient => (128, 128),
                    Pattern::SkinEdge if x * 2 < boundary => (110, 150),
                    Pattern::SkinEdge => (128, 128),
                };
                pair[0] = cb;
                pair[1] = cr;
            }
        }

        VideoSample::nv12(self.width, self.height, luma, chroma)
    }
}

impl CaptureBackend for SyntheticSource {
    fn next_sample(&mut self) -> Result<Option<VideoSample>> {
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(None);
        }
        let timestamp = self.interval * self.produced as u32;
        self.produced += 1;
        Ok(Some(self.render().with_timestamp(timestamp)))
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn alignment(&self) -> usize {
        ROW_ALIGNMENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_are_valid_and_evenly_spaced() {
        let mut source = SyntheticSource::new(Pattern::SkinEdge, 37, 21, 25).with_limit(3);
        let mut stamps = Vec::new();
        while let Some(sample) = source.next_sample().unwrap() {
            sample.validate(source.alignment()).unwrap();
            stamps.push(sample.timestamp.unwrap());
        }
        assert_eq!(stamps, vec![Duration::ZERO, Duration::from_millis(40), Duration::from_millis(80)]);
    }

    #[test]
    fn test_same_seed_same_frames() {
        let mut a = SyntheticSource::new(Pattern::SkinEdge, 16, 8, 30).with_seed(9);
        let mut b = SyntheticSource::new(Pattern::SkinEdge, 16, 8, 30).with_seed(9);
        let (a, b) = (a.next_sample().unwrap().unwrap(), b.next_sample().unwrap().unwrap());
        assert_eq!(a.planes, b.planes);
    }

    #[test]
    fn test_solid_pattern_is_uniform() {
        let mut source = SyntheticSource::new(Pattern::Solid { y: 128, cb: 128, cr: 128 }, 8, 4, 30);
        let sample = source.next_sample().unwrap().unwrap();
        let layouts = sample.validate(ROW_ALIGNMENT).unwrap();
        let luma = &sample.planes[0].data;
        for row in luma.chunks(layouts[0].bytes_per_row as usize) {
            assert!(row[..8].iter().all(|&v| v == 128));
        }
    }

    #[test]
    fn test_gradient_spans_video_range() {
        let mut source = SyntheticSource::new(Pattern::Gradient, 64, 2, 30);
        let sample = source.next_sample().unwrap().unwrap();
        let row = &sample.planes[0].data[..64];
        assert_eq!((row[0], row[63]), (16, 235));
        assert!(row.windows(2).all(|w| w[0] <= w[1]));
    }
}
