//! Raw sample model handed over by capture/decoder collaborators.

use crate::error::{PipelineError, PipelineResult};
use crate::gpu::MAX_TEXTURE_DIMENSION;
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pixel layout of an incoming sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// NV12 semi-planar: full-resolution Y plane + half-resolution interleaved CbCr plane
    Nv12,
    /// Packed BGRA, 8 bits per channel
    Bgra,
    /// Packed RGBA, 8 bits per channel
    Rgba,
}

impl SampleFormat {
    /// Number of planes the format carries.
    pub fn plane_count(&self) -> usize {
        match self {
            SampleFormat::Nv12 => 2,
            SampleFormat::Bgra | SampleFormat::Rgba => 1,
        }
    }

    /// Whether the format splits luma and chroma into separate planes.
    pub fn is_planar(&self) -> bool {
        matches!(self, SampleFormat::Nv12)
    }
}

/// Geometry of one plane: texel dimensions and bytes per texel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    /// Row pitch in the sample buffer, padded to the alignment hint
    pub bytes_per_row: u32,
}

impl PlaneLayout {
    /// Unpadded length of one row.
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.bytes_per_pixel as usize
    }

    /// Minimum buffer length holding every row. The last row needs no padding.
    pub fn min_len(&self) -> usize {
        if self.height == 0 {
            return 0;
        }
        self.bytes_per_row as usize * (self.height as usize - 1) + self.row_bytes()
    }
}

/// Round `row_bytes` up to the next multiple of `alignment`.
pub fn aligned_stride(row_bytes: usize, alignment: usize) -> usize {
    row_bytes.div_ceil(alignment) * alignment
}

/// One plane of pixel data, rows padded to the submission alignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub data: Vec<u8>,
}

impl From<Vec<u8>> for Plane {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

/// A raw sample as produced by a camera or decoder.
#[derive(Debug, Clone)]
pub struct VideoSample {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel format tag
    pub format: SampleFormat,
    /// Presentation timestamp
    pub timestamp: Option<Duration>,
    /// Sensor-native orientation of the pixel data
    pub rotation: Orientation,
    /// Plane data, one entry per [`SampleFormat::plane_count`]
    pub planes: Vec<Plane>,
}

impl VideoSample {
    /// NV12 sample from separate luma and interleaved chroma buffers.
    pub fn nv12(width: u32, height: u32, luma: Vec<u8>, chroma: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format: SampleFormat::Nv12,
            timestamp: None,
            rotation: Orientation::None,
            planes: vec![Plane::from(luma), Plane::from(chroma)],
        }
    }

    /// Single-plane packed sample.
    pub fn packed(width: u32, height: u32, format: SampleFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            timestamp: None,
            rotation: Orientation::None,
            planes: vec![Plane::from(data)],
        }
    }

    /// Uniform NV12 sample, rows padded to `alignment`.
    pub fn solid_nv12(width: u32, height: u32, y: u8, cb: u8, cr: u8, alignment: usize) -> Self {
        let alignment = alignment.max(1);
        let luma_stride = aligned_stride(width as usize, alignment);
        let chroma_w = width.div_ceil(2) as usize;
        let chroma_h = height.div_ceil(2) as usize;
        let chroma_stride = aligned_stride(chroma_w * 2, alignment);

        let luma = vec![y; luma_stride * height as usize];
        let mut chroma = vec![0u8; chroma_stride * chroma_h];
        for row in chroma.chunks_mut(chroma_stride) {
            for pair in row[..chroma_w * 2].chunks_mut(2) {
                pair[0] = cb;
                pair[1] = cr;
            }
        }
        Self::nv12(width, height, luma, chroma)
    }

    pub fn with_timestamp(mut self, timestamp: Duration) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_rotation(mut self, rotation: Orientation) -> Self {
        self.rotation = rotation;
        self
    }

    /// Plane geometry for this sample under the given row alignment.
    pub fn plane_layouts(&self, alignment: usize) -> PipelineResult<Vec<PlaneLayout>> {
        let alignment = alignment.max(1);
        let layout = |width: u32, height: u32, bytes_per_pixel: u32| {
            let row_bytes = width as usize * bytes_per_pixel as usize;
            let bytes_per_row = row_bytes
                .div_ceil(alignment)
                .checked_mul(alignment)
                .and_then(|stride| u32::try_from(stride).ok())
                .ok_or_else(|| {
                    PipelineError::format(format!("row of {} bytes at alignment {} overflows", row_bytes, alignment))
                })?;
            Ok(PlaneLayout { width, height, bytes_per_pixel, bytes_per_row })
        };
        match self.format {
            SampleFormat::Nv12 => Ok(vec![
                layout(self.width, self.height, 1)?,
                layout(self.width.div_ceil(2), self.height.div_ceil(2), 2)?,
            ]),
            SampleFormat::Bgra | SampleFormat::Rgba => Ok(vec![layout(self.width, self.height, 4)?]),
        }
    }

    /// Check the sample against the alignment hint and return its plane layout.
    ///
    /// Nothing is mutated; a failing sample never reaches the pipeline state.
    pub fn validate(&self, alignment: usize) -> PipelineResult<Vec<PlaneLayout>> {
        if alignment == 0 {
            return Err(PipelineError::format("alignment must be a positive integer"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(PipelineError::format(format!(
                "zero-sized sample ({}x{})",
                self.width, self.height
            )));
        }
        if self.width > MAX_TEXTURE_DIMENSION || self.height > MAX_TEXTURE_DIMENSION {
            return Err(PipelineError::format(format!(
                "{}x{} sample exceeds the {} pixel limit",
                self.width, self.height, MAX_TEXTURE_DIMENSION
            )));
        }
        if self.timestamp.is_none() {
            return Err(PipelineError::format("sample carries no timestamp"));
        }
        if self.planes.len() != self.format.plane_count() {
            return Err(PipelineError::format(format!(
                "{:?} expects {} plane(s), got {}",
                self.format,
                self.format.plane_count(),
                self.planes.len()
            )));
        }

        let layouts = self.plane_layouts(alignment)?;
        for (index, (plane, layout)) in self.planes.iter().zip(&layouts).enumerate() {
            if plane.data.len() < layout.min_len() {
                return Err(PipelineError::format(format!(
                    "plane {} holds {} bytes, needs {} at stride {}",
                    index,
                    plane.data.len(),
                    layout.min_len(),
                    layout.bytes_per_row
                )));
            }
        }
        Ok(layouts)
    }
}

/// Orientation of pixel data, the eight symmetries of a rectangle.
///
/// Rotations are clockwise. The two combined modes rotate right first and
/// flip afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Orientation {
    #[default]
    None,
    RotateLeft,
    RotateRight,
    FlipVertical,
    FlipHorizontal,
    RotateRightFlipVertical,
    RotateRightFlipHorizontal,
    Rotate180,
}

impl Orientation {
    pub const ALL: [Orientation; 8] = [
        Orientation::None,
        Orientation::RotateLeft,
        Orientation::RotateRight,
        Orientation::FlipVertical,
        Orientation::FlipHorizontal,
        Orientation::RotateRightFlipVertical,
        Orientation::RotateRightFlipHorizontal,
        Orientation::Rotate180,
    ];

    /// Matrix taking centered source coordinates (y down) to centered
    /// destination coordinates.
    pub fn matrix(&self) -> [[i32; 2]; 2] {
        match self {
            Orientation::None => [[1, 0], [0, 1]],
            Orientation::RotateRight => [[0, -1], [1, 0]],
            Orientation::Rotate180 => [[-1, 0], [0, -1]],
            Orientation::RotateLeft => [[0, 1], [-1, 0]],
            Orientation::FlipHorizontal => [[-1, 0], [0, 1]],
            Orientation::FlipVertical => [[1, 0], [0, -1]],
            Orientation::RotateRightFlipVertical => [[0, -1], [-1, 0]],
            Orientation::RotateRightFlipHorizontal => [[0, 1], [1, 0]],
        }
    }

    /// Build from a clockwise angle and an optional horizontal mirror applied
    /// before rotating. Angles that are not multiples of 90 are rejected.
    pub fn from_degrees(degrees: i32, mirrored: bool) -> Option<Self> {
        let turns = match degrees.rem_euclid(360) {
            0 => Orientation::None,
            90 => Orientation::RotateRight,
            180 => Orientation::Rotate180,
            270 => Orientation::RotateLeft,
            _ => return None,
        };
        Some(if mirrored {
            Orientation::FlipHorizontal.then(turns)
        } else {
            turns
        })
    }

    /// Apply `self`, then `next`.
    pub fn then(self, next: Orientation) -> Orientation {
        let a = self.matrix();
        let b = next.matrix();
        let mut product = [[0i32; 2]; 2];
        for (r, row) in product.iter_mut().enumerate() {
            for (c, cell) in row.iter_mut().enumerate() {
                *cell = b[r][0] * a[0][c] + b[r][1] * a[1][c];
            }
        }
        Self::ALL
            .into_iter()
            .find(|o| o.matrix() == product)
            .unwrap_or(Orientation::None)
    }

    /// Whether width and height trade places.
    pub fn swaps_dimensions(&self) -> bool {
        self.matrix()[0][0] == 0
    }

    /// Size of the oriented image.
    pub fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        if self.swaps_dimensions() {
            (height, width)
        } else {
            (width, height)
        }
    }

    /// Source pixel feeding destination pixel `(dx, dy)` of an oriented image.
    pub fn source_pixel(&self, dx: u32, dy: u32, src_width: u32, src_height: u32) -> (u32, u32) {
        let (dst_width, dst_height) = self.output_size(src_width, src_height);
        // Doubled centered coordinates keep pixel centers on integers.
        let u = 2 * dx as i64 + 1 - dst_width as i64;
        let v = 2 * dy as i64 + 1 - dst_height as i64;
        let m = self.matrix();
        // Orthogonal matrix: the inverse is the transpose.
        let su = m[0][0] as i64 * u + m[1][0] as i64 * v;
        let sv = m[0][1] as i64 * u + m[1][1] as i64 * v;
        let sx = (su + src_width as i64 - 1) / 2;
        let sy = (sv + src_height as i64 - 1) / 2;
        (sx as u32, sy as u32)
    }
}

/// Whether a sample arrived as planar luma/chroma or packed RGB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFormat {
    Planar,
    Packed,
}

/// Per-frame facts gathered at submission, discarded after presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    pub timestamp: Duration,
    pub sequence: u64,
    /// Effective orientation (sensor orientation, then output rotation)
    pub rotation: Orientation,
    pub capture: CaptureFormat,
    /// Size of the converted, oriented frame
    pub width: u32,
    pub height: u32,
}

/// Vertex for rendering a full-screen quad.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 2],
    pub tex_coords: [f32; 2],
}

impl QuadVertex {
    /// Vertices for a full-screen quad.
    pub const VERTICES: &'static [QuadVertex] = &[
        QuadVertex { position: [-1.0, -1.0], tex_coords: [0.0, 1.0] },
        QuadVertex { position: [1.0, -1.0], tex_coords: [1.0, 1.0] },
        QuadVertex { position: [1.0, 1.0], tex_coords: [1.0, 0.0] },
        QuadVertex { position: [-1.0, 1.0], tex_coords: [0.0, 0.0] },
    ];

    /// Indices for the quad (two triangles).
    pub const INDICES: &'static [u16] = &[0, 1, 2, 2, 3, 0];

    /// Returns the vertex buffer layout.
    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x2,
                },
                wgpu::VertexAttribute {
                    offset: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nv12_layout_rounds_chroma_up() {
        let sample = VideoSample::solid_nv12(5, 3, 128, 128, 128, 4).with_timestamp(Duration::ZERO);
        let layouts = sample.validate(4).unwrap();
        assert_eq!(layouts[0].bytes_per_row, 8);
        assert_eq!((layouts[1].width, layouts[1].height), (3, 2));
        assert_eq!(layouts[1].bytes_per_row, 8);
    }

    #[test]
    fn test_validation_rejects_bad_samples() {
        let good = VideoSample::solid_nv12(4, 4, 16, 128, 128, 1).with_timestamp(Duration::ZERO);
        assert!(good.validate(1).is_ok());
        assert!(matches!(good.validate(0), Err(PipelineError::Format(_))));

        let untimed = VideoSample::solid_nv12(4, 4, 16, 128, 128, 1);
        assert!(matches!(untimed.validate(1), Err(PipelineError::Format(_))));

        let empty = VideoSample::packed(0, 4, SampleFormat::Rgba, vec![]).with_timestamp(Duration::ZERO);
        assert!(matches!(empty.validate(1), Err(PipelineError::Format(_))));

        let short = VideoSample::packed(4, 4, SampleFormat::Rgba, vec![0; 63]).with_timestamp(Duration::ZERO);
        assert!(matches!(short.validate(1), Err(PipelineError::Format(_))));

        let huge = VideoSample::packed(MAX_TEXTURE_DIMENSION + 1, 1, SampleFormat::Rgba, vec![])
            .with_timestamp(Duration::ZERO);
        assert!(matches!(huge.validate(1), Err(PipelineError::Format(_))));

        let overflowing = VideoSample::packed(4, 1, SampleFormat::Rgba, vec![0; 16]).with_timestamp(Duration::ZERO);
        assert!(matches!(overflowing.validate(usize::MAX), Err(PipelineError::Format(_))));

        // Padding on the last row is optional.
        let padded = VideoSample::packed(3, 2, SampleFormat::Rgba, vec![0; 16 + 12]).with_timestamp(Duration::ZERO);
        assert!(padded.validate(16).is_ok());
    }

    #[test]
    fn test_orientation_group_is_closed() {
        for a in Orientation::ALL {
            for b in Orientation::ALL {
                let composed = a.then(b);
                let m = composed.matrix();
                let expected = {
                    let (ma, mb) = (a.matrix(), b.matrix());
                    [
                        [mb[0][0] * ma[0][0] + mb[0][1] * ma[1][0], mb[0][0] * ma[0][1] + mb[0][1] * ma[1][1]],
                        [mb[1][0] * ma[0][0] + mb[1][1] * ma[1][0], mb[1][0] * ma[0][1] + mb[1][1] * ma[1][1]],
                    ]
                };
                assert_eq!(m, expected, "{:?} then {:?}", a, b);
            }
        }
        assert_eq!(Orientation::RotateRight.then(Orientation::RotateLeft), Orientation::None);
        assert_eq!(Orientation::RotateRight.then(Orientation::RotateRight), Orientation::Rotate180);
        assert_eq!(Orientation::from_degrees(-90, false), Some(Orientation::RotateLeft));
        assert_eq!(Orientation::from_degrees(45, false), None);
    }

    #[test]
    fn test_rotate_right_moves_bottom_left_to_top_left() {
        // 4x2 source becomes 2x4.
        let o = Orientation::RotateRight;
        assert_eq!(o.output_size(4, 2), (2, 4));
        assert_eq!(o.source_pixel(0, 0, 4, 2), (0, 1));
        assert_eq!(o.source_pixel(1, 0, 4, 2), (0, 0));
        assert_eq!(o.source_pixel(1, 3, 4, 2), (3, 0));
    }

    #[test]
    fn test_source_pixel_is_a_bijection() {
        let (w, h) = (5u32, 3u32);
        for o in Orientation::ALL {
            let (ow, oh) = o.output_size(w, h);
            let mut seen = vec![false; (w * h) as usize];
            for dy in 0..oh {
                for dx in 0..ow {
                    let (sx, sy) = o.source_pixel(dx, dy, w, h);
                    assert!(sx < w && sy < h, "{:?} maps out of bounds", o);
                    seen[(sy * w + sx) as usize] = true;
                }
            }
            assert!(seen.iter().all(|s| *s), "{:?} is not a bijection", o);
        }
    }
}
