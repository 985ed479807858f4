//! GPU context collaborator.
//!
//! The pipeline never touches command buffers. It allocates textures, uploads
//! plane data, and asks the context to run a [`Kernel`] over input textures
//! into an output texture. Two contexts ship with the crate: [`CpuContext`],
//! a software reference, and [`WgpuContext`], which renders every kernel as a
//! full-screen fragment pass.

pub mod cpu;
pub mod shaders;
mod wgpu_context;

pub use cpu::CpuContext;
pub use wgpu_context::WgpuContext;

use crate::color::ConversionMatrix;
use crate::frame::Orientation;

/// Largest texture edge any context accepts.
pub const MAX_TEXTURE_DIMENSION: u32 = 8192;

/// Opaque handle naming a texture inside one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

/// Texel formats. All are 8-bit unsigned normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// Single channel (luma plane, edge map)
    R8,
    /// Two channels (interleaved chroma plane)
    Rg8,
    /// Four channels
    Rgba8,
    /// Four channels stored blue-first; sampling returns RGBA order
    Bgra8,
}

impl TextureFormat {
    pub fn channels(&self) -> usize {
        match self {
            TextureFormat::R8 => 1,
            TextureFormat::Rg8 => 2,
            TextureFormat::Rgba8 | TextureFormat::Bgra8 => 4,
        }
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        self.channels() as u32
    }

    pub fn to_wgpu(&self) -> wgpu::TextureFormat {
        match self {
            TextureFormat::R8 => wgpu::TextureFormat::R8Unorm,
            TextureFormat::Rg8 => wgpu::TextureFormat::Rg8Unorm,
            TextureFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Bgra8 => wgpu::TextureFormat::Bgra8Unorm,
        }
    }
}

/// A GPU-resident 2D pixel buffer.
///
/// Size and format are fixed at allocation. The version increases every time
/// the content is replaced by an upload or a render pass, which requires
/// exclusive access.
#[derive(Debug, PartialEq, Eq)]
pub struct Texture {
    id: TextureId,
    width: u32,
    height: u32,
    format: TextureFormat,
    version: u64,
}

impl Texture {
    /// Handle for a freshly allocated texture. Only contexts should call this.
    pub fn new(id: TextureId, width: u32, height: u32, format: TextureFormat) -> Self {
        Self { id, width, height, format, version: 0 }
    }

    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Record a content replacement. Contexts call this after a write.
    pub fn mark_written(&mut self) {
        self.version += 1;
    }

    /// Size in bytes of the texel data.
    pub fn byte_size(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel() as usize
    }
}

/// Program and uniforms of one render pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Kernel {
    /// Inputs: luma (R8), chroma (Rg8). Writes oriented RGB.
    YuvToRgb { matrix: ConversionMatrix, orientation: Orientation },
    /// Inputs: one RGBA texture. Writes it reoriented.
    Orient { orientation: Orientation },
    /// Inputs: RGBA. Edge-preserving smoothing.
    Bilateral { radius: u32, distance_normalization: f32 },
    /// Inputs: RGBA. Writes Gaussian-blurred luminance into the red channel.
    LuminanceBlur { radius: u32 },
    /// Inputs: R. Writes (magnitude, direction x, direction y, 1), directions
    /// quantised to -1/0/1 and stored as `(d + 1) / 2`.
    SobelGradient { strength: f32 },
    /// Inputs: gradient. Writes 1 for strong edges, 0.5 for weak ones.
    NonMaxSuppression { low: f32, high: f32 },
    /// Inputs: edge classes. Promotes weak pixels touching strong ones; the
    /// final pass clears weak pixels that were not promoted.
    Hysteresis { finalize: bool },
    /// Inputs: binary edge map. Each pixel takes the strongest edge within
    /// `radius`, attenuated linearly with distance, giving a soft ramp.
    EdgeFalloff { radius: u32 },
    /// Inputs: original, smoothed, edge map. Edge-aware blend.
    Combination { edge_low: f32, edge_high: f32, intensity: f32 },
    /// Inputs: RGBA. `out = matrix · color + offset`, rows are output channels.
    ColorMatrix { matrix: [[f32; 4]; 4], offset: [f32; 4] },
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::YuvToRgb { .. } => "yuv_to_rgb",
            Kernel::Orient { .. } => "orient",
            Kernel::Bilateral { .. } => "bilateral",
            Kernel::LuminanceBlur { .. } => "luminance_blur",
            Kernel::SobelGradient { .. } => "sobel_gradient",
            Kernel::NonMaxSuppression { .. } => "non_max_suppression",
            Kernel::Hysteresis { .. } => "hysteresis",
            Kernel::EdgeFalloff { .. } => "edge_falloff",
            Kernel::Combination { .. } => "combination",
            Kernel::ColorMatrix { .. } => "color_matrix",
        }
    }

    pub fn input_count(&self) -> usize {
        match self {
            Kernel::YuvToRgb { .. } => 2,
            Kernel::Combination { .. } => 3,
            _ => 1,
        }
    }

    /// Check input count and sizes against the output. Only the conversion
    /// kernels may change size; everything else is size-preserving.
    pub fn check_inputs(&self, inputs: &[&Texture], output: &Texture) -> Result<(), GpuError> {
        if inputs.len() != self.input_count() {
            return Err(GpuError::InvalidPass(format!(
                "{} takes {} input(s), got {}",
                self.name(),
                self.input_count(),
                inputs.len()
            )));
        }
        if inputs.iter().any(|t| t.id() == output.id()) {
            return Err(GpuError::InvalidPass(format!("{} reads its own output", self.name())));
        }
        let expected = match self {
            Kernel::YuvToRgb { orientation, .. } | Kernel::Orient { orientation } => {
                orientation.output_size(inputs[0].width(), inputs[0].height())
            }
            _ => inputs[0].size(),
        };
        if output.size() != expected {
            return Err(GpuError::InvalidPass(format!(
                "{} writes {}x{}, output is {}x{}",
                self.name(),
                expected.0,
                expected.1,
                output.width(),
                output.height()
            )));
        }
        let size_preserving = !matches!(self, Kernel::YuvToRgb { .. } | Kernel::Orient { .. });
        if size_preserving && inputs.iter().any(|t| t.size() != output.size()) {
            return Err(GpuError::InvalidPass(format!("{} inputs differ in size", self.name())));
        }
        Ok(())
    }
}

/// Failures reported by a GPU context.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GpuError {
    #[error("out of texture memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("texture size {width}x{height} is not supported (max {max})")]
    UnsupportedSize { width: u32, height: u32, max: u32 },

    #[error("unknown texture {0:?}")]
    UnknownTexture(TextureId),

    #[error("invalid render pass: {0}")]
    InvalidPass(String),

    #[error("device error: {0}")]
    Device(String),
}

/// The narrow interface the pipeline needs from a GPU.
pub trait GpuContext: Send + Sync {
    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    fn allocate_texture(&self, width: u32, height: u32, format: TextureFormat) -> Result<Texture, GpuError>;

    fn release_texture(&self, texture: Texture);

    /// Replace the content of `texture`. Rows start every `bytes_per_row` bytes.
    fn upload_texture(&self, texture: &mut Texture, data: &[u8], bytes_per_row: u32) -> Result<(), GpuError>;

    /// Run `kernel` over `inputs`, writing every texel of `output`.
    fn dispatch_render_pass(&self, kernel: &Kernel, inputs: &[&Texture], output: &mut Texture) -> Result<(), GpuError>;

    /// Copy the texel data back, tightly packed, in the texture's own layout.
    fn read_texture(&self, texture: &Texture) -> Result<Vec<u8>, GpuError>;
}

/// Reuse the texture in `slot` when it matches, otherwise replace it.
///
/// When allocation fails the slot is left empty, so the next call retries.
pub fn ensure_texture<'a>(
    ctx: &dyn GpuContext,
    slot: &'a mut Option<Texture>,
    width: u32,
    height: u32,
    format: TextureFormat,
) -> Result<&'a mut Texture, GpuError> {
    let reusable = matches!(slot, Some(t) if t.size() == (width, height) && t.format() == format);
    if !reusable {
        if let Some(stale) = slot.take() {
            ctx.release_texture(stale);
        }
        let texture = ctx.allocate_texture(width, height, format)?;
        return Ok(slot.insert(texture));
    }
    match slot {
        Some(texture) => Ok(texture),
        None => Err(GpuError::Device("texture slot emptied during reuse".into())),
    }
}

/// Check a requested size against the dimension limit.
pub(crate) fn check_size(width: u32, height: u32, max: u32) -> Result<(), GpuError> {
    if width == 0 || height == 0 || width > max || height > max {
        return Err(GpuError::UnsupportedSize { width, height, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_texture_reuses_matching_slot() {
        let ctx = CpuContext::new();
        let mut slot = None;
        let first = ensure_texture(&ctx, &mut slot, 4, 4, TextureFormat::Rgba8).unwrap().id();
        let again = ensure_texture(&ctx, &mut slot, 4, 4, TextureFormat::Rgba8).unwrap().id();
        assert_eq!(first, again);

        let resized = ensure_texture(&ctx, &mut slot, 8, 4, TextureFormat::Rgba8).unwrap().id();
        assert_ne!(first, resized);
        assert_eq!(ctx.live_textures(), 1);
    }

    #[test]
    fn ensure_texture_leaves_slot_empty_on_failure() {
        let ctx = CpuContext::with_memory_limit(64);
        let mut slot = None;
        ensure_texture(&ctx, &mut slot, 4, 4, TextureFormat::Rgba8).unwrap();
        let err = ensure_texture(&ctx, &mut slot, 8, 8, TextureFormat::Rgba8).unwrap_err();
        assert!(matches!(err, GpuError::OutOfMemory { .. }));
        assert!(slot.is_none());
        assert_eq!(ctx.live_textures(), 0);
    }

    #[test]
    fn kernels_reject_mismatched_sizes() {
        let a = Texture::new(TextureId(1), 4, 4, TextureFormat::Rgba8);
        let b = Texture::new(TextureId(2), 4, 2, TextureFormat::Rgba8);
        let out = Texture::new(TextureId(3), 4, 4, TextureFormat::Rgba8);
        let kernel = Kernel::Bilateral { radius: 1, distance_normalization: 1.0 };
        assert!(kernel.check_inputs(&[&a], &out).is_ok());
        assert!(kernel.check_inputs(&[&b], &out).is_err());
        assert!(kernel.check_inputs(&[&a, &a], &out).is_err());
        assert!(kernel.check_inputs(&[&out], &out).is_err());

        let rotated = Texture::new(TextureId(4), 2, 4, TextureFormat::Rgba8);
        let orient = Kernel::Orient { orientation: Orientation::RotateLeft };
        assert!(orient.check_inputs(&[&b], &rotated).is_ok());
    }
}
