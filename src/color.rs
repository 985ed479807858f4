//! Luma/chroma to RGB conversion.
//!
//! A [`ConversionMatrix`] maps normalized `(Y, Cb, Cr)` to RGB as
//! `rgb = coefficients · (yuv - bias) + constant`. The three built-in profiles
//! follow the classic video tables; custom tables can be given as a 3×3
//! matrix plus range or as a full 4×4 affine matrix.
//!
//! The active profile lives behind an `Arc` that is swapped whole, so a
//! conversion in progress always sees one consistent table.

use crate::frame::Orientation;
use crate::gpu::{ensure_texture, GpuContext, GpuError, Kernel, Texture, TextureFormat};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Luma offset of limited ("video") range signals.
pub const LIMITED_LUMA_OFFSET: f32 = 16.0 / 255.0;
/// Chroma value carrying no color in 8-bit signals.
pub const CHROMA_NEUTRAL: f32 = 128.0 / 255.0;

const BT601_LIMITED: [f32; 9] = [1.164, 1.164, 1.164, 0.0, -0.392, 2.017, 1.596, -0.813, 0.0];
const BT601_FULL: [f32; 9] = [1.0, 1.0, 1.0, 0.0, -0.343, 1.765, 1.4, -0.711, 0.0];
const BT709: [f32; 9] = [1.164, 1.164, 1.164, 0.0, -0.213, 2.112, 1.793, -0.533, 0.0];

/// Numeric range of the luma signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorRange {
    /// Luma spans 16..=235
    Limited,
    /// Luma spans 0..=255
    Full,
}

/// Errors building a custom conversion table.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum MatrixError {
    #[error("conversion table needs 9 or 16 coefficients, got {0}")]
    WrongLength(usize),
    #[error("conversion table contains a non-finite coefficient")]
    NonFinite,
}

/// Affine YCbCr to RGB transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConversionMatrix {
    /// Row-major: one row per output channel, one column per input component
    pub coefficients: [[f32; 3]; 3],
    /// Subtracted from `(Y, Cb, Cr)` before the multiply
    pub bias: [f32; 3],
    /// Added to the result
    pub constant: [f32; 3],
}

impl ConversionMatrix {
    /// Build from a column-major 3×3 table (Y column, Cb column, Cr column).
    pub fn from_3x3(table: [f32; 9], range: ColorRange) -> Self {
        let mut coefficients = [[0.0; 3]; 3];
        for (column, values) in table.chunks(3).enumerate() {
            for (row, value) in values.iter().enumerate() {
                coefficients[row][column] = *value;
            }
        }
        let luma_offset = match range {
            ColorRange::Limited => LIMITED_LUMA_OFFSET,
            ColorRange::Full => 0.0,
        };
        Self {
            coefficients,
            bias: [luma_offset, CHROMA_NEUTRAL, CHROMA_NEUTRAL],
            constant: [0.0; 3],
        }
    }

    /// Build from a column-major 4×4 table acting on `(Y, Cb, Cr, 1)`.
    /// The fourth output row is ignored.
    pub fn from_4x4(table: [f32; 16]) -> Self {
        let mut coefficients = [[0.0; 3]; 3];
        let mut constant = [0.0; 3];
        for row in 0..3 {
            for column in 0..3 {
                coefficients[row][column] = table[column * 4 + row];
            }
            constant[row] = table[12 + row];
        }
        Self { coefficients, bias: [0.0; 3], constant }
    }

    /// Build from a 9- or 16-entry slice. `range` only applies to 9 entries.
    pub fn from_slice(table: &[f32], range: ColorRange) -> Result<Self, MatrixError> {
        if table.iter().any(|v| !v.is_finite()) {
            return Err(MatrixError::NonFinite);
        }
        match table.len() {
            9 => {
                let mut fixed = [0.0; 9];
                fixed.copy_from_slice(table);
                Ok(Self::from_3x3(fixed, range))
            }
            16 => {
                let mut fixed = [0.0; 16];
                fixed.copy_from_slice(table);
                Ok(Self::from_4x4(fixed))
            }
            n => Err(MatrixError::WrongLength(n)),
        }
    }

    /// Convert one normalized `(Y, Cb, Cr)` triple. The result is not clamped.
    pub fn apply(&self, yuv: [f32; 3]) -> [f32; 3] {
        let centered = [yuv[0] - self.bias[0], yuv[1] - self.bias[1], yuv[2] - self.bias[2]];
        let mut rgb = self.constant;
        for (out, row) in rgb.iter_mut().zip(&self.coefficients) {
            *out += row[0] * centered[0] + row[1] * centered[1] + row[2] * centered[2];
        }
        rgb
    }
}

/// A named conversion preset or a custom table.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ConversionProfile {
    #[default]
    Bt601Limited,
    Bt601Full,
    Bt709,
    Custom(ConversionMatrix),
}

impl ConversionProfile {
    pub fn name(&self) -> &'static str {
        match self {
            ConversionProfile::Bt601Limited => "bt601-limited",
            ConversionProfile::Bt601Full => "bt601-full",
            ConversionProfile::Bt709 => "bt709",
            ConversionProfile::Custom(_) => "custom",
        }
    }

    pub fn matrix(&self) -> ConversionMatrix {
        match self {
            ConversionProfile::Bt601Limited => ConversionMatrix::from_3x3(BT601_LIMITED, ColorRange::Limited),
            ConversionProfile::Bt601Full => ConversionMatrix::from_3x3(BT601_FULL, ColorRange::Full),
            ConversionProfile::Bt709 => ConversionMatrix::from_3x3(BT709, ColorRange::Limited),
            ConversionProfile::Custom(matrix) => *matrix,
        }
    }
}

struct ActiveProfile {
    profile: ConversionProfile,
    matrix: ConversionMatrix,
}

/// Color Conversion Unit: converts uploaded planes into one RGBA texture.
pub struct ColorConversion {
    active: RwLock<Arc<ActiveProfile>>,
}

impl ColorConversion {
    pub fn new(profile: ConversionProfile) -> Self {
        Self {
            active: RwLock::new(Arc::new(ActiveProfile { profile, matrix: profile.matrix() })),
        }
    }

    /// Replace the active profile. Conversions already running keep the table
    /// they started with.
    pub fn set_profile(&self, profile: ConversionProfile) {
        let next = Arc::new(ActiveProfile { profile, matrix: profile.matrix() });
        let mut guard = self.active.write().unwrap_or_else(|e| e.into_inner());
        *guard = next;
        info!("Conversion profile set to {}", profile.name());
    }

    pub fn profile(&self) -> ConversionProfile {
        self.snapshot().profile
    }

    pub fn matrix(&self) -> ConversionMatrix {
        self.snapshot().matrix
    }

    fn snapshot(&self) -> Arc<ActiveProfile> {
        self.active.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Produce an RGB texture from `luma` (+ `chroma`), oriented by `orientation`.
    ///
    /// Without a chroma plane the input is already RGB: with no reorientation
    /// the luma texture itself is returned and `output` is left untouched.
    /// Otherwise `output` is allocated or reused at the oriented size.
    pub fn convert<'a>(
        &self,
        ctx: &dyn GpuContext,
        luma: &'a Texture,
        chroma: Option<&Texture>,
        orientation: Orientation,
        output: &'a mut Option<Texture>,
    ) -> Result<&'a Texture, GpuError> {
        if chroma.is_none() && orientation == Orientation::None {
            return Ok(luma);
        }

        let (width, height) = orientation.output_size(luma.width(), luma.height());
        let target = ensure_texture(ctx, output, width, height, TextureFormat::Rgba8)?;
        match chroma {
            Some(chroma) => {
                if luma.format() != TextureFormat::R8 || chroma.format() != TextureFormat::Rg8 {
                    return Err(GpuError::InvalidPass(format!(
                        "planar conversion expects R8 + Rg8 planes, got {:?} + {:?}",
                        luma.format(),
                        chroma.format()
                    )));
                }
                let kernel = Kernel::YuvToRgb { matrix: self.matrix(), orientation };
                ctx.dispatch_render_pass(&kernel, &[luma, chroma], &mut *target)?;
            }
            None => {
                ctx.dispatch_render_pass(&Kernel::Orient { orientation }, &[luma], &mut *target)?;
            }
        }
        Ok(target)
    }
}

impl Default for ColorConversion {
    fn default() -> Self {
        Self::new(ConversionProfile::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::cpu::CpuContext;

    fn planes(ctx: &CpuContext, luma: &[u8], width: u32, cb: u8, cr: u8) -> (Texture, Texture) {
        let chroma_w = width.div_ceil(2);
        let mut y = ctx.allocate_texture(width, 1, TextureFormat::R8).unwrap();
        ctx.upload_texture(&mut y, luma, width).unwrap();
        let mut uv = ctx.allocate_texture(chroma_w, 1, TextureFormat::Rg8).unwrap();
        let chroma: Vec<u8> = (0..chroma_w).flat_map(|_| [cb, cr]).collect();
        ctx.upload_texture(&mut uv, &chroma, chroma_w * 2).unwrap();
        (y, uv)
    }

    #[test]
    fn test_full_range_keeps_gray_gray() {
        let ctx = CpuContext::new();
        let luma: Vec<u8> = (0..=255).collect();
        let (y, uv) = planes(&ctx, &luma, 256, 128, 128);
        let conversion = ColorConversion::new(ConversionProfile::Bt601Full);
        let mut out = None;
        let rgb = conversion.convert(&ctx, &y, Some(&uv), Orientation::None, &mut out).unwrap();
        let pixels = ctx.read_texture(rgb).unwrap();
        for (value, px) in luma.iter().zip(pixels.chunks(4)) {
            assert_eq!(px[0], px[1], "Y={}", value);
            assert_eq!(px[1], px[2], "Y={}", value);
            assert_eq!(px[0], *value);
            assert_eq!(px[3], 255);
        }
    }

    #[test]
    fn test_achromatic_matrix_output_for_every_luma() {
        let matrix = ConversionProfile::Bt601Full.matrix();
        for y in 0..=255u32 {
            let rgb = matrix.apply([y as f32 / 255.0, CHROMA_NEUTRAL, CHROMA_NEUTRAL]);
            assert!((rgb[0] - rgb[1]).abs() < 1e-6 && (rgb[1] - rgb[2]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_limited_range_mid_gray_maps_to_130() {
        let ctx = CpuContext::new();
        let (y, uv) = planes(&ctx, &[128, 128], 2, 128, 128);
        let conversion = ColorConversion::new(ConversionProfile::Bt601Limited);
        let mut out = None;
        let rgb = conversion.convert(&ctx, &y, Some(&uv), Orientation::None, &mut out).unwrap();
        let pixels = ctx.read_texture(rgb).unwrap();
        assert_eq!(&pixels[0..4], &[130, 130, 130, 255]);
    }

    #[test]
    fn test_limited_range_clamps_black_and_white() {
        let matrix = ConversionProfile::Bt709.matrix();
        let black = matrix.apply([LIMITED_LUMA_OFFSET, CHROMA_NEUTRAL, CHROMA_NEUTRAL]);
        assert!(black.iter().all(|c| c.abs() < 1e-6));
        let white = matrix.apply([235.0 / 255.0, CHROMA_NEUTRAL, CHROMA_NEUTRAL]);
        assert!(white.iter().all(|c| (c - 1.0).abs() < 0.01));
    }

    #[test]
    fn test_red_chroma_pushes_red() {
        let matrix = ConversionProfile::Bt601Full.matrix();
        let rgb = matrix.apply([0.5, CHROMA_NEUTRAL, 1.0]);
        assert!(rgb[0] > rgb[1] && rgb[0] > rgb[2]);
    }

    #[test]
    fn test_custom_tables() {
        assert_eq!(
            ConversionMatrix::from_slice(&[1.0; 4], ColorRange::Full),
            Err(MatrixError::WrongLength(4))
        );
        assert_eq!(
            ConversionMatrix::from_slice(&[f32::NAN; 9], ColorRange::Full),
            Err(MatrixError::NonFinite)
        );

        // 4x4 that copies luma into red and adds a constant blue.
        let mut table = [0.0; 16];
        table[0] = 1.0;
        table[14] = 0.25;
        let matrix = ConversionMatrix::from_slice(&table, ColorRange::Full).unwrap();
        assert_eq!(matrix.apply([0.5, 0.9, 0.1]), [0.5, 0.0, 0.25]);

        let nine = ConversionMatrix::from_slice(&BT601_FULL, ColorRange::Full).unwrap();
        assert_eq!(nine, ConversionProfile::Bt601Full.matrix());
    }

    #[test]
    fn test_profile_swap_applies_to_next_call() {
        let ctx = CpuContext::new();
        let (y, uv) = planes(&ctx, &[128, 128], 2, 128, 128);
        let conversion = ColorConversion::new(ConversionProfile::Bt601Limited);

        let mut out = None;
        let first = ctx.read_texture(conversion.convert(&ctx, &y, Some(&uv), Orientation::None, &mut out).unwrap()).unwrap();
        conversion.set_profile(ConversionProfile::Bt601Full);
        assert_eq!(conversion.profile(), ConversionProfile::Bt601Full);
        let second = ctx.read_texture(conversion.convert(&ctx, &y, Some(&uv), Orientation::None, &mut out).unwrap()).unwrap();
        assert_eq!(first[0], 130);
        assert_eq!(second[0], 128);
    }

    #[test]
    fn test_packed_input_passes_through() {
        let ctx = CpuContext::new();
        let mut rgba = ctx.allocate_texture(1, 1, TextureFormat::Rgba8).unwrap();
        ctx.upload_texture(&mut rgba, &[10, 20, 30, 255], 4).unwrap();
        let conversion = ColorConversion::default();
        let mut out = None;
        let result = conversion.convert(&ctx, &rgba, None, Orientation::None, &mut out).unwrap();
        assert_eq!(result.id(), rgba.id());
        assert!(out.is_none());
    }

    #[test]
    fn test_packed_input_with_rotation_is_reoriented() {
        let ctx = CpuContext::new();
        let mut rgba = ctx.allocate_texture(2, 1, TextureFormat::Rgba8).unwrap();
        ctx.upload_texture(&mut rgba, &[255, 0, 0, 255, 0, 0, 255, 255], 8).unwrap();
        let conversion = ColorConversion::default();
        let mut out = None;
        let rotated = conversion.convert(&ctx, &rgba, None, Orientation::RotateRight, &mut out).unwrap();
        assert_eq!((rotated.width(), rotated.height()), (1, 2));
        let pixels = ctx.read_texture(rotated).unwrap();
        // Left pixel (red) ends up on top after a clockwise turn.
        assert_eq!(&pixels[0..4], &[255, 0, 0, 255]);
        assert_eq!(&pixels[4..8], &[0, 0, 255, 255]);
    }
}
