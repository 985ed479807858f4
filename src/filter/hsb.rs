//! Hue / saturation / brightness adjustment.

use super::{check_range, FilterStage, Parameter, ParameterError};
use crate::gpu::{GpuContext, GpuError, Kernel, Texture};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::ops::RangeInclusive;

const HUE: RangeInclusive<f32> = -180.0..=180.0;
const DELTA: RangeInclusive<f32> = -1.0..=1.0;

// Luminance weights of the saturation matrix.
const LUMA_R: f32 = 0.3086;
const LUMA_G: f32 = 0.6094;
const LUMA_B: f32 = 0.0820;

/// Tone deltas. All zero is the identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ToneParams {
    /// Hue rotation in degrees
    pub hue: f32,
    /// Saturation offset from 1.0
    pub saturation: f32,
    /// Brightness offset from 1.0
    pub brightness: f32,
}

impl Default for ToneParams {
    fn default() -> Self {
        Self { hue: 0.0, saturation: 0.1, brightness: 0.1 }
    }
}

impl ToneParams {
    pub const IDENTITY: ToneParams = ToneParams { hue: 0.0, saturation: 0.0, brightness: 0.0 };

    pub fn validate(&self) -> Result<(), ParameterError> {
        check_range("hue", self.hue, HUE)?;
        check_range("saturation", self.saturation, DELTA)?;
        check_range("brightness", self.brightness, DELTA)?;
        Ok(())
    }

    /// RGB transform: brightness · saturation · hue rotation.
    pub fn matrix(&self) -> [[f32; 3]; 3] {
        let s = 1.0 + self.saturation;
        let saturate = [
            [(1.0 - s) * LUMA_R + s, (1.0 - s) * LUMA_G, (1.0 - s) * LUMA_B],
            [(1.0 - s) * LUMA_R, (1.0 - s) * LUMA_G + s, (1.0 - s) * LUMA_B],
            [(1.0 - s) * LUMA_R, (1.0 - s) * LUMA_G, (1.0 - s) * LUMA_B + s],
        ];

        // Rodrigues rotation about the gray axis (1, 1, 1) / sqrt(3).
        let (sin, cos) = self.hue.to_radians().sin_cos();
        let k = sin / 3f32.sqrt();
        let shared = (1.0 - cos) / 3.0;
        let rotate = [
            [cos + shared, shared - k, shared + k],
            [shared + k, cos + shared, shared - k],
            [shared - k, shared + k, cos + shared],
        ];

        let b = 1.0 + self.brightness;
        let mut out = [[0.0f32; 3]; 3];
        for (r, row) in out.iter_mut().enumerate() {
            for (c, cell) in row.iter_mut().enumerate() {
                *cell = b * (0..3).map(|i| saturate[r][i] * rotate[i][c]).sum::<f32>();
            }
        }
        out
    }

    fn kernel(&self) -> Kernel {
        let m = self.matrix();
        let mut matrix = [[0.0f32; 4]; 4];
        for (dst, src) in matrix.iter_mut().zip(&m) {
            dst[..3].copy_from_slice(src);
        }
        matrix[3][3] = 1.0;
        Kernel::ColorMatrix { matrix, offset: [0.0; 4] }
    }
}

/// Final colour stage of the beautify chain.
#[derive(Debug, Default)]
pub struct HsbFilter {
    params: ToneParams,
}

impl HsbFilter {
    pub fn new(params: ToneParams) -> Result<Self, ParameterError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> ToneParams {
        self.params
    }

    pub fn configure(&mut self, params: ToneParams) -> Result<(), ParameterError> {
        params.validate()?;
        self.params = params;
        Ok(())
    }
}

impl FilterStage for HsbFilter {
    fn name(&self) -> &'static str {
        "hsb"
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![
            Parameter::new("hue", self.params.hue, HUE),
            Parameter::new("saturation", self.params.saturation, DELTA),
            Parameter::new("brightness", self.params.brightness, DELTA),
        ]
    }

    fn set_parameter(&mut self, name: &str, value: f32) -> Result<(), ParameterError> {
        match name {
            "hue" => self.params.hue = check_range("hue", value, HUE)?,
            "saturation" => self.params.saturation = check_range("saturation", value, DELTA)?,
            "brightness" => self.params.brightness = check_range("brightness", value, DELTA)?,
            _ => return Err(ParameterError::Unknown { stage: self.name(), name: name.to_string() }),
        }
        Ok(())
    }

    fn apply(&mut self, ctx: &dyn GpuContext, inputs: &[&Texture], output: &mut Texture) -> Result<(), GpuError> {
        ctx.dispatch_render_pass(&self.params.kernel(), inputs, output)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::test_util::rgba;
    use crate::gpu::{CpuContext, TextureFormat};

    fn tone(params: ToneParams, pixel: [u8; 4]) -> Vec<u8> {
        let ctx = CpuContext::new();
        let input = rgba(&ctx, 1, 1, |_, _| pixel);
        let mut output = ctx.allocate_texture(1, 1, TextureFormat::Rgba8).unwrap();
        HsbFilter::new(params).unwrap().apply(&ctx, &[&input], &mut output).unwrap();
        ctx.read_texture(&output).unwrap()
    }

    #[test]
    fn test_zero_deltas_are_the_identity() {
        let m = ToneParams::IDENTITY.matrix();
        assert_eq!(m, [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        assert_eq!(tone(ToneParams::IDENTITY, [12, 130, 250, 77]), vec![12, 130, 250, 77]);
    }

    #[test]
    fn test_full_desaturation_gives_gray() {
        let px = tone(ToneParams { saturation: -1.0, ..ToneParams::IDENTITY }, [200, 40, 90, 255]);
        assert_eq!(px[0], px[1]);
        assert_eq!(px[1], px[2]);
    }

    #[test]
    fn test_hue_rotation_keeps_gray_and_cycles_primaries() {
        let gray = tone(ToneParams { hue: 75.0, ..ToneParams::IDENTITY }, [100, 100, 100, 255]);
        assert_eq!(gray, vec![100, 100, 100, 255]);

        let m = ToneParams { hue: 120.0, ..ToneParams::IDENTITY }.matrix();
        // 120 degrees maps red onto green.
        let green = [m[0][0], m[1][0], m[2][0]];
        assert!(green[0].abs() < 1e-5 && (green[1] - 1.0).abs() < 1e-5 && green[2].abs() < 1e-5);
    }

    #[test]
    fn test_brightness_scales() {
        let px = tone(ToneParams { brightness: 0.5, ..ToneParams::IDENTITY }, [100, 50, 20, 255]);
        assert_eq!(px, vec![150, 75, 30, 255]);
    }
}
