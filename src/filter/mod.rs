//! Filter stages and their composition.
//!
//! A stage turns one or more input textures into exactly one output texture by
//! dispatching kernels on a [`GpuContext`]. Stages own whatever scratch
//! textures they need; the graph owns their outputs.

pub mod beautify;
pub mod bilateral;
pub mod canny;
pub mod combination;
pub mod graph;
pub mod hsb;

pub use beautify::{BeautifyError, BeautifyFilter, BeautifyParams};
pub use bilateral::{BilateralFilter, SmoothingParams};
pub use canny::{CannyEdgeDetection, EdgeParams};
pub use combination::{BlendParams, CombinationFilter};
pub use graph::{Edge, FilterGraph, GraphBuilder, GraphError, NodeId};
pub use hsb::{HsbFilter, ToneParams};

use crate::gpu::{GpuContext, GpuError, Texture, TextureFormat};
use std::any::Any;
use std::ops::RangeInclusive;

/// One numeric knob of a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: &'static str,
    pub value: f32,
    pub range: RangeInclusive<f32>,
}

impl Parameter {
    pub fn new(name: &'static str, value: f32, range: RangeInclusive<f32>) -> Self {
        Self { name, value, range }
    }
}

/// Rejected parameter updates.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    #[error("stage {stage} has no parameter named {name:?}")]
    Unknown { stage: &'static str, name: String },

    #[error("{name} = {value} is outside {min}..={max}")]
    OutOfRange { name: &'static str, value: f32, min: f32, max: f32 },

    #[error("{low} must not exceed {high}")]
    Inverted { low: &'static str, high: &'static str },
}

/// Check `value` against `range`.
pub fn check_range(name: &'static str, value: f32, range: RangeInclusive<f32>) -> Result<f32, ParameterError> {
    if value.is_finite() && range.contains(&value) {
        Ok(value)
    } else {
        Err(ParameterError::OutOfRange { name, value, min: *range.start(), max: *range.end() })
    }
}

/// A single image operator.
pub trait FilterStage: Send + Any {
    fn name(&self) -> &'static str;

    /// Number of input textures `apply` expects.
    fn input_count(&self) -> usize {
        1
    }

    /// Format of the texture `apply` writes.
    fn output_format(&self) -> TextureFormat {
        TextureFormat::Rgba8
    }

    /// Current values and valid ranges of every tunable parameter.
    fn parameters(&self) -> Vec<Parameter>;

    /// Update one parameter by name. Takes effect on the next `apply`.
    fn set_parameter(&mut self, name: &str, value: f32) -> Result<(), ParameterError>;

    /// Render into `output`, which is sized like `inputs[0]`.
    fn apply(&mut self, ctx: &dyn GpuContext, inputs: &[&Texture], output: &mut Texture) -> Result<(), GpuError>;

    /// Free scratch textures.
    fn release(&mut self, _ctx: &dyn GpuContext) {}

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[cfg(test)]
pub(crate) mod test_util {
    use crate::gpu::{CpuContext, GpuContext, Texture, TextureFormat};

    pub fn rgba(ctx: &CpuContext, width: u32, height: u32, pixel: impl Fn(u32, u32) -> [u8; 4]) -> Texture {
        let data: Vec<u8> = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .flat_map(|(x, y)| pixel(x, y))
            .collect();
        let mut texture = ctx.allocate_texture(width, height, TextureFormat::Rgba8).unwrap();
        ctx.upload_texture(&mut texture, &data, width * 4).unwrap();
        texture
    }

    pub fn r8(ctx: &CpuContext, width: u32, height: u32, value: impl Fn(u32, u32) -> u8) -> Texture {
        let data: Vec<u8> = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| value(x, y))
            .collect();
        let mut texture = ctx.allocate_texture(width, height, TextureFormat::R8).unwrap();
        ctx.upload_texture(&mut texture, &data, width).unwrap();
        texture
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_check_rejects_nan_and_outliers() {
        assert_eq!(check_range("radius", 2.0, 1.0..=8.0), Ok(2.0));
        assert!(check_range("radius", 9.0, 1.0..=8.0).is_err());
        assert!(check_range("radius", f32::NAN, 1.0..=8.0).is_err());
    }
}
