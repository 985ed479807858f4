//! Edge-preserving smoothing.

use super::{check_range, FilterStage, Parameter, ParameterError};
use crate::gpu::{GpuContext, GpuError, Kernel, Texture};
use serde::{Deserialize, Serialize};
use std::any::Any;

const RADIUS: std::ops::RangeInclusive<f32> = 1.0..=8.0;
const DISTANCE_NORMALIZATION: std::ops::RangeInclusive<f32> = 0.0..=20.0;

/// Settings of the smoothing branch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SmoothingParams {
    /// Neighbourhood radius in pixels
    pub radius: u32,
    /// How fast the weight of a neighbour falls with its colour distance.
    /// Higher values preserve more edges.
    pub distance_normalization: f32,
}

impl Default for SmoothingParams {
    fn default() -> Self {
        Self { radius: 4, distance_normalization: 4.0 }
    }
}

impl SmoothingParams {
    pub fn validate(&self) -> Result<(), ParameterError> {
        check_range("radius", self.radius as f32, RADIUS)?;
        check_range("distance_normalization", self.distance_normalization, DISTANCE_NORMALIZATION)?;
        Ok(())
    }
}

/// Bilateral filter: a Gaussian blur whose taps are down-weighted by their
/// colour distance to the centre pixel.
#[derive(Debug, Default)]
pub struct BilateralFilter {
    params: SmoothingParams,
}

impl BilateralFilter {
    pub fn new(params: SmoothingParams) -> Result<Self, ParameterError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> SmoothingParams {
        self.params
    }

    pub fn configure(&mut self, params: SmoothingParams) -> Result<(), ParameterError> {
        params.validate()?;
        self.params = params;
        Ok(())
    }
}

impl FilterStage for BilateralFilter {
    fn name(&self) -> &'static str {
        "bilateral"
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![
            Parameter::new("radius", self.params.radius as f32, RADIUS),
            Parameter::new("distance_normalization", self.params.distance_normalization, DISTANCE_NORMALIZATION),
        ]
    }

    fn set_parameter(&mut self, name: &str, value: f32) -> Result<(), ParameterError> {
        match name {
            "radius" => self.params.radius = check_range("radius", value.round(), RADIUS)? as u32,
            "distance_normalization" => {
                self.params.distance_normalization =
                    check_range("distance_normalization", value, DISTANCE_NORMALIZATION)?
            }
            _ => return Err(ParameterError::Unknown { stage: self.name(), name: name.to_string() }),
        }
        Ok(())
    }

    fn apply(&mut self, ctx: &dyn GpuContext, inputs: &[&Texture], output: &mut Texture) -> Result<(), GpuError> {
        let kernel = Kernel::Bilateral {
            radius: self.params.radius,
            distance_normalization: self.params.distance_normalization,
        };
        ctx.dispatch_render_pass(&kernel, inputs, output)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
