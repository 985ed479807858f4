//! Edge-aware recombination of the original and smoothed images.

use super::{check_range, FilterStage, Parameter, ParameterError};
use crate::gpu::{GpuContext, GpuError, Kernel, Texture};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::ops::RangeInclusive;

const UNIT: RangeInclusive<f32> = 0.0..=1.0;

/// Blend curve of the recombination stage.
///
/// The weight of the original pixel is `1 - intensity * (1 - t)` where `t`
/// rises smoothly from 0 at `edge_low` to 1 at `edge_high`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BlendParams {
    pub edge_low: f32,
    pub edge_high: f32,
    /// How much of the smoothed image replaces flat regions
    pub intensity: f32,
}

impl Default for BlendParams {
    fn default() -> Self {
        Self { edge_low: 0.2, edge_high: 0.8, intensity: 0.9 }
    }
}

impl BlendParams {
    pub fn validate(&self) -> Result<(), ParameterError> {
        check_range("edge_low", self.edge_low, UNIT)?;
        check_range("edge_high", self.edge_high, UNIT)?;
        check_range("intensity", self.intensity, UNIT)?;
        Ok(())
    }
}

/// Inputs: original, smoothed, edge map.
#[derive(Debug, Default)]
pub struct CombinationFilter {
    params: BlendParams,
}

impl CombinationFilter {
    pub fn new(params: BlendParams) -> Result<Self, ParameterError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> BlendParams {
        self.params
    }

    pub fn configure(&mut self, params: BlendParams) -> Result<(), ParameterError> {
        params.validate()?;
        self.params = params;
        Ok(())
    }
}

impl FilterStage for CombinationFilter {
    fn name(&self) -> &'static str {
        "combination"
    }

    fn input_count(&self) -> usize {
        3
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![
            Parameter::new("edge_low", self.params.edge_low, UNIT),
            Parameter::new("edge_high", self.params.edge_high, UNIT),
            Parameter::new("intensity", self.params.intensity, UNIT),
        ]
    }

    fn set_parameter(&mut self, name: &str, value: f32) -> Result<(), ParameterError> {
        match name {
            "edge_low" => self.params.edge_low = check_range("edge_low", value, UNIT)?,
            "edge_high" => self.params.edge_high = check_range("edge_high", value, UNIT)?,
            "intensity" => self.params.intensity = check_range("intensity", value, UNIT)?,
            _ => return Err(ParameterError::Unknown { stage: self.name(), name: name.to_string() }),
        }
        Ok(())
    }

    fn apply(&mut self, ctx: &dyn GpuContext, inputs: &[&Texture], output: &mut Texture) -> Result<(), GpuError> {
        let kernel = Kernel::Combination {
            edge_low: self.params.edge_low,
            edge_high: self.params.edge_high,
            intensity: self.params.intensity,
        };
        ctx.dispatch_render_pass(&kernel, inputs, output)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
