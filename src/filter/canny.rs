//! Canny edge detection as a chain of render passes.
//!
//! luminance + Gaussian blur → Sobel gradient → directional non-maximum
//! suppression with two thresholds → hysteresis → falloff. The hysteresis
//! passes ping-pong between two scratch textures. The falloff pass turns the
//! binary edge map into a strength that ramps down around every edge.

use super::{check_range, FilterStage, Parameter, ParameterError};
use crate::gpu::{ensure_texture, GpuContext, GpuError, Kernel, Texture, TextureFormat};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::ops::RangeInclusive;

const BLUR_RADIUS: RangeInclusive<f32> = 0.0..=8.0;
const THRESHOLD: RangeInclusive<f32> = 0.0..=1.0;
const STRENGTH: RangeInclusive<f32> = 0.1..=10.0;
const PASSES: RangeInclusive<f32> = 1.0..=8.0;
const FEATHER: RangeInclusive<f32> = 1.0..=4.0;

/// Settings of the edge branch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EdgeParams {
    /// Gaussian pre-blur radius; 0 disables the blur
    pub blur_radius: u32,
    /// Gradient magnitude classifying a pixel as a weak edge
    pub low_threshold: f32,
    /// Gradient magnitude classifying a pixel as a strong edge
    pub high_threshold: f32,
    /// Gradient magnitude multiplier
    pub strength: f32,
    /// Weak-edge promotion passes, the last one clears unpromoted pixels
    pub hysteresis_passes: u32,
    /// Distance over which edge strength fades to zero
    pub feather_radius: u32,
}

impl Default for EdgeParams {
    fn default() -> Self {
        Self {
            blur_radius: 2,
            low_threshold: 0.1,
            high_threshold: 0.4,
            strength: 1.0,
            hysteresis_passes: 2,
            feather_radius: 2,
        }
    }
}

impl EdgeParams {
    pub fn validate(&self) -> Result<(), ParameterError> {
        check_range("blur_radius", self.blur_radius as f32, BLUR_RADIUS)?;
        check_range("low_threshold", self.low_threshold, THRESHOLD)?;
        check_range("high_threshold", self.high_threshold, THRESHOLD)?;
        check_range("strength", self.strength, STRENGTH)?;
        check_range("hysteresis_passes", self.hysteresis_passes as f32, PASSES)?;
        check_range("feather_radius", self.feather_radius as f32, FEATHER)?;
        if self.low_threshold > self.high_threshold {
            return Err(ParameterError::Inverted { low: "low_threshold", high: "high_threshold" });
        }
        Ok(())
    }
}

/// Single-channel edge strength: 1 on edges, fading to 0 within
/// `feather_radius`.
#[derive(Debug, Default)]
pub struct CannyEdgeDetection {
    params: EdgeParams,
    blurred: Option<Texture>,
    gradient: Option<Texture>,
    classes: Option<Texture>,
    ping: Option<Texture>,
    pong: Option<Texture>,
    binary: Option<Texture>,
}

impl CannyEdgeDetection {
    pub fn new(params: EdgeParams) -> Result<Self, ParameterError> {
        params.validate()?;
        Ok(Self { params, ..Default::default() })
    }

    pub fn params(&self) -> EdgeParams {
        self.params
    }

    pub fn configure(&mut self, params: EdgeParams) -> Result<(), ParameterError> {
        params.validate()?;
        self.params = params;
        Ok(())
    }
}

impl FilterStage for CannyEdgeDetection {
    fn name(&self) -> &'static str {
        "canny_edge_detection"
    }

    fn output_format(&self) -> TextureFormat {
        TextureFormat::R8
    }

    fn parameters(&self) -> Vec<Parameter> {
        let p = &self.params;
        vec![
            Parameter::new("blur_radius", p.blur_radius as f32, BLUR_RADIUS),
            Parameter::new("low_threshold", p.low_threshold, THRESHOLD),
            Parameter::new("high_threshold", p.high_threshold, THRESHOLD),
            Parameter::new("strength", p.strength, STRENGTH),
            Parameter::new("hysteresis_passes", p.hysteresis_passes as f32, PASSES),
            Parameter::new("feather_radius", p.feather_radius as f32, FEATHER),
        ]
    }

    fn set_parameter(&mut self, name: &str, value: f32) -> Result<(), ParameterError> {
        let mut p = self.params;
        match name {
            "blur_radius" => p.blur_radius = check_range("blur_radius", value.round(), BLUR_RADIUS)? as u32,
            "low_threshold" => p.low_threshold = check_range("low_threshold", value, THRESHOLD)?,
            "high_threshold" => p.high_threshold = check_range("high_threshold", value, THRESHOLD)?,
            "strength" => p.strength = check_range("strength", value, STRENGTH)?,
            "hysteresis_passes" => {
                p.hysteresis_passes = check_range("hysteresis_passes", value.round(), PASSES)? as u32
            }
            "feather_radius" => p.feather_radius = check_range("feather_radius", value.round(), FEATHER)? as u32,
            _ => return Err(ParameterError::Unknown { stage: "canny_edge_detection", name: name.to_string() }),
        }
        self.configure(p)
    }

    fn apply(&mut self, ctx: &dyn GpuContext, inputs: &[&Texture], output: &mut Texture) -> Result<(), GpuError> {
        let p = self.params;
        let source: &Texture = inputs
            .first()
            .copied()
            .ok_or_else(|| GpuError::InvalidPass("edge detection needs an input".into()))?;
        let (width, height) = source.size();

        let blurred = ensure_texture(ctx, &mut self.blurred, width, height, TextureFormat::R8)?;
        ctx.dispatch_render_pass(&Kernel::LuminanceBlur { radius: p.blur_radius }, &[source], blurred)?;

        let gradient = ensure_texture(ctx, &mut self.gradient, width, height, TextureFormat::Rgba8)?;
        ctx.dispatch_render_pass(&Kernel::SobelGradient { strength: p.strength }, &[&*blurred], gradient)?;

        let classes = ensure_texture(ctx, &mut self.classes, width, height, TextureFormat::R8)?;
        let suppress = Kernel::NonMaxSuppression { low: p.low_threshold, high: p.high_threshold };
        ctx.dispatch_render_pass(&suppress, &[&*gradient], classes)?;

        let promote = Kernel::Hysteresis { finalize: false };
        let finish = Kernel::Hysteresis { finalize: true };
        let passes = p.hysteresis_passes.max(1);
        let binary = ensure_texture(ctx, &mut self.binary, width, height, TextureFormat::R8)?;
        if passes == 1 {
            ctx.dispatch_render_pass(&finish, &[&*classes], binary)?;
        } else {
            let mut front = ensure_texture(ctx, &mut self.ping, width, height, TextureFormat::R8)?;
            ctx.dispatch_render_pass(&promote, &[&*classes], front)?;
            if passes > 2 {
                let mut back = ensure_texture(ctx, &mut self.pong, width, height, TextureFormat::R8)?;
                for _ in 2..passes {
                    ctx.dispatch_render_pass(&promote, &[&*front], back)?;
                    std::mem::swap(&mut front, &mut back);
                }
            }
            ctx.dispatch_render_pass(&finish, &[&*front], binary)?;
        }

        ctx.dispatch_render_pass(&Kernel::EdgeFalloff { radius: p.feather_radius }, &[&*binary], output)
    }

    fn release(&mut self, ctx: &dyn GpuContext) {
        let scratch = [
            &mut self.blurred,
            &mut self.gradient,
            &mut self.classes,
            &mut self.ping,
            &mut self.pong,
            &mut self.binary,
        ];
        for texture in scratch.into_iter().filter_map(Option::take) {
            ctx.release_texture(texture);
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
