//! WGSL programs for every [`Kernel`].
//!
//! Each module is the shared [`PRELUDE`] followed by one fragment entry
//! point. Inputs are fetched with `textureLoad` at integer pixel coordinates
//! (clamp-to-edge), so no sampler is bound and results do not depend on
//! filtering.

use super::{GpuError, Kernel};
use naga::valid::{Capabilities, ValidationFlags, Validator};

/// Vertex stage, bindings and helpers shared by all fragment programs.
pub const PRELUDE: &str = r#"
struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) tex_coords: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) tex_coords: vec2<f32>,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(in.position, 0.0, 1.0);
    out.tex_coords = in.tex_coords;
    return out;
}

struct Params {
    v: array<vec4<f32>, 8>,
}

@group(0) @binding(0) var t_input0: texture_2d<f32>;
@group(0) @binding(1) var t_input1: texture_2d<f32>;
@group(0) @binding(2) var t_input2: texture_2d<f32>;
@group(0) @binding(3) var<uniform> params: Params;

fn size0() -> vec2<i32> {
    return vec2<i32>(textureDimensions(t_input0));
}

fn size1() -> vec2<i32> {
    return vec2<i32>(textureDimensions(t_input1));
}

fn load0(p: vec2<i32>) -> vec4<f32> {
    return textureLoad(t_input0, clamp(p, vec2<i32>(0), size0() - vec2<i32>(1)), 0);
}

fn load1(p: vec2<i32>) -> vec4<f32> {
    return textureLoad(t_input1, clamp(p, vec2<i32>(0), size1() - vec2<i32>(1)), 0);
}

fn load2(p: vec2<i32>) -> vec4<f32> {
    let size = vec2<i32>(textureDimensions(t_input2));
    return textureLoad(t_input2, clamp(p, vec2<i32>(0), size - vec2<i32>(1)), 0);
}

fn pixel(in: VertexOutput) -> vec2<i32> {
    return vec2<i32>(floor(in.clip_position.xy));
}

// params.v[4] holds the orientation matrix as (m00, m01, m10, m11).
fn source_pixel(d: vec2<i32>, src: vec2<i32>) -> vec2<i32> {
    let m = vec4<i32>(params.v[4]);
    let dst = select(src, src.yx, m.x == 0);
    let u = 2 * d.x + 1 - dst.x;
    let v = 2 * d.y + 1 - dst.y;
    let su = m.x * u + m.z * v;
    let sv = m.y * u + m.w * v;
    return vec2<i32>((su + src.x - 1) / 2, (sv + src.y - 1) / 2);
}

fn gaussian(distance_sq: f32, sigma: f32) -> f32 {
    return exp(-distance_sq / (2.0 * sigma * sigma));
}
"#;

const YUV_TO_RGB: &str = r#"
@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let luma_size = size0();
    let s = source_pixel(pixel(in), luma_size);
    let c = s * size1() / luma_size;
    let yuv = vec3<f32>(load0(s).r, load1(c).rg) - params.v[3].xyz;
    let rgb = vec3<f32>(
        dot(params.v[0].xyz, yuv) + params.v[0].w,
        dot(params.v[1].xyz, yuv) + params.v[1].w,
        dot(params.v[2].xyz, yuv) + params.v[2].w,
    );
    return vec4<f32>(rgb, 1.0);
}
"#;

const ORIENT: &str = r#"
@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return load0(source_pixel(pixel(in), size0()));
}
"#;

const BILATERAL: &str = r#"
@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let p = pixel(in);
    let radius = i32(params.v[0].x);
    let distance_normalization = params.v[0].y;
    let sigma = params.v[0].z;
    let center = load0(p);
    var sum = vec3<f32>(0.0);
    var total = 0.0;
    for (var dy = -radius; dy <= radius; dy = dy + 1) {
        for (var dx = -radius; dx <= radius; dx = dx + 1) {
            let s = load0(p + vec2<i32>(dx, dy));
            let closeness = max(0.0, 1.0 - distance(center.rgb, s.rgb) * distance_normalization);
            let w = gaussian(f32(dx * dx + dy * dy), sigma) * closeness;
            sum = sum + s.rgb * w;
            total = total + w;
        }
    }
    return vec4<f32>(sum / total, center.a);
}
"#;

const LUMINANCE_BLUR: &str = r#"
const W = vec3<f32>(0.2125, 0.7154, 0.0721);

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let p = pixel(in);
    let radius = i32(params.v[0].x);
    let sigma = params.v[0].y;
    var sum = 0.0;
    var total = 0.0;
    for (var dy = -radius; dy <= radius; dy = dy + 1) {
        for (var dx = -radius; dx <= radius; dx = dx + 1) {
            let w = gaussian(f32(dx * dx + dy * dy), sigma);
            sum = sum + dot(load0(p + vec2<i32>(dx, dy)).rgb, W) * w;
            total = total + w;
        }
    }
    return vec4<f32>(sum / total, 0.0, 0.0, 1.0);
}
"#;

const SOBEL_GRADIENT: &str = r#"
@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let p = pixel(in);
    let tl = load0(p + vec2<i32>(-1, -1)).r;
    let t = load0(p + vec2<i32>(0, -1)).r;
    let tr = load0(p + vec2<i32>(1, -1)).r;
    let l = load0(p + vec2<i32>(-1, 0)).r;
    let r = load0(p + vec2<i32>(1, 0)).r;
    let bl = load0(p + vec2<i32>(-1, 1)).r;
    let b = load0(p + vec2<i32>(0, 1)).r;
    let br = load0(p + vec2<i32>(1, 1)).r;
    let h = (tr + 2.0 * r + br) - (tl + 2.0 * l + bl);
    let v = (bl + 2.0 * b + br) - (tl + 2.0 * t + tr);
    let g = vec2<f32>(h, v);
    let len = length(g);
    var dir = vec2<f32>(0.0);
    if (len > 0.0) {
        let n = g / len;
        dir = sign(n) * floor(abs(n) + 0.617316);
    }
    return vec4<f32>(len * params.v[0].x, (dir + 1.0) * 0.5, 1.0);
}
"#;

const NON_MAX_SUPPRESSION: &str = r#"
@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let p = pixel(in);
    let c = load0(p);
    let dir = vec2<i32>(round(c.gb * 2.0 - 1.0));
    let forward = load0(p + dir).r;
    let backward = load0(p - dir).r;
    let m = c.r;
    var edge_class = 0.0;
    if (m > 0.0 && m >= forward && m >= backward) {
        if (m >= params.v[0].y) {
            edge_class = 1.0;
        } else if (m >= params.v[0].x) {
            edge_class = 0.5;
        }
    }
    return vec4<f32>(edge_class, 0.0, 0.0, 1.0);
}
"#;

const HYSTERESIS: &str = r#"
@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let p = pixel(in);
    let value = load0(p).r;
    var edge_class = 0.0;
    if (value >= 0.75) {
        edge_class = 1.0;
    } else if (value >= 0.25) {
        var strong = false;
        for (var dy = -1; dy <= 1; dy = dy + 1) {
            for (var dx = -1; dx <= 1; dx = dx + 1) {
                if ((dx != 0 || dy != 0) && load0(p + vec2<i32>(dx, dy)).r >= 0.75) {
                    strong = true;
                }
            }
        }
        if (strong) {
            edge_class = 1.0;
        } else if (params.v[0].x < 0.5) {
            edge_class = 0.5;
        }
    }
    return vec4<f32>(edge_class, 0.0, 0.0, 1.0);
}
"#;

const EDGE_FALLOFF: &str = r#"
@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let p = pixel(in);
    let radius = i32(params.v[0].x);
    let reach = params.v[0].x + 1.0;
    var strength = 0.0;
    for (var dy = -radius; dy <= radius; dy = dy + 1) {
        for (var dx = -radius; dx <= radius; dx = dx + 1) {
            let falloff = max(0.0, 1.0 - length(vec2<f32>(f32(dx), f32(dy))) / reach);
            strength = max(strength, load0(p + vec2<i32>(dx, dy)).r * falloff);
        }
    }
    return vec4<f32>(strength, 0.0, 0.0, 1.0);
}
"#;

const COMBINATION: &str = r#"
@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let p = pixel(in);
    let original = load0(p);
    let smoothed = load1(p);
    let edge = load2(p).r;
    let low = params.v[0].x;
    let high = params.v[0].y;
    var t = step(low, edge);
    if (high > low) {
        t = smoothstep(low, high, edge);
    }
    let weight = 1.0 - params.v[0].z * (1.0 - t);
    return vec4<f32>(mix(smoothed.rgb, original.rgb, weight), original.a);
}
"#;

const COLOR_MATRIX: &str = r#"
@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let c = load0(pixel(in));
    return vec4<f32>(
        dot(params.v[0], c),
        dot(params.v[1], c),
        dot(params.v[2], c),
        dot(params.v[3], c),
    ) + params.v[4];
}
"#;

/// Full WGSL module for `kernel`.
pub fn module_source(kernel: &Kernel) -> String {
    let body = match kernel {
        Kernel::YuvToRgb { .. } => YUV_TO_RGB,
        Kernel::Orient { .. } => ORIENT,
        Kernel::Bilateral { .. } => BILATERAL,
        Kernel::LuminanceBlur { .. } => LUMINANCE_BLUR,
        Kernel::SobelGradient { .. } => SOBEL_GRADIENT,
        Kernel::NonMaxSuppression { .. } => NON_MAX_SUPPRESSION,
        Kernel::Hysteresis { .. } => HYSTERESIS,
        Kernel::EdgeFalloff { .. } => EDGE_FALLOFF,
        Kernel::Combination { .. } => COMBINATION,
        Kernel::ColorMatrix { .. } => COLOR_MATRIX,
    };
    format!("{}{}", PRELUDE, body)
}

/// [`module_source`] checked with naga, so a broken program surfaces as an
/// error instead of a device panic.
pub fn validated_source(kernel: &Kernel) -> Result<String, GpuError> {
    let source = module_source(kernel);
    let module = naga::front::wgsl::parse_str(&source)
        .map_err(|e| GpuError::InvalidPass(format!("{}: {}", kernel.name(), e.emit_to_string(&source))))?;
    Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|e| GpuError::InvalidPass(format!("{}: {:?}", kernel.name(), e)))?;
    Ok(source)
}

/// Uniform block matching `Params` in [`PRELUDE`].
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct KernelParams {
    pub v: [[f32; 4]; 8],
}

impl KernelParams {
    pub fn pack(kernel: &Kernel) -> Self {
        let mut v = [[0.0f32; 4]; 8];
        match kernel {
            Kernel::YuvToRgb { matrix, orientation } => {
                for row in 0..3 {
                    let c = matrix.coefficients[row];
                    v[row] = [c[0], c[1], c[2], matrix.constant[row]];
                }
                v[3] = [matrix.bias[0], matrix.bias[1], matrix.bias[2], 0.0];
                v[4] = orientation_params(orientation.matrix());
            }
            Kernel::Orient { orientation } => v[4] = orientation_params(orientation.matrix()),
            Kernel::Bilateral { radius, distance_normalization } => {
                v[0] = [*radius as f32, *distance_normalization, sigma_for(*radius), 0.0];
            }
            Kernel::LuminanceBlur { radius } => v[0] = [*radius as f32, sigma_for(*radius), 0.0, 0.0],
            Kernel::SobelGradient { strength } => v[0][0] = *strength,
            Kernel::NonMaxSuppression { low, high } => v[0] = [*low, *high, 0.0, 0.0],
            Kernel::Hysteresis { finalize } => v[0][0] = if *finalize { 1.0 } else { 0.0 },
            Kernel::EdgeFalloff { radius } => v[0][0] = *radius as f32,
            Kernel::Combination { edge_low, edge_high, intensity } => {
                v[0] = [*edge_low, *edge_high, *intensity, 0.0];
            }
            Kernel::ColorMatrix { matrix, offset } => {
                v[..4].copy_from_slice(matrix);
                v[4] = *offset;
            }
        }
        Self { v }
    }
}

fn orientation_params(m: [[i32; 2]; 2]) -> [f32; 4] {
    [m[0][0] as f32, m[0][1] as f32, m[1][0] as f32, m[1][1] as f32]
}

fn sigma_for(radius: u32) -> f32 {
    (radius as f32 / 2.0).max(0.5)
}
