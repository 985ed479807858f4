//! Software GPU context.
//!
//! Every kernel runs per texel on the calling thread. Texels are kept as
//! normalized floats but every write is quantised to 8 bits per channel, so
//! results match what an `*8Unorm` render target would hold.

use super::{check_size, GpuContext, GpuError, Kernel, Texture, TextureFormat, TextureId, MAX_TEXTURE_DIMENSION};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Reference context used by tests and the `--backend cpu` mode.
pub struct CpuContext {
    state: Mutex<State>,
    memory_limit: Option<usize>,
}

struct State {
    next_id: u64,
    textures: HashMap<TextureId, Image>,
    bytes_in_use: usize,
}

#[derive(Clone)]
struct Image {
    width: u32,
    height: u32,
    format: TextureFormat,
    texels: Vec<[f32; 4]>,
}

impl Image {
    /// Clamp-to-edge fetch.
    fn at(&self, x: i64, y: i64) -> [f32; 4] {
        let x = x.clamp(0, self.width as i64 - 1) as usize;
        let y = y.clamp(0, self.height as i64 - 1) as usize;
        self.texels[y * self.width as usize + x]
    }

    fn byte_size(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel() as usize
    }
}

impl CpuContext {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State { next_id: 1, textures: HashMap::new(), bytes_in_use: 0 }),
            memory_limit: None,
        }
    }

    /// Context that refuses allocations once `bytes` of texel data are live.
    pub fn with_memory_limit(bytes: usize) -> Self {
        Self { memory_limit: Some(bytes), ..Self::new() }
    }

    /// Number of textures currently allocated.
    pub fn live_textures(&self) -> usize {
        self.lock().textures.len()
    }

    /// Bytes of texel data currently allocated.
    pub fn bytes_in_use(&self) -> usize {
        self.lock().bytes_in_use
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuContext for CpuContext {
    fn backend_name(&self) -> &'static str {
        "cpu"
    }

    fn allocate_texture(&self, width: u32, height: u32, format: TextureFormat) -> Result<Texture, GpuError> {
        check_size(width, height, MAX_TEXTURE_DIMENSION)?;
        let blank = match format.channels() {
            4 => [0.0; 4],
            _ => [0.0, 0.0, 0.0, 1.0],
        };
        let image = Image {
            width,
            height,
            format,
            texels: vec![blank; width as usize * height as usize],
        };

        let mut state = self.lock();
        let requested = image.byte_size();
        if let Some(limit) = self.memory_limit {
            if state.bytes_in_use + requested > limit {
                return Err(GpuError::OutOfMemory {
                    requested,
                    available: limit.saturating_sub(state.bytes_in_use),
                });
            }
        }
        let id = TextureId(state.next_id);
        state.next_id += 1;
        state.bytes_in_use += requested;
        state.textures.insert(id, image);
        Ok(Texture::new(id, width, height, format))
    }

    fn release_texture(&self, texture: Texture) {
        let mut state = self.lock();
        if let Some(image) = state.textures.remove(&texture.id()) {
            state.bytes_in_use -= image.byte_size();
        }
    }

    fn upload_texture(&self, texture: &mut Texture, data: &[u8], bytes_per_row: u32) -> Result<(), GpuError> {
        let mut state = self.lock();
        let image = state
            .textures
            .get_mut(&texture.id())
            .ok_or(GpuError::UnknownTexture(texture.id()))?;

        let channels = image.format.channels();
        let row_bytes = image.width as usize * channels;
        let stride = bytes_per_row as usize;
        let needed = stride * (image.height as usize - 1) + row_bytes;
        if stride < row_bytes || data.len() < needed {
            return Err(GpuError::InvalidPass(format!(
                "upload of {} bytes at stride {} does not cover {}x{} {:?}",
                data.len(),
                stride,
                image.width,
                image.height,
                image.format
            )));
        }

        let width = image.width as usize;
        let format = image.format;
        for (y, row) in data.chunks(stride).take(image.height as usize).enumerate() {
            for (x, px) in row[..row_bytes].chunks_exact(channels).enumerate() {
                image.texels[y * width + x] = decode_texel(format, px);
            }
        }
        texture.mark_written();
        Ok(())
    }

    fn dispatch_render_pass(&self, kernel: &Kernel, inputs: &[&Texture], output: &mut Texture) -> Result<(), GpuError> {
        kernel.check_inputs(inputs, output)?;

        let mut state = self.lock();
        let sources = inputs
            .iter()
            .map(|t| state.textures.get(&t.id()).cloned().ok_or(GpuError::UnknownTexture(t.id())))
            .collect::<Result<Vec<_>, _>>()?;
        let target = state
            .textures
            .get_mut(&output.id())
            .ok_or(GpuError::UnknownTexture(output.id()))?;

        let (width, height) = (target.width, target.height);
        let format = target.format;
        for y in 0..height {
            for x in 0..width {
                let value = run_kernel(kernel, &sources, x, y);
                target.texels[(y * width + x) as usize] = quantize(format, value);
            }
        }
        output.mark_written();
        Ok(())
    }

    fn read_texture(&self, texture: &Texture) -> Result<Vec<u8>, GpuError> {
        let state = self.lock();
        let image = state
            .textures
            .get(&texture.id())
            .ok_or(GpuError::UnknownTexture(texture.id()))?;
        let mut bytes = Vec::with_capacity(image.byte_size());
        for texel in &image.texels {
            let b = texel.map(to_byte);
            match image.format {
                TextureFormat::R8 => bytes.push(b[0]),
                TextureFormat::Rg8 => bytes.extend_from_slice(&b[..2]),
                TextureFormat::Rgba8 => bytes.extend_from_slice(&b),
                TextureFormat::Bgra8 => bytes.extend_from_slice(&[b[2], b[1], b[0], b[3]]),
            }
        }
        Ok(bytes)
    }
}

fn decode_texel(format: TextureFormat, px: &[u8]) -> [f32; 4] {
    let n = |v: u8| v as f32 / 255.0;
    match format {
        TextureFormat::R8 => [n(px[0]), 0.0, 0.0, 1.0],
        TextureFormat::Rg8 => [n(px[0]), n(px[1]), 0.0, 1.0],
        TextureFormat::Rgba8 => [n(px[0]), n(px[1]), n(px[2]), n(px[3])],
        TextureFormat::Bgra8 => [n(px[2]), n(px[1]), n(px[0]), n(px[3])],
    }
}

fn to_byte(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Store `value` the way an 8-bit render target of `format` would.
fn quantize(format: TextureFormat, value: [f32; 4]) -> [f32; 4] {
    let q = |v: f32| if v.is_nan() { 0.0 } else { to_byte(v) as f32 / 255.0 };
    match format {
        TextureFormat::R8 => [q(value[0]), 0.0, 0.0, 1.0],
        TextureFormat::Rg8 => [q(value[0]), q(value[1]), 0.0, 1.0],
        TextureFormat::Rgba8 | TextureFormat::Bgra8 => value.map(q),
    }
}

fn gaussian(distance_sq: f32, sigma: f32) -> f32 {
    (-distance_sq / (2.0 * sigma * sigma)).exp()
}

fn sigma_for(radius: u32) -> f32 {
    (radius as f32 / 2.0).max(0.5)
}

fn luminance(c: [f32; 4]) -> f32 {
    0.2125 * c[0] + 0.7154 * c[1] + 0.0721 * c[2]
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

fn run_kernel(kernel: &Kernel, src: &[Image], x: u32, y: u32) -> [f32; 4] {
    let (xi, yi) = (x as i64, y as i64);
    match kernel {
        Kernel::YuvToRgb { matrix, orientation } => {
            let (luma, chroma) = (&src[0], &src[1]);
            let (sx, sy) = orientation.source_pixel(x, y, luma.width, luma.height);
            let cx = sx as u64 * chroma.width as u64 / luma.width as u64;
            let cy = sy as u64 * chroma.height as u64 / luma.height as u64;
            let l = luma.at(sx as i64, sy as i64)[0];
            let c = chroma.at(cx as i64, cy as i64);
            let [r, g, b] = matrix.apply([l, c[0], c[1]]);
            [r, g, b, 1.0]
        }
        Kernel::Orient { orientation } => {
            let image = &src[0];
            let (sx, sy) = orientation.source_pixel(x, y, image.width, image.height);
            image.at(sx as i64, sy as i64)
        }
        Kernel::Bilateral { radius, distance_normalization } => {
            let image = &src[0];
            let center = image.at(xi, yi);
            let sigma = sigma_for(*radius);
            let r = *radius as i64;
            let mut sum = [0.0f32; 3];
            let mut total = 0.0f32;
            for dy in -r..=r {
                for dx in -r..=r {
                    let s = image.at(xi + dx, yi + dy);
                    let diff = ((s[0] - center[0]).powi(2) + (s[1] - center[1]).powi(2) + (s[2] - center[2]).powi(2)).sqrt();
                    let closeness = (1.0 - diff * distance_normalization).max(0.0);
                    let w = gaussian((dx * dx + dy * dy) as f32, sigma) * closeness;
                    for (acc, v) in sum.iter_mut().zip(&s[..3]) {
                        *acc += w * v;
                    }
                    total += w;
                }
            }
            [sum[0] / total, sum[1] / total, sum[2] / total, center[3]]
        }
        Kernel::LuminanceBlur { radius } => {
            let image = &src[0];
            let sigma = sigma_for(*radius);
            let r = *radius as i64;
            let mut sum = 0.0f32;
            let mut total = 0.0f32;
            for dy in -r..=r {
                for dx in -r..=r {
                    let w = gaussian((dx * dx + dy * dy) as f32, sigma);
                    sum += w * luminance(image.at(xi + dx, yi + dy));
                    total += w;
                }
            }
            [sum / total, 0.0, 0.0, 1.0]
        }
        Kernel::SobelGradient { strength } => {
            let image = &src[0];
            let p = |dx: i64, dy: i64| image.at(xi + dx, yi + dy)[0];
            let h = (p(1, -1) + 2.0 * p(1, 0) + p(1, 1)) - (p(-1, -1) + 2.0 * p(-1, 0) + p(-1, 1));
            let v = (p(-1, 1) + 2.0 * p(0, 1) + p(1, 1)) - (p(-1, -1) + 2.0 * p(0, -1) + p(1, -1));
            let length = (h * h + v * v).sqrt();
            let (qx, qy) = if length > 0.0 {
                (quantize_direction(h / length), quantize_direction(v / length))
            } else {
                (0.0, 0.0)
            };
            [length * strength, (qx + 1.0) * 0.5, (qy + 1.0) * 0.5, 1.0]
        }
        Kernel::NonMaxSuppression { low, high } => {
            let image = &src[0];
            let c = image.at(xi, yi);
            let magnitude = c[0];
            let dx = (c[1] * 2.0 - 1.0).round() as i64;
            let dy = (c[2] * 2.0 - 1.0).round() as i64;
            let forward = image.at(xi + dx, yi + dy)[0];
            let backward = image.at(xi - dx, yi - dy)[0];
            let is_max = magnitude > 0.0 && magnitude >= forward && magnitude >= backward;
            let class = if !is_max {
                0.0
            } else if magnitude >= *high {
                1.0
            } else if magnitude >= *low {
                0.5
            } else {
                0.0
            };
            [class, 0.0, 0.0, 1.0]
        }
        Kernel::Hysteresis { finalize } => {
            let image = &src[0];
            let value = image.at(xi, yi)[0];
            let class = if value >= 0.75 {
                1.0
            } else if value >= 0.25 {
                let touches_strong = (-1..=1)
                    .flat_map(|dy| (-1..=1).map(move |dx| (dx, dy)))
                    .filter(|&(dx, dy)| (dx, dy) != (0, 0))
                    .any(|(dx, dy)| image.at(xi + dx, yi + dy)[0] >= 0.75);
                match (touches_strong, finalize) {
                    (true, _) => 1.0,
                    (false, true) => 0.0,
                    (false, false) => 0.5,
                }
            } else {
                0.0
            };
            [class, 0.0, 0.0, 1.0]
        }
        Kernel::EdgeFalloff { radius } => {
            let image = &src[0];
            let r = *radius as i64;
            let reach = *radius as f32 + 1.0;
            let mut strength = 0.0f32;
            for dy in -r..=r {
                for dx in -r..=r {
                    let falloff = (1.0 - ((dx * dx + dy * dy) as f32).sqrt() / reach).max(0.0);
                    strength = strength.max(image.at(xi + dx, yi + dy)[0] * falloff);
                }
            }
            [strength, 0.0, 0.0, 1.0]
        }
        Kernel::Combination { edge_low, edge_high, intensity } => {
            let original = src[0].at(xi, yi);
            let smoothed = src[1].at(xi, yi);
            let edge = src[2].at(xi, yi)[0];
            let t = if edge_high > edge_low {
                smoothstep(*edge_low, *edge_high, edge)
            } else if edge >= *edge_low {
                1.0
            } else {
                0.0
            };
            let weight = 1.0 - intensity * (1.0 - t);
            let mix = |s: f32, o: f32| s + (o - s) * weight;
            [
                mix(smoothed[0], original[0]),
                mix(smoothed[1], original[1]),
                mix(smoothed[2], original[2]),
                original[3],
            ]
        }
        Kernel::ColorMatrix { matrix, offset } => {
            let c = src[0].at(xi, yi);
            let mut out = *offset;
            for (value, row) in out.iter_mut().zip(matrix) {
                *value += row[0] * c[0] + row[1] * c[1] + row[2] * c[2] + row[3] * c[3];
            }
            out
        }
    }
}

/// Snap a unit direction component to -1, 0 or 1 (45 degree sectors).
fn quantize_direction(d: f32) -> f32 {
    d.signum() * (d.abs() + 0.617316).floor()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Orientation;

    fn upload(ctx: &CpuContext, width: u32, height: u32, format: TextureFormat, data: &[u8]) -> Texture {
        let mut texture = ctx.allocate_texture(width, height, format).unwrap();
        ctx.upload_texture(&mut texture, data, width * format.bytes_per_pixel()).unwrap();
        texture
    }

    #[test]
    fn test_upload_skips_row_padding() {
        let ctx = CpuContext::new();
        let mut texture = ctx.allocate_texture(2, 2, TextureFormat::R8).unwrap();
        ctx.upload_texture(&mut texture, &[1, 2, 99, 99, 3, 4], 4).unwrap();
        assert_eq!(ctx.read_texture(&texture).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(texture.version(), 1);

        let err = ctx.upload_texture(&mut texture, &[1, 2, 3], 2).unwrap_err();
        assert!(matches!(err, GpuError::InvalidPass(_)));
    }

    #[test]
    fn test_bgra_is_sampled_as_rgba() {
        let ctx = CpuContext::new();
        let bgra = upload(&ctx, 1, 1, TextureFormat::Bgra8, &[10, 20, 30, 255]);
        assert_eq!(ctx.read_texture(&bgra).unwrap(), vec![10, 20, 30, 255]);

        let mut rgba = ctx.allocate_texture(1, 1, TextureFormat::Rgba8).unwrap();
        ctx.dispatch_render_pass(&Kernel::Orient { orientation: Orientation::FlipHorizontal }, &[&bgra], &mut rgba)
            .unwrap();
        assert_eq!(ctx.read_texture(&rgba).unwrap(), vec![30, 20, 10, 255]);
    }

    #[test]
    fn test_memory_limit_and_release() {
        let ctx = CpuContext::with_memory_limit(32);
        let a = ctx.allocate_texture(4, 4, TextureFormat::Rg8).unwrap();
        assert_eq!(ctx.bytes_in_use(), 32);
        let err = ctx.allocate_texture(1, 1, TextureFormat::R8).unwrap_err();
        assert_eq!(err, GpuError::OutOfMemory { requested: 1, available: 0 });

        let id = a.id();
        ctx.release_texture(a);
        assert_eq!(ctx.bytes_in_use(), 0);
        let stale = Texture::new(id, 4, 4, TextureFormat::Rg8);
        assert_eq!(ctx.read_texture(&stale).unwrap_err(), GpuError::UnknownTexture(id));
    }

    #[test]
    fn test_rejects_unsupported_sizes() {
        let ctx = CpuContext::new();
        assert!(matches!(
            ctx.allocate_texture(0, 4, TextureFormat::R8),
            Err(GpuError::UnsupportedSize { .. })
        ));
        assert!(matches!(
            ctx.allocate_texture(MAX_TEXTURE_DIMENSION + 1, 1, TextureFormat::R8),
            Err(GpuError::UnsupportedSize { .. })
        ));
    }

    #[test]
    fn test_color_matrix_output_is_clamped_and_quantised() {
        let ctx = CpuContext::new();
        let input = upload(&ctx, 1, 1, TextureFormat::Rgba8, &[100, 200, 50, 255]);
        let mut output = ctx.allocate_texture(1, 1, TextureFormat::Rgba8).unwrap();
        let mut matrix = [[0.0; 4]; 4];
        matrix[0][0] = 2.0;
        matrix[1][1] = 2.0;
        matrix[2][2] = 1.0;
        matrix[3][3] = 1.0;
        let kernel = Kernel::ColorMatrix { matrix, offset: [0.0, 0.0, -0.05, 0.0] };
        ctx.dispatch_render_pass(&kernel, &[&input], &mut output).unwrap();
        // 50 - 12.75 rounds to 37
        assert_eq!(ctx.read_texture(&output).unwrap(), vec![200, 255, 37, 255]);
    }

    #[test]
    fn test_sobel_points_across_a_vertical_edge() {
        let ctx = CpuContext::new();
        let luma: Vec<u8> = (0..16).map(|i| if i % 4 < 2 { 0 } else { 255 }).collect();
        let input = upload(&ctx, 4, 4, TextureFormat::R8, &luma);
        let mut gradient = ctx.allocate_texture(4, 4, TextureFormat::Rgba8).unwrap();
        ctx.dispatch_render_pass(&Kernel::SobelGradient { strength: 1.0 }, &[&input], &mut gradient)
            .unwrap();
        let px = ctx.read_texture(&gradient).unwrap();
        let at = |x: usize, y: usize| &px[(y * 4 + x) * 4..(y * 4 + x) * 4 + 4];
        // Magnitude saturates next to the edge and is zero away from it.
        assert_eq!(at(1, 1)[0], 255);
        assert_eq!(at(0, 1)[0], 0);
        // Direction is +x, no y component.
        assert_eq!(at(1, 1)[1], 255);
        assert_eq!(at(1, 1)[2], 128);
    }

    #[test]
    fn test_hysteresis_promotes_connected_weak_pixels() {
        let ctx = CpuContext::new();
        let classes = [255, 128, 0, 128];
        let input = upload(&ctx, 4, 1, TextureFormat::R8, &classes);
        let mut output = ctx.allocate_texture(4, 1, TextureFormat::R8).unwrap();

        ctx.dispatch_render_pass(&Kernel::Hysteresis { finalize: false }, &[&input], &mut output)
            .unwrap();
        assert_eq!(ctx.read_texture(&output).unwrap(), vec![255, 255, 0, 128]);

        ctx.dispatch_render_pass(&Kernel::Hysteresis { finalize: true }, &[&input], &mut output)
            .unwrap();
        assert_eq!(ctx.read_texture(&output).unwrap(), vec![255, 255, 0, 0]);
    }

    #[test]
    fn test_edge_falloff_ramps_down_with_distance() {
        let ctx = CpuContext::new();
        let input = upload(&ctx, 8, 1, TextureFormat::R8, &[0, 0, 255, 0, 0, 0, 0, 0]);
        let mut output = ctx.allocate_texture(8, 1, TextureFormat::R8).unwrap();
        ctx.dispatch_render_pass(&Kernel::EdgeFalloff { radius: 2 }, &[&input], &mut output)
            .unwrap();
        assert_eq!(ctx.read_texture(&output).unwrap(), vec![85, 170, 255, 170, 85, 0, 0, 0]);
    }

    #[test]
    fn test_dispatch_bumps_output_version_only() {
        let ctx = CpuContext::new();
        let input = upload(&ctx, 2, 2, TextureFormat::Rgba8, &[0; 16]);
        let mut output = ctx.allocate_texture(2, 2, TextureFormat::Rgba8).unwrap();
        let kernel = Kernel::Bilateral { radius: 1, distance_normalization: 4.0 };
        ctx.dispatch_render_pass(&kernel, &[&input], &mut output).unwrap();
        ctx.dispatch_render_pass(&kernel, &[&input], &mut output).unwrap();
        assert_eq!(input.version(), 1);
        assert_eq!(output.version(), 2);
    }
}
