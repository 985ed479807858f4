//! wgpu implementation of [`GpuContext`].
//!
//! Every kernel is a full-screen quad drawn into the output texture with one
//! of the fragment programs in [`super::shaders`]. Pipelines are built on
//! first use per (kernel, target format).

use super::shaders::{validated_source, KernelParams};
use super::{check_size, GpuContext, GpuError, Kernel, Texture, TextureFormat, TextureId};
use crate::frame::QuadVertex;
use anyhow::{anyhow, Result};
use std::borrow::Cow;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use wgpu::util::DeviceExt;

const COPY_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

/// GPU context backed by a wgpu device.
pub struct WgpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    uniform_buffer: wgpu::Buffer,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    /// Bound to input slots a kernel does not use
    placeholder: wgpu::TextureView,
    pipelines: Mutex<HashMap<(&'static str, TextureFormat), wgpu::RenderPipeline>>,
    textures: Mutex<HashMap<TextureId, wgpu::Texture>>,
    next_id: AtomicU64,
}

impl WgpuContext {
    /// Open the default high-performance adapter without a surface.
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| anyhow!("Failed to find GPU adapter: {:?}", e))?;
        let adapter_name = adapter.get_info().name;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Veneer Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))?;
        info!("Using GPU adapter: {}", adapter_name);

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Kernel Bind Group Layout"),
            entries: &[
                texture_entry(0),
                texture_entry(1),
                texture_entry(2),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Kernel Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Vertex Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Index Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });

        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Kernel Params"),
            contents: bytemuck::cast_slice(&[KernelParams::default()]),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let placeholder = device
            .create_texture(&wgpu::TextureDescriptor {
                label: Some("Unused Input"),
                size: wgpu::Extent3d { width: 1, height: 1, depth_or_array_layers: 1 },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            })
            .create_view(&wgpu::TextureViewDescriptor::default());

        Ok(Self {
            device,
            queue,
            adapter_name,
            vertex_buffer,
            index_buffer,
            uniform_buffer,
            bind_group_layout,
            pipeline_layout,
            placeholder,
            pipelines: Mutex::new(HashMap::new()),
            textures: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn textures(&self) -> MutexGuard<'_, HashMap<TextureId, wgpu::Texture>> {
        self.textures.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, texture: &Texture) -> Result<wgpu::Texture, GpuError> {
        self.textures()
            .get(&texture.id())
            .cloned()
            .ok_or(GpuError::UnknownTexture(texture.id()))
    }

    fn create_pipeline(&self, kernel: &Kernel, format: TextureFormat) -> Result<wgpu::RenderPipeline, GpuError> {
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(kernel.name()),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(validated_source(kernel)?)),
        });

        Ok(self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(kernel.name()),
            layout: Some(&self.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: Some("vs_main"),
                buffers: &[QuadVertex::layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: format.to_wgpu(),
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        }))
    }
}

fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn extent(texture: &Texture) -> wgpu::Extent3d {
    wgpu::Extent3d { width: texture.width(), height: texture.height(), depth_or_array_layers: 1 }
}

impl GpuContext for WgpuContext {
    fn backend_name(&self) -> &'static str {
        "wgpu"
    }

    fn allocate_texture(&self, width: u32, height: u32, format: TextureFormat) -> Result<Texture, GpuError> {
        check_size(width, height, self.device.limits().max_texture_dimension_2d)?;
        let id = TextureId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Pipeline Texture"),
            size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: format.to_wgpu(),
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        self.textures().insert(id, texture);
        debug!("Allocated {:?} {}x{} {:?}", id, width, height, format);
        Ok(Texture::new(id, width, height, format))
    }

    fn release_texture(&self, texture: Texture) {
        if let Some(gpu_texture) = self.textures().remove(&texture.id()) {
            gpu_texture.destroy();
        }
    }

    fn upload_texture(&self, texture: &mut Texture, data: &[u8], bytes_per_row: u32) -> Result<(), GpuError> {
        let gpu_texture = self.lookup(texture)?;
        let row_bytes = texture.width() * texture.format().bytes_per_pixel();
        let needed = bytes_per_row as usize * (texture.height() as usize - 1) + row_bytes as usize;
        if bytes_per_row < row_bytes || data.len() < needed {
            return Err(GpuError::InvalidPass(format!(
                "upload of {} bytes at stride {} does not cover {}x{} {:?}",
                data.len(),
                bytes_per_row,
                texture.width(),
                texture.height(),
                texture.format()
            )));
        }

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &gpu_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &data[..needed],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(texture.height()),
            },
            extent(texture),
        );
        texture.mark_written();
        Ok(())
    }

    fn dispatch_render_pass(&self, kernel: &Kernel, inputs: &[&Texture], output: &mut Texture) -> Result<(), GpuError> {
        kernel.check_inputs(inputs, output)?;
        let input_textures = inputs.iter().map(|t| self.lookup(t)).collect::<Result<Vec<_>, _>>()?;
        let target = self.lookup(output)?;

        // Held for the whole pass: the uniform buffer is shared.
        let mut pipelines = self.pipelines.lock().unwrap_or_else(|e| e.into_inner());
        let pipeline = match pipelines.entry((kernel.name(), output.format())) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.create_pipeline(kernel, output.format())?),
        };

        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::cast_slice(&[KernelParams::pack(kernel)]));

        let views: Vec<wgpu::TextureView> = input_textures
            .iter()
            .map(|t| t.create_view(&wgpu::TextureViewDescriptor::default()))
            .collect();
        let view_at = |i: usize| views.get(i).unwrap_or(&self.placeholder);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.name()),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(view_at(0)) },
                wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::TextureView(view_at(1)) },
                wgpu::BindGroupEntry { binding: 2, resource: wgpu::BindingResource::TextureView(view_at(2)) },
                wgpu::BindGroupEntry { binding: 3, resource: self.uniform_buffer.as_entire_binding() },
            ],
        });

        let output_view = target.create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(kernel.name()) });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(kernel.name()),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &output_view,
                    resolve_target: None,
                    ops: wgpu::Operations { load: wgpu::LoadOp::Clear(wgpu::Color::BLACK), store: wgpu::StoreOp::Store },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            render_pass.set_pipeline(pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            render_pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
            render_pass.draw_indexed(0..QuadVertex::INDICES.len() as u32, 0, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        output.mark_written();
        Ok(())
    }

    fn read_texture(&self, texture: &Texture) -> Result<Vec<u8>, GpuError> {
        let gpu_texture = self.lookup(texture)?;
        let row_bytes = texture.width() * texture.format().bytes_per_pixel();
        let padded_row = row_bytes.div_ceil(COPY_ALIGNMENT) * COPY_ALIGNMENT;

        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: padded_row as wgpu::BufferAddress * texture.height() as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Readback Encoder") });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &gpu_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(texture.height()),
                },
            },
            extent(texture),
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = readback.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait { submission_index: None, timeout: None })
            .map_err(|e| GpuError::Device(format!("poll failed: {:?}", e)))?;
        receiver
            .recv()
            .map_err(|e| GpuError::Device(e.to_string()))?
            .map_err(|e| GpuError::Device(format!("readback failed: {:?}", e)))?;

        let data = buffer_slice.get_mapped_range();
        let mut pixels = Vec::with_capacity(texture.byte_size());
        for row in data.chunks(padded_row as usize) {
            pixels.extend_from_slice(&row[..row_bytes as usize]);
        }
        drop(data);
        readback.unmap();
        Ok(pixels)
    }
}
