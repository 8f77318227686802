use super::{
    BufferId, BufferUsage, DepthReadError, DrawCall, GpuBackend, GpuError, LineTopology, LineVertex, LinesDraw,
    MeshDraw, ModelVertex, PassKind, PointsDraw, ProgramId, ProgramKind, RenderTarget, TextureId,
};
use crate::config::WindowConfig;
use crate::depth::DepthImage;
use anyhow::{Context, Result};
use glam::Mat4;
use std::collections::HashMap;
use std::sync::{mpsc, Arc};
use wgpu::util::DeviceExt;
use winit::window::Window;

const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
const ENCODED_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const OFFSCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

/// Every draw gets one slot of the uniform ring; large enough for the biggest uniform block.
const UNIFORM_SLOT: u64 = 512;
const UNIFORM_SLOTS: u64 = 8192;
const POINT_NONE: u32 = u32::MAX;

/// Maps GL clip depth (-w..w) onto wgpu's (0..w) so window depth matches GL conventions.
const OPENGL_TO_WGPU: Mat4 = Mat4::from_cols_array(&[
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 0.5, 0.0, //
    0.0, 0.0, 0.5, 1.0,
]);

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct PointUniformData {
    mvp: [[f32; 4]; 4],
    a_range: [f32; 4],
    r_range: [f32; 4],
    z_range: [f32; 4],
    filters: [[f32; 4]; 3],
    layout: [u32; 4],
    params: [f32; 4],
    mode: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct MeshUniformData {
    proj: [[f32; 4]; 4],
    modelview: [[f32; 4]; 4],
    normal: [[f32; 4]; 4],
    col: [f32; 4],
    amb: [f32; 4],
    dif: [f32; 4],
    emi: [f32; 4],
    spc: [f32; 4],
    light_pos: [f32; 4],
    flags: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct LineUniformData {
    mvp: [[f32; 4]; 4],
    flags: [u32; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    kind: ProgramKind,
    topology: Option<LineTopology>,
    target: RenderTarget,
    blend: bool,
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
    /// Present for storage buffers, which point draws bind directly.
    bind_group: Option<wgpu::BindGroup>,
}

struct GpuTexture {
    _texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
}

struct Frame {
    target: RenderTarget,
    surface: Option<wgpu::SurfaceTexture>,
    view: wgpu::TextureView,
    encoder: wgpu::CommandEncoder,
    clear: Option<wgpu::Color>,
}

enum Prepared {
    Points { key: PipelineKey, offset: u32, buffer: BufferId, instances: u32 },
    Mesh { key: PipelineKey, offset: u32, buffer: BufferId, first: u32, count: u32, texture: Option<TextureId> },
    Lines { key: PipelineKey, offset: u32, buffer: BufferId, first: u32, count: u32 },
}

struct Layouts {
    uniform: wgpu::BindGroupLayout,
    storage: wgpu::BindGroupLayout,
    texture: wgpu::BindGroupLayout,
}

struct Shaders {
    points: wgpu::ShaderModule,
    model: wgpu::ShaderModule,
    lines: wgpu::ShaderModule,
}

/// wgpu implementation of [`GpuBackend`], rendering either to a window surface or offscreen.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface: Option<wgpu::Surface<'static>>,
    config: wgpu::SurfaceConfiguration,
    window: Option<Arc<Window>>,
    limits: wgpu::Limits,
    layouts: Layouts,
    shaders: Shaders,
    uniform_buffer: wgpu::Buffer,
    uniform_bind_group: wgpu::BindGroup,
    uniform_cursor: u64,
    sampler: wgpu::Sampler,
    white: GpuTexture,
    depth: (wgpu::Texture, wgpu::TextureView),
    encoded: Option<wgpu::Texture>,
    offscreen: Option<wgpu::Texture>,
    next_id: u32,
    buffers: HashMap<BufferId, GpuBuffer>,
    textures: HashMap<TextureId, GpuTexture>,
    programs: HashMap<ProgramId, ProgramKind>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    frame: Option<Frame>,
}

impl WgpuBackend {
    pub fn for_window(window: Arc<Window>, cfg: &WindowConfig) -> Result<Self> {
        pollster::block_on(Self::init(Some(window), cfg))
    }

    /// Renders into an offscreen target instead of a surface.
    pub fn headless(width: u32, height: u32) -> Result<Self> {
        let cfg = WindowConfig { width, height, ..WindowConfig::default() };
        pollster::block_on(Self::init(None, &cfg))
    }

    async fn init(window: Option<Arc<Window>>, cfg: &WindowConfig) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let surface = match &window {
            Some(window) => {
                Some(instance.create_surface(window.clone()).context("Failed to create WGPU surface")?)
            }
            None => None,
        };
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: surface.as_ref(),
                force_fallback_adapter: false,
            })
            .await
            .context("Failed to request WGPU adapter")?;
        let mut required_limits = adapter.limits();
        required_limits.max_storage_buffers_per_shader_stage =
            required_limits.max_storage_buffers_per_shader_stage.max(1);
        let device_desc = wgpu::DeviceDescriptor {
            label: Some("Device"),
            required_features: wgpu::Features::empty(),
            required_limits: required_limits.clone(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::default(),
        };
        let (device, queue) =
            adapter.request_device(&device_desc).await.context("Failed to request WGPU device")?;

        let (width, height) = match &window {
            Some(window) => {
                let size = window.inner_size();
                (size.width.max(1), size.height.max(1))
            }
            None => (cfg.width.max(1), cfg.height.max(1)),
        };
        let config = match &surface {
            Some(surface) => {
                let caps = surface.get_capabilities(&adapter);
                let format = caps.formats.iter().copied().find(|f| f.is_srgb()).unwrap_or(caps.formats[0]);
                let present_mode = if cfg.vsync {
                    wgpu::PresentMode::Fifo
                } else {
                    caps.present_modes
                        .iter()
                        .copied()
                        .find(|mode| *mode != wgpu::PresentMode::Fifo)
                        .unwrap_or(wgpu::PresentMode::Fifo)
                };
                let config = wgpu::SurfaceConfiguration {
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    format,
                    width,
                    height,
                    present_mode,
                    alpha_mode: caps.alpha_modes[0],
                    view_formats: vec![],
                    desired_maximum_frame_latency: 2,
                };
                surface.configure(&device, &config);
                config
            }
            None => wgpu::SurfaceConfiguration {
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                format: OFFSCREEN_FORMAT,
                width,
                height,
                present_mode: wgpu::PresentMode::Fifo,
                alpha_mode: wgpu::CompositeAlphaMode::Opaque,
                view_formats: vec![],
                desired_maximum_frame_latency: 2,
            },
        };

        let layouts = create_layouts(&device);
        let shaders = Shaders {
            points: device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Point Shader"),
                source: wgpu::ShaderSource::Wgsl(include_str!("../../assets/shaders/points.wgsl").into()),
            }),
            model: device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Model Shader"),
                source: wgpu::ShaderSource::Wgsl(include_str!("../../assets/shaders/model.wgsl").into()),
            }),
            lines: device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Line Shader"),
                source: wgpu::ShaderSource::Wgsl(include_str!("../../assets/shaders/lines.wgsl").into()),
            }),
        };
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Uniform Ring"),
            size: UNIFORM_SLOT * UNIFORM_SLOTS,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let uniform_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Uniform Ring Bind Group"),
            layout: &layouts.uniform,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &uniform_buffer,
                    offset: 0,
                    size: wgpu::BufferSize::new(UNIFORM_SLOT),
                }),
            }],
        });
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Model Sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        let white_image = image::RgbaImage::from_pixel(1, 1, image::Rgba([255, 255, 255, 255]));
        let white = upload_texture(&device, &queue, &layouts.texture, &sampler, "White Texture", &white_image);
        let depth = create_depth_texture(&device, width, height);

        log::info!(
            "wgpu backend ready: {width}x{height}, {:?}, max buffer {} bytes",
            config.format,
            required_limits.max_buffer_size
        );
        Ok(Self {
            device,
            queue,
            surface,
            config,
            window,
            limits: required_limits,
            layouts,
            shaders,
            uniform_buffer,
            uniform_bind_group,
            uniform_cursor: 0,
            sampler,
            white,
            depth,
            encoded: None,
            offscreen: None,
            next_id: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            programs: HashMap::new(),
            pipelines: HashMap::new(),
            frame: None,
        })
    }

    pub fn window(&self) -> Option<&Window> {
        self.window.as_deref()
    }

    fn next(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn target_format(&self, target: RenderTarget) -> wgpu::TextureFormat {
        match target {
            RenderTarget::Screen => self.config.format,
            RenderTarget::EncodedDepth => ENCODED_FORMAT,
        }
    }

    fn color_view(
        &mut self,
        target: RenderTarget,
    ) -> Result<(wgpu::TextureView, Option<wgpu::SurfaceTexture>), GpuError> {
        let (width, height) = (self.config.width, self.config.height);
        match target {
            RenderTarget::EncodedDepth => {
                let texture = self.encoded.get_or_insert_with(|| {
                    create_color_texture(&self.device, "Encoded Depth Target", ENCODED_FORMAT, width, height)
                });
                Ok((texture.create_view(&wgpu::TextureViewDescriptor::default()), None))
            }
            RenderTarget::Screen => match &self.surface {
                Some(surface) => {
                    let frame = match surface.get_current_texture() {
                        Ok(frame) => frame,
                        Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                            surface.configure(&self.device, &self.config);
                            return Err(GpuError::Surface("surface lost or outdated; reconfigured".into()));
                        }
                        Err(err) => return Err(GpuError::Surface(err.to_string())),
                    };
                    let view = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());
                    Ok((view, Some(frame)))
                }
                None => {
                    let texture = self.offscreen.get_or_insert_with(|| {
                        create_color_texture(&self.device, "Offscreen Target", OFFSCREEN_FORMAT, width, height)
                    });
                    Ok((texture.create_view(&wgpu::TextureViewDescriptor::default()), None))
                }
            },
        }
    }

    fn push_uniform<T: bytemuck::Pod>(&mut self, data: &T) -> Option<u32> {
        if self.uniform_cursor >= UNIFORM_SLOTS {
            log::warn!("uniform ring exhausted; dropping draw");
            return None;
        }
        let offset = self.uniform_cursor * UNIFORM_SLOT;
        self.queue.write_buffer(&self.uniform_buffer, offset, bytemuck::bytes_of(data));
        self.uniform_cursor += 1;
        Some(offset as u32)
    }

    fn ensure_pipeline(&mut self, key: PipelineKey) {
        if self.pipelines.contains_key(&key) {
            return;
        }
        let pipeline = self.build_pipeline(key);
        self.pipelines.insert(key, pipeline);
    }

    fn build_pipeline(&self, key: PipelineKey) -> wgpu::RenderPipeline {
        let format = self.target_format(key.target);
        let blend = (key.blend && key.target == RenderTarget::Screen).then_some(wgpu::BlendState::ALPHA_BLENDING);
        let targets = [Some(wgpu::ColorTargetState { format, blend, write_mask: wgpu::ColorWrites::ALL })];
        let depth_stencil = Some(wgpu::DepthStencilState {
            format: DEPTH_FORMAT,
            depth_write_enabled: true,
            depth_compare: wgpu::CompareFunction::LessEqual,
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });

        let mesh_attributes = [
            wgpu::VertexAttribute { shader_location: 0, format: wgpu::VertexFormat::Float32x2, offset: 0 },
            wgpu::VertexAttribute { shader_location: 1, format: wgpu::VertexFormat::Float32x3, offset: 8 },
            wgpu::VertexAttribute { shader_location: 2, format: wgpu::VertexFormat::Float32x3, offset: 20 },
        ];
        let line_attributes = [
            wgpu::VertexAttribute { shader_location: 0, format: wgpu::VertexFormat::Float32x3, offset: 0 },
            wgpu::VertexAttribute { shader_location: 1, format: wgpu::VertexFormat::Float32x3, offset: 12 },
        ];
        let mesh_buffers = [wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<ModelVertex>() as u64,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &mesh_attributes,
        }];
        let line_buffers = [wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<LineVertex>() as u64,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &line_attributes,
        }];

        let (label, module, fs_entry, bind_group_layouts, buffers, primitive): (
            &str,
            &wgpu::ShaderModule,
            &str,
            Vec<&wgpu::BindGroupLayout>,
            &[wgpu::VertexBufferLayout],
            wgpu::PrimitiveState,
        ) = match key.kind {
            ProgramKind::Points { anti_alias } => (
                "Point Pipeline",
                &self.shaders.points,
                if anti_alias { "fs_round" } else { "fs_square" },
                vec![&self.layouts.uniform, &self.layouts.storage],
                &[],
                wgpu::PrimitiveState::default(),
            ),
            ProgramKind::Mesh => (
                "Model Pipeline",
                &self.shaders.model,
                "fs_main",
                vec![&self.layouts.uniform, &self.layouts.texture],
                &mesh_buffers,
                wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: Some(wgpu::Face::Back),
                    ..Default::default()
                },
            ),
            ProgramKind::Lines => (
                "Line Pipeline",
                &self.shaders.lines,
                "fs_main",
                vec![&self.layouts.uniform],
                &line_buffers,
                wgpu::PrimitiveState {
                    topology: match key.topology {
                        Some(LineTopology::Strip) => wgpu::PrimitiveTopology::LineStrip,
                        _ => wgpu::PrimitiveTopology::LineList,
                    },
                    ..Default::default()
                },
            ),
        };
        let layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &bind_group_layouts,
            push_constant_ranges: &[],
        });
        self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(label),
            layout: Some(&layout),
            vertex: wgpu::VertexState {
                module,
                entry_point: Some("vs_main"),
                buffers,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module,
                entry_point: Some(fs_entry),
                targets: &targets,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive,
            depth_stencil,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        })
    }

    fn prepare_points(&mut self, draw: &PointsDraw, target: RenderTarget, blend: bool) -> Option<Prepared> {
        let decimate = draw.decimate.max(1);
        let instances = draw.count.div_ceil(decimate);
        if instances == 0 || !self.buffers.contains_key(&draw.buffer) {
            return None;
        }
        let u = &draw.uniforms;
        let window = |w: crate::draw_context::Window1| [w.min, w.max, if w.enabled() { 1.0 } else { 0.0 }, 0.0];
        let data = PointUniformData {
            mvp: (OPENGL_TO_WGPU * u.mvp).to_cols_array_2d(),
            a_range: u.a_range.extend(0.0).to_array(),
            r_range: u.r_range.extend(0.0).to_array(),
            z_range: u.z_range.extend(0.0).to_array(),
            filters: [window(u.amp_filter), window(u.range_filter), window(u.height_filter)],
            layout: [
                draw.layout.stride,
                draw.layout.rgb.unwrap_or(POINT_NONE),
                draw.layout.amp.unwrap_or(POINT_NONE),
                draw.layout.rng.unwrap_or(POINT_NONE),
            ],
            params: [u.point_size, self.config.width as f32, self.config.height as f32, 0.0],
            mode: [u.color_mode, decimate, 0, 0],
        };
        let offset = self.push_uniform(&data)?;
        let key = PipelineKey { kind: self.programs.get(&draw.program).copied()?, topology: None, target, blend };
        self.ensure_pipeline(key);
        Some(Prepared::Points { key, offset, buffer: draw.buffer, instances })
    }

    fn prepare_mesh(&mut self, draw: &MeshDraw, target: RenderTarget, blend: bool) -> Option<Prepared> {
        if draw.count == 0 || !self.buffers.contains_key(&draw.buffer) {
            return None;
        }
        let m = &draw.material;
        let texture = draw.texture.filter(|id| self.textures.contains_key(id));
        let data = MeshUniformData {
            proj: (OPENGL_TO_WGPU * draw.proj).to_cols_array_2d(),
            modelview: draw.modelview.to_cols_array_2d(),
            normal: draw.modelview.inverse().transpose().to_cols_array_2d(),
            col: m.col.to_array(),
            amb: m.amb.to_array(),
            dif: m.dif.to_array(),
            emi: m.emi.to_array(),
            spc: m.spc.to_array(),
            light_pos: draw.light_pos.extend(1.0).to_array(),
            flags: [draw.shading as u32, texture.is_some() as u32, draw.encode_depth as u32, 0],
        };
        let offset = self.push_uniform(&data)?;
        let key = PipelineKey { kind: ProgramKind::Mesh, topology: None, target, blend };
        self.ensure_pipeline(key);
        Some(Prepared::Mesh { key, offset, buffer: draw.buffer, first: draw.first, count: draw.count, texture })
    }

    fn prepare_lines(&mut self, draw: &LinesDraw, target: RenderTarget, blend: bool) -> Option<Prepared> {
        if draw.count == 0 || !self.buffers.contains_key(&draw.buffer) {
            return None;
        }
        let data = LineUniformData {
            mvp: (OPENGL_TO_WGPU * draw.mvp).to_cols_array_2d(),
            flags: [draw.encode_depth as u32, 0, 0, 0],
        };
        let offset = self.push_uniform(&data)?;
        let key = PipelineKey { kind: ProgramKind::Lines, topology: Some(draw.topology), target, blend };
        self.ensure_pipeline(key);
        Some(Prepared::Lines { key, offset, buffer: draw.buffer, first: draw.first, count: draw.count })
    }

    /// Submits the work recorded so far and starts a fresh encoder for the rest of the frame.
    fn flush(&mut self, frame: &mut Frame) {
        let encoder = std::mem::replace(
            &mut frame.encoder,
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Frame Encoder") }),
        );
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn read_texture(
        &mut self,
        texture: &wgpu::Texture,
        aspect: wgpu::TextureAspect,
    ) -> Result<(Vec<u8>, u32, u32), DepthReadError> {
        let mut frame = self.frame.take().ok_or(DepthReadError::NoFrame)?;
        let (width, height) = (self.config.width, self.config.height);
        let unpadded = width * 4;
        let padded = unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Depth Readback"),
            size: u64::from(padded) * u64::from(height),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        frame.encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo { texture, mip_level: 0, origin: wgpu::Origin3d::ZERO, aspect },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
        );
        self.flush(&mut frame);
        self.frame = Some(frame);

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = self.device.poll(wgpu::PollType::wait_indefinitely());
        match receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(DepthReadError::Unavailable(err.to_string())),
            Err(err) => return Err(DepthReadError::Unavailable(err.to_string())),
        }
        let mut bytes = Vec::with_capacity((unpadded * height) as usize);
        {
            let data = slice.get_mapped_range();
            for row in data.chunks_exact(padded as usize) {
                bytes.extend_from_slice(&row[..unpadded as usize]);
            }
        }
        staging.unmap();
        Ok((bytes, width, height))
    }
}

impl GpuBackend for WgpuBackend {
    fn max_buffer_size(&self) -> u64 {
        self.limits.max_buffer_size.min(u64::from(self.limits.max_storage_buffer_binding_size))
    }

    fn create_buffer(&mut self, label: &str, usage: BufferUsage, data: &[u8]) -> Result<BufferId, GpuError> {
        let usages = match usage {
            BufferUsage::Vertex => wgpu::BufferUsages::VERTEX,
            BufferUsage::Storage => wgpu::BufferUsages::STORAGE,
        } | wgpu::BufferUsages::COPY_DST;
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: data,
            usage: usages,
        });
        let bind_group = (usage == BufferUsage::Storage && !data.is_empty()).then(|| {
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &self.layouts.storage,
                entries: &[wgpu::BindGroupEntry { binding: 0, resource: buffer.as_entire_binding() }],
            })
        });
        let id = BufferId(self.next());
        self.buffers.insert(id, GpuBuffer { buffer, size: data.len() as u64, bind_group });
        Ok(id)
    }

    fn write_buffer(&mut self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), GpuError> {
        let target = self.buffers.get(&id).ok_or(GpuError::UnknownBuffer(id))?;
        if offset + data.len() as u64 > target.size {
            return Err(GpuError::WriteOutOfBounds { id, offset, len: data.len(), size: target.size });
        }
        self.queue.write_buffer(&target.buffer, offset, data);
        Ok(())
    }

    fn destroy_buffer(&mut self, id: BufferId) {
        if let Some(buffer) = self.buffers.remove(&id) {
            buffer.buffer.destroy();
        }
    }

    fn create_texture(&mut self, label: &str, image: &image::RgbaImage) -> Result<TextureId, GpuError> {
        let texture = upload_texture(&self.device, &self.queue, &self.layouts.texture, &self.sampler, label, image);
        let id = TextureId(self.next());
        self.textures.insert(id, texture);
        Ok(id)
    }

    fn destroy_texture(&mut self, id: TextureId) {
        self.textures.remove(&id);
    }

    fn create_program(&mut self, kind: ProgramKind) -> Result<ProgramId, GpuError> {
        let id = ProgramId(self.next());
        self.programs.insert(id, kind);
        Ok(id)
    }

    fn destroy_program(&mut self, id: ProgramId) {
        if let Some(kind) = self.programs.remove(&id) {
            if !self.programs.values().any(|k| *k == kind) {
                self.pipelines.retain(|key, _| key.kind != kind);
            }
        }
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.config.width = width;
        self.config.height = height;
        if let Some(surface) = &self.surface {
            surface.configure(&self.device, &self.config);
        }
        self.depth = create_depth_texture(&self.device, width, height);
        self.encoded = None;
        self.offscreen = None;
    }

    fn size(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    fn begin_frame(&mut self, target: RenderTarget, clear: [f32; 4]) -> Result<(), GpuError> {
        if let Some(stale) = self.frame.take() {
            self.queue.submit(std::iter::once(stale.encoder.finish()));
        }
        let (view, surface) = self.color_view(target)?;
        let encoder =
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Frame Encoder") });
        self.uniform_cursor = 0;
        let [r, g, b, a] = clear.map(f64::from);
        self.frame = Some(Frame { target, surface, view, encoder, clear: Some(wgpu::Color { r, g, b, a }) });
        Ok(())
    }

    fn draw_pass(&mut self, pass: PassKind, calls: &[DrawCall]) -> Result<(), GpuError> {
        let target = self.frame.as_ref().ok_or(GpuError::NoFrame)?.target;
        let blend = matches!(pass, PassKind::Alpha { blend: true });
        let prepared: Vec<Prepared> = calls
            .iter()
            .filter_map(|call| match call {
                DrawCall::Points(draw) => self.prepare_points(draw, target, blend),
                DrawCall::Mesh(draw) => self.prepare_mesh(draw, target, blend),
                DrawCall::Lines(draw) => self.prepare_lines(draw, target, blend),
            })
            .collect();

        let mut frame = self.frame.take().ok_or(GpuError::NoFrame)?;
        let (color_load, depth_load) = match frame.clear.take() {
            Some(color) => (wgpu::LoadOp::Clear(color), wgpu::LoadOp::Clear(1.0)),
            None => (wgpu::LoadOp::Load, wgpu::LoadOp::Load),
        };
        {
            let mut rpass = frame.encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Scene Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &frame.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations { load: color_load, store: wgpu::StoreOp::Store },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.depth.1,
                    depth_ops: Some(wgpu::Operations { load: depth_load, store: wgpu::StoreOp::Store }),
                    stencil_ops: None,
                }),
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            for draw in &prepared {
                match draw {
                    Prepared::Points { key, offset, buffer, instances } => {
                        let (Some(pipeline), Some(bind_group)) =
                            (self.pipelines.get(key), self.buffers.get(buffer).and_then(|b| b.bind_group.as_ref()))
                        else {
                            continue;
                        };
                        rpass.set_pipeline(pipeline);
                        rpass.set_bind_group(0, &self.uniform_bind_group, &[*offset]);
                        rpass.set_bind_group(1, bind_group, &[]);
                        rpass.draw(0..6, 0..*instances);
                    }
                    Prepared::Mesh { key, offset, buffer, first, count, texture } => {
                        let (Some(pipeline), Some(vertices)) = (self.pipelines.get(key), self.buffers.get(buffer))
                        else {
                            continue;
                        };
                        let texture = texture.and_then(|id| self.textures.get(&id)).unwrap_or(&self.white);
                        rpass.set_pipeline(pipeline);
                        rpass.set_bind_group(0, &self.uniform_bind_group, &[*offset]);
                        rpass.set_bind_group(1, &texture.bind_group, &[]);
                        rpass.set_vertex_buffer(0, vertices.buffer.slice(..));
                        rpass.draw(*first..first + count, 0..1);
                    }
                    Prepared::Lines { key, offset, buffer, first, count } => {
                        let (Some(pipeline), Some(vertices)) = (self.pipelines.get(key), self.buffers.get(buffer))
                        else {
                            continue;
                        };
                        rpass.set_pipeline(pipeline);
                        rpass.set_bind_group(0, &self.uniform_bind_group, &[*offset]);
                        rpass.set_vertex_buffer(0, vertices.buffer.slice(..));
                        rpass.draw(*first..first + count, 0..1);
                    }
                }
            }
        }
        self.frame = Some(frame);
        Ok(())
    }

    fn read_depth(&mut self) -> Result<DepthImage<f32>, DepthReadError> {
        let texture = self.depth.0.clone();
        let (bytes, width, height) = self.read_texture(&texture, wgpu::TextureAspect::DepthOnly)?;
        let data = bytes.chunks_exact(4).map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])).collect();
        Ok(DepthImage { width, height, data })
    }

    fn read_encoded_depth(&mut self) -> Result<DepthImage<u32>, DepthReadError> {
        if self.frame.as_ref().map(|f| f.target) != Some(RenderTarget::EncodedDepth) {
            return Err(DepthReadError::Unavailable("frame has no encoded depth target".into()));
        }
        let texture = self
            .encoded
            .clone()
            .ok_or_else(|| DepthReadError::Unavailable("encoded target missing".into()))?;
        let (bytes, width, height) = self.read_texture(&texture, wgpu::TextureAspect::All)?;
        let data = bytes.chunks_exact(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])).collect();
        Ok(DepthImage { width, height, data })
    }

    fn end_frame(&mut self) -> Result<(), GpuError> {
        let frame = self.frame.take().ok_or(GpuError::NoFrame)?;
        self.queue.submit(std::iter::once(frame.encoder.finish()));
        if let Some(surface) = frame.surface {
            if let Some(window) = &self.window {
                window.pre_present_notify();
            }
            surface.present();
        }
        Ok(())
    }
}

fn create_layouts(device: &wgpu::Device) -> Layouts {
    let uniform = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Draw Uniform Layout"),
        entries: &[wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: true,
                min_binding_size: wgpu::BufferSize::new(UNIFORM_SLOT),
            },
            count: None,
        }],
    });
    let storage = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Point Chunk Layout"),
        entries: &[wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }],
    });
    let texture = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Model Texture Layout"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    multisampled: false,
                    view_dimension: wgpu::TextureViewDimension::D2,
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
        ],
    });
    Layouts { uniform, storage, texture }
}

fn upload_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    layout: &wgpu::BindGroupLayout,
    sampler: &wgpu::Sampler,
    label: &str,
    image: &image::RgbaImage,
) -> GpuTexture {
    let (w, h) = image.dimensions();
    let size = wgpu::Extent3d { width: w.max(1), height: h.max(1), depth_or_array_layers: 1 };
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8UnormSrgb,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    if w > 0 && h > 0 {
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            image.as_raw(),
            wgpu::TexelCopyBufferLayout { offset: 0, bytes_per_row: Some(4 * w), rows_per_image: Some(h) },
            size,
        );
    }
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(label),
        layout,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(&view) },
            wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::Sampler(sampler) },
        ],
    });
    GpuTexture { _texture: texture, bind_group }
}

fn create_color_texture(
    device: &wgpu::Device,
    label: &str,
    format: wgpu::TextureFormat,
    width: u32,
    height: u32,
) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d { width: width.max(1), height: height.max(1), depth_or_array_layers: 1 },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

fn create_depth_texture(device: &wgpu::Device, width: u32, height: u32) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Depth Texture"),
        size: wgpu::Extent3d { width: width.max(1), height: height.max(1), depth_or_array_layers: 1 },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}
