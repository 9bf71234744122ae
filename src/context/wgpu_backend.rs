// wgpu backend
// Device/queue ownership, the shared input texture and the full-viewport quad pipelines

use super::{Backend, ContextConfig, ContextError, GpuVersion, Quad, RawContext};
use crate::renderer::MAX_PARAMS;
use parking_lot::RwLock;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// WGSL shader for the textured quad, with and without an effect stage
const QUAD_SHADER: &str = r#"
struct Uniforms {
    tex_matrix: mat4x4<f32>,
    mvp: mat4x4<f32>,
    effect: vec4<u32>,
    params: array<vec4<f32>, 5>,
}

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) tex_coord: vec2<f32>,
}

@group(0) @binding(0) var frame_texture: texture_2d<f32>;
@group(0) @binding(1) var frame_sampler: sampler;
@group(0) @binding(2) var<uniform> uniforms: Uniforms;

@vertex
fn vs_main(@builtin(vertex_index) vertex_index: u32) -> VertexOutput {
    // Full-viewport quad using 6 vertices
    var positions = array<vec2<f32>, 6>(
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(1.0, -1.0),
        vec2<f32>(1.0, 1.0),
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(1.0, 1.0),
        vec2<f32>(-1.0, 1.0),
    );
    var tex_coords = array<vec2<f32>, 6>(
        vec2<f32>(0.0, 1.0),
        vec2<f32>(1.0, 1.0),
        vec2<f32>(1.0, 0.0),
        vec2<f32>(0.0, 1.0),
        vec2<f32>(1.0, 0.0),
        vec2<f32>(0.0, 0.0),
    );

    var output: VertexOutput;
    output.position = uniforms.mvp * vec4<f32>(positions[vertex_index], 0.0, 1.0);
    output.tex_coord = (uniforms.tex_matrix * vec4<f32>(tex_coords[vertex_index], 0.0, 1.0)).xy;
    return output;
}

@fragment
fn fs_plain(input: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(frame_texture, frame_sampler, input.tex_coord);
}

fn luminance(rgb: vec3<f32>) -> f32 {
    return dot(rgb, vec3<f32>(0.2126, 0.7152, 0.0722));
}

@fragment
fn fs_effect(input: VertexOutput) -> @location(0) vec4<f32> {
    let color = textureSample(frame_texture, frame_sampler, input.tex_coord);
    let kind = uniforms.effect.x;
    let threshold = uniforms.params[3].x;
    var rgb = color.rgb;

    if (kind == 1u) {
        rgb = vec3<f32>(luminance(rgb));
    } else if (kind == 2u) {
        rgb = vec3<f32>(1.0 - luminance(rgb));
    } else if (kind == 3u) {
        rgb = vec3<f32>(step(threshold, luminance(rgb)));
    } else if (kind == 4u) {
        rgb = vec3<f32>(1.0 - step(threshold, luminance(rgb)));
    }

    if (kind != 0u) {
        // 3x4 color matrix, one row per output channel, offset in w
        let r = uniforms.params[0];
        let g = uniforms.params[1];
        let b = uniforms.params[2];
        rgb = vec3<f32>(
            dot(r.xyz, rgb) + r.w,
            dot(g.xyz, rgb) + g.w,
            dot(b.xyz, rgb) + b.w,
        );
    }

    return vec4<f32>(clamp(rgb, vec3<f32>(0.0), vec3<f32>(1.0)), color.a);
}
"#;

/// Input texture format written by producers
const INPUT_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Feature names answered by `has_extension`
const EXTENSIONS: &[(&str, wgpu::Features)] = &[
    ("DEPTH_CLIP_CONTROL", wgpu::Features::DEPTH_CLIP_CONTROL),
    ("DEPTH32FLOAT_STENCIL8", wgpu::Features::DEPTH32FLOAT_STENCIL8),
    ("TIMESTAMP_QUERY", wgpu::Features::TIMESTAMP_QUERY),
    ("TEXTURE_COMPRESSION_BC", wgpu::Features::TEXTURE_COMPRESSION_BC),
    ("TEXTURE_COMPRESSION_ETC2", wgpu::Features::TEXTURE_COMPRESSION_ETC2),
    ("TEXTURE_COMPRESSION_ASTC", wgpu::Features::TEXTURE_COMPRESSION_ASTC),
    ("FLOAT32_FILTERABLE", wgpu::Features::FLOAT32_FILTERABLE),
    ("TEXTURE_FORMAT_16BIT_NORM", wgpu::Features::TEXTURE_FORMAT_16BIT_NORM),
    ("POLYGON_MODE_LINE", wgpu::Features::POLYGON_MODE_LINE),
];

static NEXT_TEXTURE_ID: AtomicU32 = AtomicU32::new(1);

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct QuadUniforms {
    tex_matrix: [f32; 16],
    mvp: [f32; 16],
    effect: [u32; 4],
    params: [f32; MAX_PARAMS],
}

impl QuadUniforms {
    fn new(quad: &Quad<'_>) -> Self {
        let mut uniforms = Self {
            tex_matrix: quad.tex_matrix.to_cols_array(),
            mvp: quad.mvp.to_cols_array(),
            effect: [0; 4],
            params: [0.0; MAX_PARAMS],
        };
        if let Some(effect) = quad.effect {
            uniforms.effect[0] = effect.kind;
            let len = effect.params.len().min(MAX_PARAMS);
            uniforms.params[..len].copy_from_slice(&effect.params[..len]);
        }
        uniforms
    }
}

fn backends_for(version: GpuVersion) -> wgpu::Backends {
    match version {
        GpuVersion::V3 => wgpu::Backends::PRIMARY,
        GpuVersion::V2 => wgpu::Backends::GL,
    }
}

fn limits_for(version: GpuVersion) -> wgpu::Limits {
    match version {
        GpuVersion::V3 => wgpu::Limits::default(),
        GpuVersion::V2 => wgpu::Limits::downlevel_webgl2_defaults(),
    }
}

fn depth_format(config: &ContextConfig) -> Option<wgpu::TextureFormat> {
    if config.stencil_bits() > 0 {
        Some(wgpu::TextureFormat::Depth24PlusStencil8)
    } else if config.depth_buffer() {
        Some(wgpu::TextureFormat::Depth24Plus)
    } else {
        None
    }
}

/// A timed-out acquire only skips this frame; anything else loses the surface.
fn frame_error(e: wgpu::SurfaceError) -> ContextError {
    match e {
        wgpu::SurfaceError::Timeout => ContextError::FrameUnavailable(e.to_string()),
        e => ContextError::SurfaceError(format!("Failed to get surface texture: {}", e)),
    }
}

/// wgpu implementation of [`Backend`].
#[derive(Debug, Clone)]
pub struct WgpuBackend {
    power_preference: wgpu::PowerPreference,
}

impl WgpuBackend {
    pub fn new() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
        }
    }

    pub fn with_power_preference(power_preference: wgpu::PowerPreference) -> Self {
        Self { power_preference }
    }

    fn open_device(&self, version: GpuVersion) -> Result<WgpuShare, ContextError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: backends_for(version),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: self.power_preference,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| ContextError::InitError(format!("Failed to request adapter: {}", e)))?;

        let info = adapter.get_info();
        log::info!("Using GPU adapter: {:?} ({:?})", info.name, info.backend);

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("frame-relay device"),
            required_features: wgpu::Features::empty(),
            required_limits: limits_for(version).using_resolution(adapter.limits()),
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| ContextError::InitError(format!("Failed to create device: {}", e)))?;

        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            log::error!("GPU device lost ({:?}): {}", reason, message);
            lost_flag.store(true, Ordering::SeqCst);
        });

        Ok(WgpuShare {
            instance,
            adapter,
            device,
            queue,
            version,
            lost,
        })
    }
}

impl Default for WgpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Device connection shared between contexts.
///
/// Contexts created against the same share use one device, so textures made
/// by any of them can be sampled by all of them.
#[derive(Clone)]
pub struct WgpuShare {
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    version: GpuVersion,
    lost: Arc<AtomicBool>,
}

impl WgpuShare {
    pub fn instance(&self) -> &wgpu::Instance {
        &self.instance
    }

    pub fn adapter(&self) -> &wgpu::Adapter {
        &self.adapter
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn version(&self) -> GpuVersion {
        self.version
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for WgpuShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuShare")
            .field("adapter", &self.adapter.get_info().name)
            .field("version", &self.version)
            .field("lost", &self.is_lost())
            .finish()
    }
}

/// Platform surface handed to `add_target`.
pub struct NativeSurface {
    target: wgpu::SurfaceTarget<'static>,
    width: u32,
    height: u32,
}

impl NativeSurface {
    pub fn new(target: impl Into<wgpu::SurfaceTarget<'static>>, width: u32, height: u32) -> Self {
        Self {
            target: target.into(),
            width,
            height,
        }
    }

    /// Wraps any window exposing raw window/display handles.
    pub fn from_window<W>(window: Arc<W>, width: u32, height: u32) -> Self
    where
        W: HasWindowHandle + HasDisplayHandle + Send + Sync + 'static,
    {
        Self::new(window, width, height)
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

struct InputTexture {
    id: u32,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    generation: u64,
}

impl InputTexture {
    fn create(device: &wgpu::Device, id: u32, width: u32, height: u32, generation: u64) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Shared Input Texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: INPUT_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            id,
            texture,
            view,
            width,
            height,
            generation,
        }
    }
}

/// Producer-facing handle to the shared input texture.
///
/// The producer writes (or renders) into the texture on its own thread and
/// then calls `notify_frame_available` on the holder. Writes go through the
/// shared queue, so they land before the next draw pass is submitted.
#[derive(Clone)]
pub struct FrameInput {
    device: wgpu::Device,
    queue: wgpu::Queue,
    slot: Arc<RwLock<InputTexture>>,
}

impl FrameInput {
    pub fn id(&self) -> u32 {
        self.slot.read().id
    }

    pub fn size(&self) -> (u32, u32) {
        let input = self.slot.read();
        (input.width, input.height)
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        INPUT_FORMAT
    }

    /// Current backing texture. Re-fetch after the holder is resized.
    pub fn texture(&self) -> wgpu::Texture {
        self.slot.read().texture.clone()
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Uploads a tightly packed RGBA8 frame of exactly the texture's size.
    pub fn write_rgba(&self, data: &[u8]) -> Result<(), ContextError> {
        let input = self.slot.read();
        let expected = input.width as usize * input.height as usize * 4;
        if data.len() != expected {
            return Err(ContextError::TextureError(format!(
                "Frame size mismatch: got {} bytes, expected {} for {}x{}",
                data.len(),
                expected,
                input.width,
                input.height
            )));
        }

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &input.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(input.width * 4),
                rows_per_image: None,
            },
            wgpu::Extent3d {
                width: input.width,
                height: input.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }
}

impl fmt::Debug for FrameInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let input = self.slot.read();
        f.debug_struct("FrameInput")
            .field("id", &input.id)
            .field("width", &input.width)
            .field("height", &input.height)
            .finish()
    }
}

/// A configured window surface bound to the shared device.
pub struct WgpuSurface {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    depth: Option<wgpu::Texture>,
    frame: Option<wgpu::SurfaceTexture>,
}

/// Context for one worker thread.
pub struct WgpuContext {
    share: WgpuShare,
    version: GpuVersion,
    config: ContextConfig,
    offscreen: wgpu::Texture,
    sampler: wgpu::Sampler,
    shader: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    pipelines: HashMap<(wgpu::TextureFormat, bool), wgpu::RenderPipeline>,
    uniforms: wgpu::Buffer,
    input: Option<Arc<RwLock<InputTexture>>>,
    bind_group: Option<(u64, wgpu::BindGroup)>,
}

impl WgpuContext {
    fn new(share: WgpuShare, version: GpuVersion, config: ContextConfig) -> Self {
        let device = &share.device;

        // 1x1 target that stays bound while no real surface is
        let offscreen = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Default Offscreen Surface"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: INPUT_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Frame Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::MipmapFilterMode::Nearest,
            ..Default::default()
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Quad Shader"),
            source: wgpu::ShaderSource::Wgsl(QUAD_SHADER.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Quad Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
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
            label: Some("Quad Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Quad Uniforms"),
            size: std::mem::size_of::<QuadUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            share,
            version,
            config,
            offscreen,
            sampler,
            shader,
            bind_group_layout,
            pipeline_layout,
            pipelines: HashMap::new(),
            uniforms,
            input: None,
            bind_group: None,
        }
    }

    fn choose_format(&self, caps: &wgpu::SurfaceCapabilities) -> wgpu::TextureFormat {
        if self.config.color_bits >= 10 && caps.formats.contains(&wgpu::TextureFormat::Rgb10a2Unorm) {
            return wgpu::TextureFormat::Rgb10a2Unorm;
        }
        // Prefer a non-sRGB format
        caps.formats
            .iter()
            .find(|f| !f.is_srgb())
            .copied()
            .unwrap_or(caps.formats[0])
    }

    fn create_depth_texture(&self, width: u32, height: u32) -> Option<wgpu::Texture> {
        let format = depth_format(&self.config)?;
        Some(self.share.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Target Depth Texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        }))
    }

    fn ensure_pipeline(&mut self, format: wgpu::TextureFormat, effect: bool) {
        if self.pipelines.contains_key(&(format, effect)) {
            return;
        }

        let depth_stencil = depth_format(&self.config).map(|format| wgpu::DepthStencilState {
            format,
            depth_write_enabled: false,
            depth_compare: wgpu::CompareFunction::Always,
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });

        let pipeline = self
            .share
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(if effect { "Effect Quad Pipeline" } else { "Quad Pipeline" }),
                layout: Some(&self.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &self.shader,
                    entry_point: Some("vs_main"),
                    buffers: &[],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &self.shader,
                    entry_point: Some(if effect { "fs_effect" } else { "fs_plain" }),
                    targets: &[Some(wgpu::ColorTargetState {
                        format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    ..Default::default()
                },
                depth_stencil,
                multisample: wgpu::MultisampleState::default(),
                multiview_mask: None,
                cache: None,
            });

        log::debug!("Created quad pipeline for {:?} (effect: {})", format, effect);
        self.pipelines.insert((format, effect), pipeline);
    }

    fn input_bind_group(&mut self) -> Result<wgpu::BindGroup, ContextError> {
        let slot = self
            .input
            .clone()
            .ok_or_else(|| ContextError::DrawError("No input texture".to_string()))?;
        let input = slot.read();

        if let Some((generation, group)) = &self.bind_group {
            if *generation == input.generation {
                return Ok(group.clone());
            }
        }

        let group = self.share.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Quad Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&input.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.uniforms.as_entire_binding(),
                },
            ],
        });
        self.bind_group = Some((input.generation, group.clone()));
        Ok(group)
    }
}

impl Backend for WgpuBackend {
    type Share = WgpuShare;
    type Native = NativeSurface;
    type Input = FrameInput;
    type Context = WgpuContext;

    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn create_context(
        &self,
        version: GpuVersion,
        config: &ContextConfig,
        share: Option<&WgpuShare>,
    ) -> Result<WgpuContext, ContextError> {
        let share = match share {
            Some(parent) => {
                if parent.version < version {
                    return Err(ContextError::InitError(format!(
                        "Parent context is tier {}",
                        parent.version
                    )));
                }
                if parent.is_lost() {
                    return Err(ContextError::Lost("Parent device was lost".to_string()));
                }
                parent.clone()
            }
            None => self.open_device(version)?,
        };

        Ok(WgpuContext::new(share, version, config.clone()))
    }
}

impl RawContext<WgpuBackend> for WgpuContext {
    type Surface = WgpuSurface;

    fn version(&self) -> GpuVersion {
        self.version
    }

    fn has_extension(&self, name: &str) -> bool {
        let features = self.share.device.features();
        EXTENSIONS
            .iter()
            .any(|(ext, feature)| ext.eq_ignore_ascii_case(name) && features.contains(*feature))
    }

    fn share_handle(&self) -> WgpuShare {
        self.share.clone()
    }

    fn make_current(&mut self) -> Result<(), ContextError> {
        if self.share.is_lost() {
            return Err(ContextError::Lost("GPU device was lost".to_string()));
        }
        Ok(())
    }

    fn create_input(&mut self, width: u32, height: u32) -> Result<(u32, FrameInput), ContextError> {
        let id = NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed);
        let input = InputTexture::create(&self.share.device, id, width.max(1), height.max(1), 0);
        let slot = Arc::new(RwLock::new(input));
        self.input = Some(slot.clone());
        self.bind_group = None;

        log::debug!("Created shared input texture {} ({}x{})", id, width, height);
        Ok((
            id,
            FrameInput {
                device: self.share.device.clone(),
                queue: self.share.queue.clone(),
                slot,
            },
        ))
    }

    fn resize_input(&mut self, width: u32, height: u32) -> Result<(), ContextError> {
        let slot = self
            .input
            .as_ref()
            .ok_or_else(|| ContextError::TextureError("No input texture".to_string()))?;
        let mut input = slot.write();
        if input.width == width && input.height == height {
            return Ok(());
        }
        let resized = InputTexture::create(
            &self.share.device,
            input.id,
            width.max(1),
            height.max(1),
            input.generation + 1,
        );
        *input = resized;
        log::debug!("Input texture {} resized to {}x{}", input.id, width, height);
        Ok(())
    }

    fn create_surface(&mut self, native: NativeSurface) -> Result<WgpuSurface, ContextError> {
        let NativeSurface { target, width, height } = native;

        let surface = self
            .share
            .instance
            .create_surface(target)
            .map_err(|e| ContextError::SurfaceError(format!("Failed to create surface: {}", e)))?;

        let capabilities = surface.get_capabilities(&self.share.adapter);
        if capabilities.formats.is_empty() {
            return Err(ContextError::SurfaceError(
                "Surface is not supported by the adapter".to_string(),
            ));
        }
        let format = self.choose_format(&capabilities);

        let mut usage = wgpu::TextureUsages::RENDER_ATTACHMENT;
        if self.config.recordable() && capabilities.usages.contains(wgpu::TextureUsages::COPY_SRC) {
            usage |= wgpu::TextureUsages::COPY_SRC;
        }

        // Pick the best present mode from what's supported
        let present_mode = if capabilities.present_modes.contains(&wgpu::PresentMode::Mailbox) {
            wgpu::PresentMode::Mailbox
        } else if capabilities.present_modes.contains(&wgpu::PresentMode::Immediate) {
            wgpu::PresentMode::Immediate
        } else {
            wgpu::PresentMode::Fifo
        };

        let config = wgpu::SurfaceConfiguration {
            usage,
            format,
            width: width.max(1),
            height: height.max(1),
            present_mode,
            alpha_mode: wgpu::CompositeAlphaMode::Auto,
            view_formats: vec![],
            desired_maximum_frame_latency: 1,
        };
        surface.configure(&self.share.device, &config);

        let depth = self.create_depth_texture(config.width, config.height);
        self.ensure_pipeline(format, false);

        log::debug!(
            "Target surface configured: {}x{} {:?} {:?}",
            config.width,
            config.height,
            format,
            present_mode
        );
        Ok(WgpuSurface {
            surface,
            config,
            depth,
            frame: None,
        })
    }

    fn surface_size(&self, surface: &WgpuSurface) -> (u32, u32) {
        (surface.config.width, surface.config.height)
    }

    fn make_surface_current(&mut self, surface: &mut WgpuSurface) -> Result<(), ContextError> {
        let frame = match surface.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                surface.surface.configure(&self.share.device, &surface.config);
                surface.surface.get_current_texture().map_err(frame_error)?
            }
            Err(e) => return Err(frame_error(e)),
        };
        surface.frame = Some(frame);
        Ok(())
    }

    fn draw_quad(&mut self, surface: &mut WgpuSurface, quad: &Quad<'_>) -> Result<(), ContextError> {
        let effect = quad.effect.is_some();
        let format = surface.config.format;
        let bind_group = self.input_bind_group()?;
        self.ensure_pipeline(format, effect);
        let pipeline = self
            .pipelines
            .get(&(format, effect))
            .ok_or_else(|| ContextError::DrawError("Missing quad pipeline".to_string()))?;

        let frame = surface
            .frame
            .as_ref()
            .ok_or_else(|| ContextError::DrawError("Surface is not current".to_string()))?;
        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let depth_view = surface
            .depth
            .as_ref()
            .map(|depth| depth.create_view(&wgpu::TextureViewDescriptor::default()));

        self.share
            .queue
            .write_buffer(&self.uniforms, 0, bytemuck::bytes_of(&QuadUniforms::new(quad)));

        let mut encoder = self
            .share
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Quad Encoder"),
            });

        {
            let stencil_ops = (self.config.stencil_bits() > 0).then_some(wgpu::Operations {
                load: wgpu::LoadOp::Clear(0),
                store: wgpu::StoreOp::Discard,
            });
            let depth_stencil_attachment =
                depth_view
                    .as_ref()
                    .map(|view| wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: wgpu::LoadOp::Clear(1.0),
                            store: wgpu::StoreOp::Discard,
                        }),
                        stencil_ops,
                    });

            // Always clear before the quad
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Quad Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            render_pass.set_pipeline(pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.draw(0..6, 0..1);
        }

        self.share.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn swap(&mut self, surface: &mut WgpuSurface) -> Result<(), ContextError> {
        let frame = surface
            .frame
            .take()
            .ok_or_else(|| ContextError::SurfaceError("Nothing to present".to_string()))?;
        frame.present();
        Ok(())
    }

    fn release_surface(&mut self, mut surface: WgpuSurface) {
        surface.frame = None;
        if let Some(depth) = surface.depth.take() {
            depth.destroy();
        }
    }

    fn release(&mut self) {
        // Producers may still hold the input texture
        self.input = None;
        self.bind_group = None;
        self.pipelines.clear();
        self.offscreen.destroy();
        log::debug!("wgpu context released (tier {})", self.version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextFlags, QuadEffect};
    use crate::matrix::Mat4;

    #[test]
    fn test_acquire_timeout_keeps_surface() {
        assert!(matches!(
            frame_error(wgpu::SurfaceError::Timeout),
            ContextError::FrameUnavailable(_)
        ));
        assert!(matches!(
            frame_error(wgpu::SurfaceError::OutOfMemory),
            ContextError::SurfaceError(_)
        ));
    }

    #[test]
    fn test_uniform_layout_matches_shader() {
        // mat4 + mat4 + vec4<u32> + array<vec4<f32>, 5>
        assert_eq!(std::mem::size_of::<QuadUniforms>(), 64 + 64 + 16 + 80);
    }

    #[test]
    fn test_uniforms_pack_effect_params() {
        let mvp = Mat4::scale(-1.0, 1.0, 1.0);
        let params = [0.25f32; 13];
        let quad = Quad {
            tex_matrix: &Mat4::IDENTITY,
            mvp: &mvp,
            effect: Some(QuadEffect { kind: 3, params: &params }),
        };
        let uniforms = QuadUniforms::new(&quad);
        assert_eq!(uniforms.mvp, mvp.to_cols_array());
        assert_eq!(uniforms.effect, [3, 0, 0, 0]);
        assert_eq!(uniforms.params[12], 0.25);
        assert_eq!(uniforms.params[13], 0.0);
    }

    #[test]
    fn test_depth_format_follows_flags() {
        assert_eq!(depth_format(&ContextConfig::default()), None);
        assert_eq!(
            depth_format(&ContextConfig::from_flags(ContextFlags::DEPTH_BUFFER)),
            Some(wgpu::TextureFormat::Depth24Plus)
        );
        assert_eq!(
            depth_format(&ContextConfig::from_flags(ContextFlags::STENCIL_8)),
            Some(wgpu::TextureFormat::Depth24PlusStencil8)
        );
    }

    #[test]
    fn test_version_tiers_map_to_backends() {
        assert_eq!(backends_for(GpuVersion::V2), wgpu::Backends::GL);
        assert!(backends_for(GpuVersion::V3).contains(wgpu::Backends::VULKAN));
        let downlevel = limits_for(GpuVersion::V2);
        assert!(downlevel.max_texture_dimension_2d <= limits_for(GpuVersion::V3).max_texture_dimension_2d);
    }
}
