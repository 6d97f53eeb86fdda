// SPDX-License-Identifier: MPL-2.0

//! The WebGPU-backed implementation of [`Backend`].
//!
//! Command buffers are replayed onto a `wgpu` command encoder at submission time. Depth and cull
//! state are baked into `wgpu` pipelines, so [`Command::SetDepthState`] and
//! [`Command::SetCullMode`] are no-ops here; every pipeline is created with the state the device
//! later asks for.
//!
//! Bindings are split into two groups: group 0 holds the uniform block, bound with a dynamic
//! offset, and group 1 holds whatever the pipeline layout samples from. Group 1 is rebuilt lazily
//! before draws whose textures, samplers, or texel buffer changed.

use std::{collections::HashMap, sync::Arc};

// `wgpu` names collide with ours all over the place, so ours are imported explicitly (which takes
// precedence over the glob) and referred to through their modules where both are needed.
use ::wgpu::*;

use super::{
    Backend, BackendKind, BufferId, BufferUsage, Capabilities, DepthStateId, PipelineId,
    Registry, SamplerId, ShaderId, TextureId,
};
use crate::{
    cmd::{self, ColorTarget, Command, CommandBuffer},
    config::GpuConfig,
    fence::CompletionSignal,
    pipeline::{self, AttributeType, PipelineConfig},
    release::Release,
    sampler::{self, SamplerConfig},
    shader::ShaderStage,
    texture::{self, ClearValue, TextureConfig, TextureType},
    Error, MAX_TEXTURE_SAMPLERS, MAX_UNIFORM_BUFFER_SIZE,
};

/// Pipeline layouts in the order their `wgpu` counterparts are stored.
const LAYOUTS: [pipeline::PipelineLayout; 3] = [
    pipeline::PipelineLayout::SingleTextureAndUbo,
    pipeline::PipelineLayout::MultiTextureAndUbo,
    pipeline::PipelineLayout::SingleTextureBufferAndUbo,
];

fn layout_index(layout: pipeline::PipelineLayout) -> usize {
    match layout {
        pipeline::PipelineLayout::SingleTextureAndUbo => 0,
        pipeline::PipelineLayout::MultiTextureAndUbo => 1,
        pipeline::PipelineLayout::SingleTextureBufferAndUbo => 2,
    }
}

struct TextureEntry {
    texture: Texture,
    view: TextureView,
    config: TextureConfig,
}

struct ShaderEntry {
    module: ShaderModule,
    entry_point: String,
}

struct PipelineEntry {
    pipeline: RenderPipeline,
    layout: pipeline::PipelineLayout,
    /// Set if the blend equation reads the constant color, which `wgpu` treats as pass state.
    blend_constant: Option<Color>,
}

struct Frame {
    texture: SurfaceTexture,
    view: TextureView,
}

struct Presenter {
    surface: Surface<'static>,
    config: SurfaceConfiguration,
    format: texture::TextureFormat,
    frame: Option<Frame>,
}

/// Stand-ins for unbound slots, as `wgpu` has no notion of a null binding.
struct Fillers {
    _texture: Texture,
    view: TextureView,
    sampler: Sampler,
    buffer: Buffer,
}

pub struct WgpuBackend {
    kind: BackendKind,
    caps: Capabilities,
    device: Device,
    queue: Queue,
    presenter: Option<Presenter>,
    buffers: Registry<Buffer>,
    textures: Registry<TextureEntry>,
    samplers: Registry<Sampler>,
    shaders: Registry<ShaderEntry>,
    pipelines: Registry<PipelineEntry>,
    depth_states: Registry<pipeline::DepthState>,
    uniform_layout: BindGroupLayout,
    resource_layouts: [BindGroupLayout; 3],
    pipeline_layouts: [PipelineLayout; 3],
    /// Group 0 for each buffer that has been bound as a uniform buffer.
    uniform_groups: HashMap<u32, BindGroup>,
    fillers: Fillers,
}

impl WgpuBackend {
    /// Creates a backend with nothing to present to.
    pub fn headless(kind: BackendKind, config: &GpuConfig) -> Result<Self, Error> {
        Self::create(kind, config, (0, 0), |_| Ok(None))
    }

    /// Creates a backend that presents to `window`, whose client area is `size` pixels.
    pub fn with_window<W: WindowHandle + 'static>(
        kind: BackendKind,
        config: &GpuConfig,
        window: Arc<W>,
        size: (u32, u32),
    ) -> Result<Self, Error> {
        Self::create(kind, config, size, |instance| {
            instance
                .create_surface(window)
                .map(Some)
                .map_err(|e| Error::Backend(e.to_string()))
        })
    }

    fn create(
        kind: BackendKind,
        config: &GpuConfig,
        size: (u32, u32),
        create_surface: impl FnOnce(&Instance) -> Result<Option<Surface<'static>>, Error>,
    ) -> Result<Self, Error> {
        let instance = Instance::new(InstanceDescriptor {
            backends: Self::backends(kind)?,
            flags: if config.debug_device {
                InstanceFlags::debugging()
            } else {
                InstanceFlags::default()
            },
            ..Default::default()
        });
        let surface = create_surface(&instance)?;
        let adapter = Self::request_adapter(&instance, surface.as_ref())?;
        let (device, queue) = Self::request_device(&adapter)?;

        // Validation errors outside of an error scope are reported here instead of panicking.
        device.on_uncaptured_error(Box::new(|e: ::wgpu::Error| {
            tracing::error!("Uncaptured wgpu error: {}", e);
        }));

        let presenter = match surface {
            Some(surface) => Some(Self::configure_surface(
                &adapter, &device, surface, size, config.vsync,
            )?),
            None => None,
        };

        let limits = device.limits();
        let caps = Capabilities {
            max_texture_size: limits.max_texture_dimension_2d,
            max_multisamples: 4,
            uniform_buffer_alignment: limits.min_uniform_buffer_offset_alignment,
            texture_upload_pitch_alignment: COPY_BYTES_PER_ROW_ALIGNMENT,
            texture_upload_alignment: 16,
            supports_border_color: device
                .features()
                .contains(Features::ADDRESS_MODE_CLAMP_TO_BORDER),
        };

        let uniform_layout = Self::create_uniform_bind_group_layout(&device);
        let resource_layouts =
            LAYOUTS.map(|layout| Self::create_resource_bind_group_layout(&device, layout));
        let pipeline_layouts = [0, 1, 2].map(|i| {
            device.create_pipeline_layout(&PipelineLayoutDescriptor {
                label: None,
                bind_group_layouts: &[&uniform_layout, &resource_layouts[i]],
                push_constant_ranges: &[],
            })
        });
        let fillers = Self::create_fillers(&device);

        Ok(Self {
            kind,
            caps,
            device,
            queue,
            presenter,
            buffers: Registry::new("buffer"),
            textures: Registry::new("texture"),
            samplers: Registry::new("sampler"),
            shaders: Registry::new("shader"),
            pipelines: Registry::new("pipeline"),
            depth_states: Registry::new("depth state"),
            uniform_layout,
            resource_layouts,
            pipeline_layouts,
            uniform_groups: HashMap::new(),
            fillers,
        })
    }

    fn backends(kind: BackendKind) -> Result<Backends, Error> {
        match kind {
            BackendKind::Vulkan => Ok(Backends::VULKAN),
            BackendKind::Metal => Ok(Backends::METAL),
            BackendKind::Direct3D12 => Ok(Backends::DX12),
            BackendKind::OpenGl => Ok(Backends::GL),
            BackendKind::Null => Err(Error::Unsupported("the null backend is not a wgpu backend")),
        }
    }

    fn request_adapter(instance: &Instance, surface: Option<&Surface>) -> Result<Adapter, Error> {
        let adapter = pollster::block_on(instance.request_adapter(&RequestAdapterOptions {
            power_preference: PowerPreference::HighPerformance,
            compatible_surface: surface,
            force_fallback_adapter: false,
        }))
        .ok_or(Error::NoCompatibleAdapterFound)?;

        let info = adapter.get_info();
        tracing::info!("Using adapter '{}' ({:?})", info.name, info.backend);

        Ok(adapter)
    }

    fn request_device(adapter: &Adapter) -> Result<(Device, Queue), Error> {
        pollster::block_on(adapter.request_device(
            &DeviceDescriptor {
                label: Some("Umbra device"),
                required_features: adapter.features() & Features::ADDRESS_MODE_CLAMP_TO_BORDER,
                required_limits: adapter.limits(),
            },
            None,
        ))
        .map_err(|e| Error::NoCompatibleDeviceFound(e.to_string()))
    }

    fn configure_surface(
        adapter: &Adapter,
        device: &Device,
        surface: Surface<'static>,
        (width, height): (u32, u32),
        vsync: bool,
    ) -> Result<Presenter, Error> {
        let caps = surface.get_capabilities(adapter);
        // Colors are written as-is, so only linear formats will do.
        let (native, format) = caps
            .formats
            .iter()
            .find_map(|&native| from_native_format(native).map(|format| (native, format)))
            .ok_or(Error::NoCompatibleSurfaceFormat)?;

        let config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format: native,
            width: width.max(1),
            height: height.max(1),
            present_mode: if vsync {
                PresentMode::AutoVsync
            } else {
                PresentMode::AutoNoVsync
            },
            desired_maximum_frame_latency: 2,
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(CompositeAlphaMode::Auto),
            view_formats: Vec::new(),
        };
        surface.configure(device, &config);
        tracing::debug!("Configured {}x{} {:?} surface", config.width, config.height, native);

        Ok(Presenter {
            surface,
            config,
            format,
            frame: None,
        })
    }

    fn create_uniform_bind_group_layout(device: &Device) -> BindGroupLayout {
        device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("Uniform bind group layout"),
            entries: &[BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStages::VERTEX_FRAGMENT,
                ty: BindingType::Buffer {
                    ty: BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: BufferSize::new(u64::from(MAX_UNIFORM_BUFFER_SIZE)),
                },
                count: None,
            }],
        })
    }

    fn create_resource_bind_group_layout(
        device: &Device,
        layout: pipeline::PipelineLayout,
    ) -> BindGroupLayout {
        let entries: Vec<_> = if layout == pipeline::PipelineLayout::SingleTextureBufferAndUbo {
            vec![BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStages::FRAGMENT,
                ty: BindingType::Buffer {
                    ty: BufferBindingType::Storage { read_only: true },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }]
        } else {
            (0..layout.texture_slots() as u32)
                .flat_map(|slot| {
                    [
                        BindGroupLayoutEntry {
                            binding: 2 * slot,
                            visibility: ShaderStages::FRAGMENT,
                            ty: BindingType::Texture {
                                sample_type: TextureSampleType::Float { filterable: true },
                                view_dimension: TextureViewDimension::D2,
                                multisampled: false,
                            },
                            count: None,
                        },
                        BindGroupLayoutEntry {
                            binding: 2 * slot + 1,
                            visibility: ShaderStages::FRAGMENT,
                            ty: BindingType::Sampler(SamplerBindingType::Filtering),
                            count: None,
                        },
                    ]
                })
                .collect()
        };

        device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("Resource bind group layout"),
            entries: &entries,
        })
    }

    fn create_fillers(device: &Device) -> Fillers {
        let texture = device.create_texture(&TextureDescriptor {
            label: Some("Filler texture"),
            size: Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&TextureViewDescriptor::default());

        Fillers {
            _texture: texture,
            view,
            sampler: device.create_sampler(&SamplerDescriptor::default()),
            buffer: device.create_buffer(&BufferDescriptor {
                label: Some("Filler buffer"),
                size: 4,
                usage: BufferUsages::STORAGE,
                mapped_at_creation: false,
            }),
        }
    }

    fn buffer(&self, id: BufferId) -> Result<&Buffer, Error> {
        self.buffers
            .get(id.0)
            .ok_or_else(|| Error::Backend(format!("unknown buffer {}", id.0)))
    }

    fn texture(&self, id: TextureId) -> Result<&TextureEntry, Error> {
        self.textures
            .get(id.0)
            .ok_or_else(|| Error::Backend(format!("unknown texture {}", id.0)))
    }

    fn shader(&self, id: ShaderId) -> Result<&ShaderEntry, Error> {
        self.shaders
            .get(id.0)
            .ok_or_else(|| Error::Backend(format!("unknown shader {}", id.0)))
    }

    fn pipeline(&self, id: PipelineId) -> Result<&PipelineEntry, Error> {
        self.pipelines
            .get(id.0)
            .ok_or_else(|| Error::Backend(format!("unknown pipeline {}", id.0)))
    }

    /// Creates the group-1 bind groups `cmdbuf` will need, in the order its draws need them.
    ///
    /// `wgpu` render passes borrow their bind groups, so these must exist before replay starts.
    fn prepare_bind_groups(&mut self, cmdbuf: &CommandBuffer) -> Vec<BindGroup> {
        let mut tracker = BindingTracker::default();
        let mut groups = Vec::new();

        for cmd in cmdbuf.iter() {
            if let Command::SetUniformBuffer { buffer, .. } = *cmd {
                self.prepare_uniform_group(buffer);
            }
            if let Some(layout) = tracker.track(cmd, |id| self.pipeline_layout_of(id)) {
                groups.push(self.create_resource_group(layout, &tracker));
            }
        }

        groups
    }

    fn pipeline_layout_of(&self, id: PipelineId) -> Option<pipeline::PipelineLayout> {
        self.pipelines.get(id.0).map(|entry| entry.layout)
    }

    fn prepare_uniform_group(&mut self, id: BufferId) {
        if self.uniform_groups.contains_key(&id.0) {
            return;
        }
        let Some(buffer) = self.buffers.get(id.0) else {
            return;
        };

        let group = self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("Uniform bind group"),
            layout: &self.uniform_layout,
            entries: &[BindGroupEntry {
                binding: 0,
                resource: BindingResource::Buffer(BufferBinding {
                    buffer,
                    offset: 0,
                    size: BufferSize::new(u64::from(MAX_UNIFORM_BUFFER_SIZE)),
                }),
            }],
        });
        self.uniform_groups.insert(id.0, group);
    }

    fn create_resource_group(
        &self,
        layout: pipeline::PipelineLayout,
        bindings: &BindingTracker,
    ) -> BindGroup {
        let mut entries = Vec::with_capacity(2 * layout.texture_slots());

        if layout == pipeline::PipelineLayout::SingleTextureBufferAndUbo {
            let buffer = bindings
                .texture_buffer
                .and_then(|id| self.buffers.get(id.0))
                .unwrap_or(&self.fillers.buffer);
            entries.push(BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            });
        } else {
            for slot in 0..layout.texture_slots() {
                let view = bindings.textures[slot]
                    .and_then(|id| self.textures.get(id.0))
                    .map_or(&self.fillers.view, |entry| &entry.view);
                let sampler = bindings.samplers[slot]
                    .and_then(|id| self.samplers.get(id.0))
                    .unwrap_or(&self.fillers.sampler);

                entries.push(BindGroupEntry {
                    binding: 2 * slot as u32,
                    resource: BindingResource::TextureView(view),
                });
                entries.push(BindGroupEntry {
                    binding: 2 * slot as u32 + 1,
                    resource: BindingResource::Sampler(sampler),
                });
            }
        }

        self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("Resource bind group"),
            layout: &self.resource_layouts[layout_index(layout)],
            entries: &entries,
        })
    }

    fn color_view(&self, target: ColorTarget) -> Result<(&TextureView, (u32, u32)), Error> {
        match target {
            ColorTarget::Surface => self
                .presenter
                .as_ref()
                .and_then(|p| {
                    let size = (p.config.width, p.config.height);
                    p.frame.as_ref().map(|f| (&f.view, size))
                })
                .ok_or(Error::NoRenderTarget),
            ColorTarget::Texture(id) => {
                let entry = self.texture(id)?;
                Ok((&entry.view, (entry.config.width, entry.config.height)))
            }
        }
    }

    /// Records `cmdbuf` into a new `wgpu` command buffer. Also returns whether it presents.
    fn replay(
        &self,
        cmdbuf: &CommandBuffer,
        groups: &[BindGroup],
    ) -> Result<(::wgpu::CommandBuffer, bool), Error> {
        let mut encoder = self.device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some("Umbra command encoder"),
        });
        let mut tracker = BindingTracker::default();
        let mut groups = groups.iter();
        let mut presents = false;
        let mut commands = cmdbuf.iter();

        while let Some(cmd) = commands.next() {
            tracker.track(cmd, |id| self.pipeline_layout_of(id));

            match *cmd {
                Command::BeginRenderPass { color, depth } => {
                    let color = color
                        .map(|c| self.color_view(c.target).map(|view| (view, c.load)))
                        .transpose()?;
                    let depth = depth
                        .map(|d| self.texture(d.texture).map(|entry| (entry, d.load)))
                        .transpose()?;
                    let (width, height) = match (color, depth) {
                        (Some(((_, size), _)), _) => size,
                        (None, Some((entry, _))) => (entry.config.width, entry.config.height),
                        (None, None) => return Err(Error::NoRenderTarget),
                    };

                    let color_attachment = [color.map(|((view, _), load)| {
                        RenderPassColorAttachment {
                            view,
                            resolve_target: None,
                            ops: Operations {
                                load: color_load_op(load),
                                store: StoreOp::Store,
                            },
                        }
                    })];
                    let color_attachments: &[Option<RenderPassColorAttachment>] =
                        if color.is_some() {
                            &color_attachment
                        } else {
                            &[]
                        };
                    let mut pass = encoder.begin_render_pass(&RenderPassDescriptor {
                        label: None,
                        color_attachments,
                        depth_stencil_attachment: depth.map(|(entry, load)| {
                            RenderPassDepthStencilAttachment {
                                view: &entry.view,
                                depth_ops: Some(Operations {
                                    load: depth_load_op(load),
                                    store: StoreOp::Store,
                                }),
                                stencil_ops: None,
                            }
                        }),
                        timestamp_writes: None,
                        occlusion_query_set: None,
                    });

                    let mut ended = false;
                    for cmd in commands.by_ref() {
                        let needs_group = tracker.track(cmd, |id| self.pipeline_layout_of(id));
                        if needs_group.is_some() {
                            if let Some(group) = groups.next() {
                                pass.set_bind_group(1, group, &[]);
                            }
                        }

                        match *cmd {
                            Command::EndRenderPass => {
                                ended = true;
                                break;
                            }
                            Command::SetPipeline(id) => {
                                let entry = self.pipeline(id)?;
                                pass.set_pipeline(&entry.pipeline);
                                if let Some(constant) = entry.blend_constant {
                                    pass.set_blend_constant(constant);
                                }
                            }
                            Command::SetDepthState(_) | Command::SetCullMode(_) => {}
                            Command::SetViewport(rect) => {
                                let rect = rect.clamped(width, height);
                                if rect.width() > 0 && rect.height() > 0 {
                                    pass.set_viewport(
                                        rect.left as f32,
                                        rect.top as f32,
                                        rect.width() as f32,
                                        rect.height() as f32,
                                        0.0,
                                        1.0,
                                    );
                                }
                            }
                            Command::SetScissor(rect) => {
                                let rect = rect.clamped(width, height);
                                pass.set_scissor_rect(
                                    rect.left as u32,
                                    rect.top as u32,
                                    rect.width(),
                                    rect.height(),
                                );
                            }
                            Command::SetUniformBuffer { buffer, offset } => {
                                let group = self.uniform_groups.get(&buffer.0).ok_or_else(|| {
                                    Error::Backend(format!("unknown uniform buffer {}", buffer.0))
                                })?;
                                pass.set_bind_group(0, group, &[offset]);
                            }
                            Command::SetVertexBuffer { buffer, offset } => {
                                let buffer = self.buffer(buffer)?;
                                pass.set_vertex_buffer(0, buffer.slice(u64::from(offset)..));
                            }
                            Command::SetIndexBuffer { buffer, offset } => {
                                let buffer = self.buffer(buffer)?;
                                pass.set_index_buffer(
                                    buffer.slice(u64::from(offset)..),
                                    IndexFormat::Uint16,
                                );
                            }
                            // Folded into group 1 by the tracker.
                            Command::SetTexture { .. }
                            | Command::SetSampler { .. }
                            | Command::SetTextureBuffer(_) => {}
                            Command::Draw {
                                vertex_count,
                                base_vertex,
                            } => {
                                pass.draw(base_vertex..(base_vertex + vertex_count), 0..1);
                            }
                            Command::DrawIndexed {
                                index_count,
                                base_index,
                                base_vertex,
                            } => {
                                pass.draw_indexed(
                                    base_index..(base_index + index_count),
                                    base_vertex as i32,
                                    0..1,
                                );
                            }
                            other => {
                                return Err(Error::Backend(format!(
                                    "{other:?} inside a render pass"
                                )));
                            }
                        }
                    }

                    if !ended {
                        return Err(Error::Backend("render pass was never ended".into()));
                    }
                }
                Command::ClearTexture { texture, value } => {
                    self.clear_texture(&mut encoder, texture, value)?;
                }
                Command::CopyTexture {
                    src,
                    src_x,
                    src_y,
                    src_layer,
                    src_level,
                    dst,
                    dst_x,
                    dst_y,
                    dst_layer,
                    dst_level,
                    width,
                    height,
                } => {
                    encoder.copy_texture_to_texture(
                        ImageCopyTexture {
                            texture: &self.texture(src)?.texture,
                            mip_level: src_level,
                            origin: Origin3d {
                                x: src_x,
                                y: src_y,
                                z: src_layer,
                            },
                            aspect: TextureAspect::All,
                        },
                        ImageCopyTexture {
                            texture: &self.texture(dst)?.texture,
                            mip_level: dst_level,
                            origin: Origin3d {
                                x: dst_x,
                                y: dst_y,
                                z: dst_layer,
                            },
                            aspect: TextureAspect::All,
                        },
                        Extent3d {
                            width,
                            height,
                            depth_or_array_layers: 1,
                        },
                    );
                }
                Command::CopyBufferToTexture {
                    buffer,
                    offset,
                    pitch,
                    texture,
                    x,
                    y,
                    width,
                    height,
                    layer,
                    level,
                } => {
                    encoder.copy_buffer_to_texture(
                        ImageCopyBuffer {
                            buffer: self.buffer(buffer)?,
                            layout: ImageDataLayout {
                                offset: u64::from(offset),
                                bytes_per_row: Some(pitch),
                                rows_per_image: None,
                            },
                        },
                        ImageCopyTexture {
                            texture: &self.texture(texture)?.texture,
                            mip_level: level,
                            origin: Origin3d { x, y, z: layer },
                            aspect: TextureAspect::All,
                        },
                        Extent3d {
                            width,
                            height,
                            depth_or_array_layers: 1,
                        },
                    );
                }
                Command::Present => presents = true,
                Command::Draw { .. } | Command::DrawIndexed { .. } | Command::EndRenderPass => {
                    return Err(Error::Backend(format!("{cmd:?} outside a render pass")));
                }
                // Bindings are re-sent whenever a render pass begins.
                _ => {}
            }
        }

        Ok((encoder.finish(), presents))
    }

    fn clear_texture(
        &self,
        encoder: &mut CommandEncoder,
        id: TextureId,
        value: ClearValue,
    ) -> Result<(), Error> {
        let entry = self.texture(id)?;

        match (entry.config.ty, value) {
            (TextureType::RenderTarget, ClearValue::Color(color)) => {
                encoder.begin_render_pass(&RenderPassDescriptor {
                    label: Some("Clear"),
                    color_attachments: &[Some(RenderPassColorAttachment {
                        view: &entry.view,
                        resolve_target: None,
                        ops: Operations {
                            load: LoadOp::Clear(native_color(color)),
                            store: StoreOp::Store,
                        },
                    })],
                    ..Default::default()
                });
            }
            (TextureType::DepthStencil, ClearValue::Depth(depth)) => {
                encoder.begin_render_pass(&RenderPassDescriptor {
                    label: Some("Clear"),
                    depth_stencil_attachment: Some(RenderPassDepthStencilAttachment {
                        view: &entry.view,
                        depth_ops: Some(Operations {
                            load: LoadOp::Clear(depth),
                            store: StoreOp::Store,
                        }),
                        stencil_ops: None,
                    }),
                    ..Default::default()
                });
            }
            (ty, value) => {
                return Err(Error::Backend(format!(
                    "can't clear {:?} texture {} to {:?}",
                    ty, id.0, value,
                )));
            }
        }

        Ok(())
    }

    fn present(&mut self) {
        match self.presenter.as_mut().and_then(|p| p.frame.take()) {
            Some(Frame { texture, view }) => {
                drop(view);
                texture.present();
            }
            None => tracing::warn!("Present without an acquired surface image"),
        }
    }

    fn with_error_scope<T>(&self, f: impl FnOnce(&Device) -> T) -> Result<T, String> {
        self.device.push_error_scope(ErrorFilter::Validation);
        let value = f(&self.device);

        match pollster::block_on(self.device.pop_error_scope()) {
            Some(e) => Err(e.to_string()),
            None => Ok(value),
        }
    }
}

impl Backend for WgpuBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn create_buffer(
        &mut self,
        usage: BufferUsage,
        size: u32,
        label: &str,
    ) -> Result<BufferId, Error> {
        let buffer = self.device.create_buffer(&BufferDescriptor {
            label: Some(label),
            size: u64::from(size),
            usage: native_buffer_usages(usage),
            mapped_at_creation: false,
        });

        Ok(BufferId(self.buffers.insert(buffer)))
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u32, data: &[u8]) {
        if let Some(buffer) = self.buffers.get(buffer.0) {
            self.queue.write_buffer(buffer, u64::from(offset), data);
        }
    }

    fn create_texture(
        &mut self,
        config: &TextureConfig,
        data: Option<(&[u8], u32)>,
    ) -> Result<TextureId, Error> {
        let format = native_format(config.format).ok_or(Error::UnsupportedFormat(config.format))?;
        let usage = if config.samples > 1 {
            TextureUsages::RENDER_ATTACHMENT | TextureUsages::TEXTURE_BINDING
        } else if config.ty == TextureType::Texture {
            TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_SRC | TextureUsages::COPY_DST
        } else {
            TextureUsages::RENDER_ATTACHMENT
                | TextureUsages::TEXTURE_BINDING
                | TextureUsages::COPY_SRC
                | TextureUsages::COPY_DST
        };

        if let Some((data, pitch)) = data {
            let row = config.width * config.format.pixel_size();
            let needed =
                u64::from(pitch) * u64::from(config.height.saturating_sub(1)) + u64::from(row);
            if pitch < row || (data.len() as u64) < needed {
                return Err(Error::InvalidRegion(format!(
                    "{} bytes with a pitch of {} for a {}x{} texture",
                    data.len(),
                    pitch,
                    config.width,
                    config.height,
                )));
            }
        }

        let texture = self.device.create_texture(&TextureDescriptor {
            label: None,
            size: Extent3d {
                width: config.width,
                height: config.height,
                depth_or_array_layers: config.layers,
            },
            mip_level_count: config.levels,
            sample_count: config.samples,
            dimension: TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        if let Some((data, pitch)) = data {
            self.queue.write_texture(
                ImageCopyTexture {
                    texture: &texture,
                    mip_level: 0,
                    origin: Origin3d::ZERO,
                    aspect: TextureAspect::All,
                },
                data,
                ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(pitch),
                    rows_per_image: None,
                },
                Extent3d {
                    width: config.width,
                    height: config.height,
                    depth_or_array_layers: 1,
                },
            );
        }
        let view = texture.create_view(&TextureViewDescriptor::default());

        Ok(TextureId(self.textures.insert(TextureEntry {
            texture,
            view,
            config: *config,
        })))
    }

    fn create_sampler(&mut self, config: &SamplerConfig) -> Result<SamplerId, Error> {
        let border_color = config.border()?.map(native_border_color);
        if border_color.is_some() && !self.caps.supports_border_color {
            return Err(Error::Unsupported("clamp-to-border addressing"));
        }

        // Anisotropy is only valid with linear filtering everywhere.
        let linear = [config.min_filter, config.mag_filter, config.mip_filter]
            .iter()
            .all(|&f| f == sampler::Filter::Linear);

        let sampler = self.device.create_sampler(&SamplerDescriptor {
            label: None,
            address_mode_u: native_address_mode(config.address_u),
            address_mode_v: native_address_mode(config.address_v),
            address_mode_w: native_address_mode(config.address_w),
            mag_filter: native_filter(config.mag_filter),
            min_filter: native_filter(config.min_filter),
            mipmap_filter: native_filter(config.mip_filter),
            lod_min_clamp: config.min_lod,
            lod_max_clamp: config.max_lod.max(config.min_lod),
            compare: None,
            anisotropy_clamp: if linear {
                u16::from(config.anisotropy.max(1))
            } else {
                1
            },
            border_color,
        });

        Ok(SamplerId(self.samplers.insert(sampler)))
    }

    fn create_shader(
        &mut self,
        stage: ShaderStage,
        code: &[u8],
        entry_point: &str,
    ) -> Result<ShaderId, Error> {
        let source =
            std::str::from_utf8(code).map_err(|e| Error::Backend(e.to_string()))?;
        let label = match stage {
            ShaderStage::Vertex => "Vertex shader",
            ShaderStage::Fragment => "Fragment shader",
        };

        let module = self
            .with_error_scope(|device| {
                device.create_shader_module(ShaderModuleDescriptor {
                    label: Some(label),
                    source: ShaderSource::Wgsl(source.into()),
                })
            })
            .map_err(Error::Backend)?;

        Ok(ShaderId(self.shaders.insert(ShaderEntry {
            module,
            entry_point: entry_point.to_owned(),
        })))
    }

    fn create_depth_state(&mut self, state: pipeline::DepthState) -> Result<DepthStateId, Error> {
        Ok(DepthStateId(self.depth_states.insert(state)))
    }

    fn create_pipeline(&mut self, config: &PipelineConfig) -> Result<PipelineId, Error> {
        let vs = self.shader(config.vertex_shader.id())?;
        let fs = self.shader(config.fragment_shader.id())?;

        let attributes = config
            .input_layout
            .attributes
            .iter()
            .map(|attr| {
                native_vertex_format(attr.ty, attr.components)
                    .map(|format| VertexAttribute {
                        format,
                        offset: u64::from(attr.offset),
                        shader_location: attr.location,
                    })
                    .ok_or_else(|| {
                        Error::InvalidPipelineConfig(format!(
                            "{} {:?} components at location {}",
                            attr.components, attr.ty, attr.location,
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let vertex_buffers = [VertexBufferLayout {
            array_stride: u64::from(config.input_layout.stride),
            step_mode: VertexStepMode::Vertex,
            attributes: &attributes,
        }];
        let vertex_buffers: &[VertexBufferLayout] = if attributes.is_empty() {
            &[]
        } else {
            &vertex_buffers
        };

        let color_format = config
            .color_format
            .map(|f| native_format(f).ok_or(Error::UnsupportedFormat(f)))
            .transpose()?;
        let depth_format = config
            .depth_format
            .map(|f| native_format(f).ok_or(Error::UnsupportedFormat(f)))
            .transpose()?;

        let blend = config.blend;
        let targets = [color_format.map(|format| ColorTargetState {
            format,
            blend: blend.enable.then(|| native_blend_state(&blend)),
            write_mask: native_color_writes(blend.write_mask),
        })];
        let targets: &[Option<ColorTargetState>] = if color_format.is_some() {
            &targets
        } else {
            &[]
        };

        let topology = native_topology(config.primitive);
        let layout = &self.pipeline_layouts[layout_index(config.layout)];

        let pipeline = self
            .with_error_scope(|device| {
                device.create_render_pipeline(&RenderPipelineDescriptor {
                    label: None,
                    layout: Some(layout),
                    vertex: VertexState {
                        module: &vs.module,
                        entry_point: &vs.entry_point,
                        compilation_options: PipelineCompilationOptions::default(),
                        buffers: vertex_buffers,
                    },
                    primitive: PrimitiveState {
                        topology,
                        strip_index_format: matches!(
                            topology,
                            PrimitiveTopology::LineStrip | PrimitiveTopology::TriangleStrip,
                        )
                        .then_some(IndexFormat::Uint16),
                        cull_mode: native_cull_mode(config.cull_mode),
                        ..Default::default()
                    },
                    depth_stencil: depth_format.map(|format| DepthStencilState {
                        format,
                        depth_write_enabled: config.depth.write,
                        depth_compare: native_compare(config.depth.func),
                        stencil: StencilState::default(),
                        bias: DepthBiasState::default(),
                    }),
                    multisample: MultisampleState {
                        count: config.samples,
                        ..Default::default()
                    },
                    fragment: Some(FragmentState {
                        module: &fs.module,
                        entry_point: &fs.entry_point,
                        compilation_options: PipelineCompilationOptions::default(),
                        targets,
                    }),
                    multiview: None,
                })
            })
            .map_err(Error::Backend)?;

        let blend_constant = (blend.enable && blend.uses_constant())
            .then(|| native_color(blend.constant));

        Ok(PipelineId(self.pipelines.insert(PipelineEntry {
            pipeline,
            layout: config.layout,
            blend_constant,
        })))
    }

    fn release(&mut self, object: Release) {
        match object {
            Release::Buffer(id) => {
                self.uniform_groups.remove(&id.0);
                if let Some(buffer) = self.buffers.remove(id.0) {
                    buffer.destroy();
                }
            }
            Release::Texture(id) => {
                if let Some(entry) = self.textures.remove(id.0) {
                    entry.texture.destroy();
                }
            }
            Release::Sampler(id) => {
                self.samplers.remove(id.0);
            }
            Release::Shader(id) => {
                self.shaders.remove(id.0);
            }
            Release::Pipeline(id) => {
                self.pipelines.remove(id.0);
            }
            Release::DepthState(id) => {
                self.depth_states.remove(id.0);
            }
        }
    }

    fn submit(&mut self, cmdbuf: CommandBuffer, signal: CompletionSignal) {
        let groups = self.prepare_bind_groups(&cmdbuf);

        match self.replay(&cmdbuf, &groups) {
            Ok((buffer, presents)) => {
                self.queue.submit(Some(buffer));
                if presents {
                    self.present();
                }
            }
            Err(e) => {
                tracing::error!("Dropping command buffer {}: {}", signal.fence(), e);
                if let Some(presenter) = self.presenter.as_mut() {
                    presenter.frame = None;
                }
                self.queue.submit(std::iter::empty());
            }
        }

        // Fires once everything submitted so far has finished, so completions stay ordered.
        self.queue.on_submitted_work_done(move || signal.signal());
    }

    fn poll(&mut self) {
        let _ = self.device.poll(Maintain::Poll);
    }

    fn acquire_surface(&mut self) -> bool {
        let Some(presenter) = self.presenter.as_mut() else {
            return false;
        };
        if presenter.frame.is_some() {
            return true;
        }

        match presenter.surface.get_current_texture() {
            Ok(texture) => {
                let view = texture.texture.create_view(&TextureViewDescriptor::default());
                presenter.frame = Some(Frame { texture, view });
                true
            }
            Err(SurfaceError::Outdated | SurfaceError::Lost) => {
                tracing::debug!("Surface is out of date; reconfiguring");
                presenter.surface.configure(&self.device, &presenter.config);
                false
            }
            Err(e) => {
                tracing::warn!("Failed to acquire a surface image: {}", e);
                false
            }
        }
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        if let Some(presenter) = self.presenter.as_mut() {
            presenter.frame = None;
            presenter.config.width = width.max(1);
            presenter.config.height = height.max(1);
            presenter.surface.configure(&self.device, &presenter.config);
            tracing::debug!("Resized surface to {}x{}", width, height);
        }
    }

    fn surface_size(&self) -> (u32, u32) {
        self.presenter
            .as_ref()
            .map_or((0, 0), |p| (p.config.width, p.config.height))
    }

    fn surface_format(&self) -> Option<texture::TextureFormat> {
        self.presenter.as_ref().map(|p| p.format)
    }
}

/// Follows the resource bindings of a command stream to find the draws that need a new group 1.
#[derive(Debug, Default)]
struct BindingTracker {
    layout: Option<pipeline::PipelineLayout>,
    textures: [Option<TextureId>; MAX_TEXTURE_SAMPLERS],
    samplers: [Option<SamplerId>; MAX_TEXTURE_SAMPLERS],
    texture_buffer: Option<BufferId>,
    dirty: bool,
}

impl BindingTracker {
    /// Observes `cmd`. Returns the layout to build a group for if `cmd` is a draw that can't reuse
    /// the last one.
    fn track(
        &mut self,
        cmd: &Command,
        layout_of: impl Fn(PipelineId) -> Option<pipeline::PipelineLayout>,
    ) -> Option<pipeline::PipelineLayout> {
        match *cmd {
            // Passes start with nothing bound.
            Command::BeginRenderPass { .. } => self.dirty = true,
            Command::SetPipeline(id) => {
                let layout = layout_of(id);
                if layout != self.layout {
                    self.layout = layout;
                    self.dirty = true;
                }
            }
            Command::SetTexture { slot, texture } => {
                if let Some(bound) = self.textures.get_mut(slot as usize) {
                    *bound = texture;
                    self.dirty = true;
                }
            }
            Command::SetSampler { slot, sampler } => {
                if let Some(bound) = self.samplers.get_mut(slot as usize) {
                    *bound = sampler;
                    self.dirty = true;
                }
            }
            Command::SetTextureBuffer(buffer) => {
                self.texture_buffer = buffer;
                self.dirty = true;
            }
            Command::Draw { .. } | Command::DrawIndexed { .. } if self.dirty => {
                if let Some(layout) = self.layout {
                    self.dirty = false;
                    return Some(layout);
                }
            }
            _ => {}
        }

        None
    }
}

fn native_buffer_usages(usage: BufferUsage) -> BufferUsages {
    let mut native = BufferUsages::COPY_DST;
    for (ours, theirs) in [
        (BufferUsage::VERTEX, BufferUsages::VERTEX),
        (BufferUsage::INDEX, BufferUsages::INDEX),
        (BufferUsage::UNIFORM, BufferUsages::UNIFORM),
        (BufferUsage::STORAGE, BufferUsages::STORAGE),
        (BufferUsage::COPY_SRC, BufferUsages::COPY_SRC),
    ] {
        if usage.contains(ours) {
            native |= theirs;
        }
    }

    native
}

fn native_format(format: texture::TextureFormat) -> Option<TextureFormat> {
    use texture::TextureFormat as F;

    Some(match format {
        F::Rgba8 => TextureFormat::Rgba8Unorm,
        F::Bgra8 => TextureFormat::Bgra8Unorm,
        // No packed 16-bit color formats in WebGPU.
        F::Rgb565 | F::Rgba5551 => return None,
        F::R8 => TextureFormat::R8Unorm,
        F::R16U => TextureFormat::R16Uint,
        F::R16F => TextureFormat::R16Float,
        F::R32I => TextureFormat::R32Sint,
        F::R32U => TextureFormat::R32Uint,
        F::R32F => TextureFormat::R32Float,
        F::Rg8 => TextureFormat::Rg8Unorm,
        F::Rg16F => TextureFormat::Rg16Float,
        F::Rg32F => TextureFormat::Rg32Float,
        F::Rgba16F => TextureFormat::Rgba16Float,
        F::Rgba32F => TextureFormat::Rgba32Float,
        F::Rgb10A2 => TextureFormat::Rgb10a2Unorm,
        F::D16 => TextureFormat::Depth16Unorm,
        F::D24S8 => TextureFormat::Depth24PlusStencil8,
        F::D32F => TextureFormat::Depth32Float,
    })
}

fn from_native_format(format: TextureFormat) -> Option<texture::TextureFormat> {
    use texture::TextureFormat as F;

    match format {
        TextureFormat::Bgra8Unorm => Some(F::Bgra8),
        TextureFormat::Rgba8Unorm => Some(F::Rgba8),
        TextureFormat::Rgb10a2Unorm => Some(F::Rgb10A2),
        TextureFormat::Rgba16Float => Some(F::Rgba16F),
        _ => None,
    }
}

fn native_vertex_format(ty: AttributeType, components: u32) -> Option<VertexFormat> {
    use AttributeType as A;

    Some(match (ty, components) {
        (A::Float, 1) => VertexFormat::Float32,
        (A::Float, 2) => VertexFormat::Float32x2,
        (A::Float, 3) => VertexFormat::Float32x3,
        (A::Float, 4) => VertexFormat::Float32x4,
        (A::UInt8, 2) => VertexFormat::Uint8x2,
        (A::UInt8, 4) => VertexFormat::Uint8x4,
        (A::SInt8, 2) => VertexFormat::Sint8x2,
        (A::SInt8, 4) => VertexFormat::Sint8x4,
        (A::UNorm8, 2) => VertexFormat::Unorm8x2,
        (A::UNorm8, 4) => VertexFormat::Unorm8x4,
        (A::UInt16, 2) => VertexFormat::Uint16x2,
        (A::UInt16, 4) => VertexFormat::Uint16x4,
        (A::SInt16, 2) => VertexFormat::Sint16x2,
        (A::SInt16, 4) => VertexFormat::Sint16x4,
        (A::UNorm16, 2) => VertexFormat::Unorm16x2,
        (A::UNorm16, 4) => VertexFormat::Unorm16x4,
        (A::UInt32, 1) => VertexFormat::Uint32,
        (A::UInt32, 2) => VertexFormat::Uint32x2,
        (A::UInt32, 3) => VertexFormat::Uint32x3,
        (A::UInt32, 4) => VertexFormat::Uint32x4,
        (A::SInt32, 1) => VertexFormat::Sint32,
        (A::SInt32, 2) => VertexFormat::Sint32x2,
        (A::SInt32, 3) => VertexFormat::Sint32x3,
        (A::SInt32, 4) => VertexFormat::Sint32x4,
        _ => return None,
    })
}

fn native_topology(primitive: pipeline::Primitive) -> PrimitiveTopology {
    match primitive {
        pipeline::Primitive::Points => PrimitiveTopology::PointList,
        pipeline::Primitive::Lines => PrimitiveTopology::LineList,
        pipeline::Primitive::LineStrip => PrimitiveTopology::LineStrip,
        pipeline::Primitive::Triangles => PrimitiveTopology::TriangleList,
        pipeline::Primitive::TriangleStrip => PrimitiveTopology::TriangleStrip,
    }
}

fn native_cull_mode(mode: pipeline::CullMode) -> Option<Face> {
    match mode {
        pipeline::CullMode::None => None,
        pipeline::CullMode::Front => Some(Face::Front),
        pipeline::CullMode::Back => Some(Face::Back),
    }
}

fn native_compare(func: pipeline::DepthFunc) -> CompareFunction {
    use pipeline::DepthFunc as D;

    match func {
        D::Never => CompareFunction::Never,
        D::Always => CompareFunction::Always,
        D::Less => CompareFunction::Less,
        D::LessEqual => CompareFunction::LessEqual,
        D::Greater => CompareFunction::Greater,
        D::GreaterEqual => CompareFunction::GreaterEqual,
        D::Equal => CompareFunction::Equal,
    }
}

fn native_blend_factor(factor: pipeline::BlendFactor) -> BlendFactor {
    use pipeline::BlendFactor as B;

    match factor {
        B::Zero => BlendFactor::Zero,
        B::One => BlendFactor::One,
        B::SrcColor => BlendFactor::Src,
        B::InvSrcColor => BlendFactor::OneMinusSrc,
        B::DstColor => BlendFactor::Dst,
        B::InvDstColor => BlendFactor::OneMinusDst,
        B::SrcAlpha => BlendFactor::SrcAlpha,
        B::InvSrcAlpha => BlendFactor::OneMinusSrcAlpha,
        B::DstAlpha => BlendFactor::DstAlpha,
        B::InvDstAlpha => BlendFactor::OneMinusDstAlpha,
        B::ConstantColor => BlendFactor::Constant,
        B::InvConstantColor => BlendFactor::OneMinusConstant,
    }
}

fn native_blend_op(op: pipeline::BlendOp) -> BlendOperation {
    match op {
        pipeline::BlendOp::Add => BlendOperation::Add,
        pipeline::BlendOp::Subtract => BlendOperation::Subtract,
        pipeline::BlendOp::ReverseSubtract => BlendOperation::ReverseSubtract,
        pipeline::BlendOp::Min => BlendOperation::Min,
        pipeline::BlendOp::Max => BlendOperation::Max,
    }
}

fn native_blend_state(blend: &pipeline::BlendState) -> BlendState {
    BlendState {
        color: BlendComponent {
            src_factor: native_blend_factor(blend.src_color),
            dst_factor: native_blend_factor(blend.dst_color),
            operation: native_blend_op(blend.color_op),
        },
        alpha: BlendComponent {
            src_factor: native_blend_factor(blend.src_alpha),
            dst_factor: native_blend_factor(blend.dst_alpha),
            operation: native_blend_op(blend.alpha_op),
        },
    }
}

fn native_color_writes(mask: pipeline::ColorMask) -> ColorWrites {
    let mut writes = ColorWrites::empty();
    for (ours, theirs) in [
        (pipeline::ColorMask::R, ColorWrites::RED),
        (pipeline::ColorMask::G, ColorWrites::GREEN),
        (pipeline::ColorMask::B, ColorWrites::BLUE),
        (pipeline::ColorMask::A, ColorWrites::ALPHA),
    ] {
        if mask.contains(ours) {
            writes |= theirs;
        }
    }

    writes
}

fn native_filter(filter: sampler::Filter) -> FilterMode {
    match filter {
        sampler::Filter::Nearest => FilterMode::Nearest,
        sampler::Filter::Linear => FilterMode::Linear,
    }
}

fn native_address_mode(mode: sampler::AddressMode) -> AddressMode {
    match mode {
        sampler::AddressMode::Repeat => AddressMode::Repeat,
        sampler::AddressMode::ClampToEdge => AddressMode::ClampToEdge,
        sampler::AddressMode::ClampToBorder => AddressMode::ClampToBorder,
        sampler::AddressMode::MirrorRepeat => AddressMode::MirrorRepeat,
    }
}

fn native_border_color(color: sampler::BorderColor) -> SamplerBorderColor {
    match color {
        sampler::BorderColor::TransparentBlack => SamplerBorderColor::TransparentBlack,
        sampler::BorderColor::OpaqueBlack => SamplerBorderColor::OpaqueBlack,
        sampler::BorderColor::OpaqueWhite => SamplerBorderColor::OpaqueWhite,
    }
}

fn native_color(rgba: u32) -> Color {
    let [r, g, b, a] = ClearValue::color_f32(rgba);

    Color {
        r: f64::from(r),
        g: f64::from(g),
        b: f64::from(b),
        a: f64::from(a),
    }
}

fn color_load_op(load: cmd::LoadOp<u32>) -> LoadOp<Color> {
    match load {
        cmd::LoadOp::Load => LoadOp::Load,
        cmd::LoadOp::Clear(color) => LoadOp::Clear(native_color(color)),
        // Clearing is the cheapest way to say we don't care on tiled GPUs.
        cmd::LoadOp::DontCare => LoadOp::Clear(Color::TRANSPARENT),
    }
}

fn depth_load_op(load: cmd::LoadOp<f32>) -> LoadOp<f32> {
    match load {
        cmd::LoadOp::Load => LoadOp::Load,
        cmd::LoadOp::Clear(depth) => LoadOp::Clear(depth),
        cmd::LoadOp::DontCare => LoadOp::Clear(1.0),
    }
}
