// SPDX-License-Identifier: MPL-2.0

//! The device.
//!
//! A [`GraphicsContext`] owns a [`Backend`] and everything needed to drive it safely: the command
//! buffer being built, the stream buffers transient data goes through, the fence tracker, and the
//! queue of objects waiting to be destroyed.
//!
//! The context is single-threaded. Only completion signals cross threads.

use std::{collections::HashMap, ops::Range, rc::Rc};

use umbra_util::{align_down, align_up, copy_rows};

use crate::{
    backend::{
        Backend, BackendKind, BufferId, BufferUsage, Capabilities, DepthStateId, TextureId,
    },
    cmd::{Command, CommandBuffer, Rect},
    config::GpuConfig,
    encoder::{ActiveEncoder, EncoderState, StreamBindings},
    fence::FenceTracker,
    pipeline::{DepthState, Pipeline, PipelineConfig},
    release::{DeferredReleaseQueue, Handle, Release, ReleaseReceiver, ReleaseSender},
    sampler::{Sampler, SamplerConfig},
    shader::{self, CompileOptions, Shader, ShaderCompiler, ShaderStage},
    stats::Statistics,
    stream::{Reservation, StreamBuffer},
    texture::{
        ClearValue, Framebuffer, Origin, Texture, TextureBuffer, TextureBufferFormat,
        TextureConfig, TextureState,
    },
    Error, MAX_UNIFORM_BUFFER_SIZE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamKind {
    Vertex,
    Index,
    Uniform,
    Texture,
}

impl StreamKind {
    fn name(self) -> &'static str {
        match self {
            Self::Vertex => "vertex",
            Self::Index => "index",
            Self::Uniform => "uniform",
            Self::Texture => "texture upload",
        }
    }
}

struct Streams {
    vertex: StreamBuffer,
    index: StreamBuffer,
    uniform: StreamBuffer,
    texture: StreamBuffer,
}

impl Streams {
    fn get_mut(&mut self, kind: StreamKind) -> &mut StreamBuffer {
        match kind {
            StreamKind::Vertex => &mut self.vertex,
            StreamKind::Index => &mut self.index,
            StreamKind::Uniform => &mut self.uniform,
            StreamKind::Texture => &mut self.texture,
        }
    }

    fn all_mut(&mut self) -> [&mut StreamBuffer; 4] {
        [
            &mut self.vertex,
            &mut self.index,
            &mut self.uniform,
            &mut self.texture,
        ]
    }
}

/// A texture region reserved by [`GraphicsContext::map_texture`].
#[derive(Clone, Copy, Debug)]
struct MappedTexture {
    texture: TextureId,
    at: Origin,
    width: u32,
    height: u32,
    pitch: u32,
}

pub struct GraphicsContext {
    encoder: EncoderState,
    streams: Streams,
    mapped_texture: Option<MappedTexture>,
    depth_states: HashMap<u8, DepthStateId>,
    fences: FenceTracker,
    releases: DeferredReleaseQueue<Release>,
    release_rx: ReleaseReceiver,
    release_tx: ReleaseSender,
    compiler: Box<dyn ShaderCompiler>,
    config: GpuConfig,
    caps: Capabilities,
    stats: Statistics,
    backend: Box<dyn Backend>,
}

impl GraphicsContext {
    pub fn new(
        mut backend: Box<dyn Backend>,
        config: GpuConfig,
        compiler: Box<dyn ShaderCompiler>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let caps = backend.capabilities();
        if config.uniform_buffer_size < MAX_UNIFORM_BUFFER_SIZE + caps.uniform_buffer_alignment {
            return Err(Error::Config("uniform buffer is too small".into()));
        }

        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let mut create_stream =
            |usage: BufferUsage, size: u32, label: &str| -> Result<StreamBuffer, Error> {
                let id = backend.create_buffer(usage, size, label).map_err(|e| {
                    tracing::error!("Failed to create {}: {}", label, e);
                    e
                })?;

                Ok(StreamBuffer::new(Handle::new(id, release_tx.clone()), size))
            };

        let streams = Streams {
            vertex: create_stream(
                BufferUsage::VERTEX,
                config.vertex_buffer_size,
                "vertex buffer",
            )?,
            index: create_stream(BufferUsage::INDEX, config.index_buffer_size, "index buffer")?,
            uniform: create_stream(
                BufferUsage::UNIFORM,
                config.uniform_buffer_size,
                "uniform buffer",
            )?,
            texture: create_stream(
                BufferUsage::COPY_SRC,
                config.texture_buffer_size,
                "texture upload buffer",
            )?,
        };

        let encoder = EncoderState::new(
            StreamBindings {
                vertex: streams.vertex.buffer(),
                index: streams.index.buffer(),
                uniform: streams.uniform.buffer(),
            },
            backend.surface_size(),
        );

        tracing::info!("Created {} device", backend.kind());
        tracing::debug!("{:?}", caps);

        Ok(Self {
            encoder,
            streams,
            mapped_texture: None,
            depth_states: HashMap::new(),
            fences: FenceTracker::new(),
            releases: DeferredReleaseQueue::new(),
            release_rx,
            release_tx,
            compiler,
            config,
            caps,
            stats: Statistics::default(),
            backend,
        })
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn config(&self) -> &GpuConfig {
        &self.config
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    pub fn reset_statistics(&mut self) {
        self.stats.reset();
    }

    /// The fence value of the command buffer being built.
    pub fn current_fence(&self) -> u64 {
        self.fences.current()
    }

    pub fn completed_fence(&self) -> u64 {
        self.fences.completed()
    }

    /// Objects waiting for their fence to complete.
    pub fn pending_releases(&self) -> usize {
        self.releases.len() + self.release_rx.len()
    }

    /// The commands recorded since the last submission.
    pub fn command_buffer(&self) -> &CommandBuffer {
        self.encoder.command_buffer()
    }

    pub fn active_encoder(&self) -> ActiveEncoder {
        self.encoder.active()
    }

    // Resource creation.

    pub fn create_texture(
        &mut self,
        config: &TextureConfig,
        data: Option<(&[u8], u32)>,
    ) -> Result<Rc<Texture>, Error> {
        let id = config
            .validate(&self.caps)
            .and_then(|()| self.backend.create_texture(config, data))
            .map_err(|e| {
                tracing::error!(
                    "Failed to create {}x{} texture: {}",
                    config.width,
                    config.height,
                    e,
                );
                e
            })?;

        Ok(Rc::new(Texture::new(
            Handle::new(id, self.release_tx.clone()),
            *config,
            data.is_some(),
        )))
    }

    pub fn create_sampler(&mut self, config: &SamplerConfig) -> Result<Rc<Sampler>, Error> {
        let result = config.border().and_then(|border| {
            if border.is_some() && !self.caps.supports_border_color {
                return Err(Error::Unsupported("border colors"));
            }

            self.backend.create_sampler(config)
        });
        let id = result.map_err(|e| {
            tracing::error!("Failed to create sampler: {}", e);
            e
        })?;

        Ok(Rc::new(Sampler::new(
            Handle::new(id, self.release_tx.clone()),
            *config,
        )))
    }

    /// Compiles `source` and creates a shader from it.
    ///
    /// Sources that fail to compile are dumped to `bad_shader_{n}.txt` alongside the compiler's
    /// diagnostic.
    pub fn create_shader(
        &mut self,
        stage: ShaderStage,
        source: &str,
        entry_point: &str,
    ) -> Result<Shader, Error> {
        let dump_dir = self.config.shader_dump_dir.clone();
        let fail = |source: &str, diagnostic: String| {
            tracing::error!("Failed to compile {:?} shader: {}", stage, diagnostic);
            shader::dump_bad_shader(&dump_dir, source, &diagnostic);

            Error::ShaderCompilation(diagnostic)
        };

        let options = CompileOptions {
            debug: self.config.debug_device,
        };
        let intermediate = self
            .compiler
            .compile(stage, source, &options)
            .map_err(|e| fail(source, e))?;
        let code = self
            .compiler
            .translate(&intermediate)
            .map_err(|e| fail(source, e))?;

        if self.config.dump_shaders {
            shader::dump_shader(&dump_dir, self.compiler.target_suffix(), &code);
        }

        if !shader::has_entry_point(&code, entry_point) {
            tracing::error!("{:?} shader has no entry point '{}'", stage, entry_point);
            return Err(Error::MissingEntryPoint(entry_point.to_string()));
        }

        let id = self
            .backend
            .create_shader(stage, code.as_bytes(), entry_point)
            .map_err(|e| match e {
                Error::Backend(diagnostic) => fail(&code, diagnostic),
                e => e,
            })?;

        Ok(Shader::new(Handle::new(id, self.release_tx.clone()), stage))
    }

    pub fn create_pipeline(&mut self, config: &PipelineConfig) -> Result<Rc<Pipeline>, Error> {
        let result = config
            .validate()
            .and_then(|()| self.depth_state(config.depth))
            .and_then(|depth_state| {
                self.backend
                    .create_pipeline(config)
                    .map(|id| (id, depth_state))
            });
        let (id, depth_state) = result.map_err(|e| {
            tracing::error!("Failed to create pipeline: {}", e);
            e
        })?;

        Ok(Rc::new(Pipeline::new(
            Handle::new(id, self.release_tx.clone()),
            config.layout,
            depth_state,
            config.cull_mode,
        )))
    }

    /// Returns the depth state for `state`, creating it on first use.
    fn depth_state(&mut self, state: DepthState) -> Result<DepthStateId, Error> {
        let key = state.key();
        if let Some(&id) = self.depth_states.get(&key) {
            return Ok(id);
        }

        let id = self.backend.create_depth_state(state)?;
        self.depth_states.insert(key, id);

        Ok(id)
    }

    pub fn create_framebuffer(
        &mut self,
        color: Option<&Rc<Texture>>,
        depth: Option<&Rc<Texture>>,
    ) -> Result<Rc<Framebuffer>, Error> {
        Framebuffer::new(color.cloned(), depth.cloned())
            .map(Rc::new)
            .map_err(|e| {
                tracing::error!("Failed to create framebuffer: {}", e);
                e
            })
    }

    pub fn create_texture_buffer(
        &mut self,
        format: TextureBufferFormat,
        size_in_elements: u32,
    ) -> Result<TextureBuffer, Error> {
        let size = size_in_elements
            .checked_mul(format.element_size())
            .map(|size| align_up(size, 4))
            .filter(|&size| size > 0)
            .ok_or(Error::Unsupported("texture buffer size"))?;
        let id = self
            .backend
            .create_buffer(BufferUsage::STORAGE, size, "texture buffer")
            .map_err(|e| {
                tracing::error!("Failed to create texture buffer: {}", e);
                e
            })?;
        let stream = StreamBuffer::new(Handle::new(id, self.release_tx.clone()), size);

        Ok(TextureBuffer::new(stream, format, size_in_elements))
    }

    // Streamed data.

    fn handle_reservation(
        &mut self,
        reservation: Reservation,
        retried: &mut bool,
        what: &str,
        num_bytes: u32,
    ) -> bool {
        match reservation {
            Reservation::Ready => true,
            Reservation::WaitFor(fence) => {
                self.wait_for_fence_counter(fence);
                false
            }
            Reservation::Full => {
                if *retried {
                    panic!("Failed to reserve {num_bytes} bytes of {what} space");
                }
                tracing::debug!("Out of {} space, submitting command buffer", what);
                self.submit_command_buffer(false);
                *retried = true;
                false
            }
        }
    }

    fn reserve(&mut self, kind: StreamKind, num_bytes: u32, alignment: u32) {
        let mut retried = false;
        loop {
            let reservation =
                self.streams
                    .get_mut(kind)
                    .reserve(num_bytes, alignment, &self.fences);
            if self.handle_reservation(reservation, &mut retried, kind.name(), num_bytes) {
                return;
            }
        }
    }

    fn commit(&mut self, kind: StreamKind, num_bytes: u32) -> Range<u32> {
        let sb = self.streams.get_mut(kind);
        let range = sb.commit(num_bytes, &self.fences);
        flush_stream(self.backend.as_mut(), sb, range.clone());
        self.stats.buffer_streamed += u64::from(num_bytes);

        range
    }

    /// Reserves space for `vertex_count` vertices of `vertex_size` bytes.
    ///
    /// Returns the index of the first vertex, to be passed as the base vertex of the draw, and the
    /// bytes to fill in.
    ///
    /// # Panics
    ///
    /// Panics if `vertex_size` is zero or the vertices don't fit in a `u32` byte count.
    pub fn map_vertex_buffer(&mut self, vertex_size: u32, vertex_count: u32) -> (u32, &mut [u8]) {
        let num_bytes = stream_size("vertex", vertex_size, vertex_count);
        self.reserve(StreamKind::Vertex, num_bytes, vertex_size);

        let sb = &mut self.streams.vertex;
        let base_vertex = sb.current_offset() / vertex_size;

        (base_vertex, &mut sb.host_mut()[..(num_bytes as usize)])
    }

    pub fn unmap_vertex_buffer(&mut self, vertex_size: u32, vertex_count: u32) {
        self.commit(StreamKind::Vertex, stream_size("vertex", vertex_size, vertex_count));
    }

    /// Streams `vertices` and returns the base vertex to draw them with.
    pub fn push_vertices<T: bytemuck::Pod>(&mut self, vertices: &[T]) -> u32 {
        let vertex_size = std::mem::size_of::<T>() as u32;
        let count = vertices.len() as u32;
        let (base_vertex, dst) = self.map_vertex_buffer(vertex_size, count);
        dst.copy_from_slice(bytemuck::cast_slice(vertices));
        self.unmap_vertex_buffer(vertex_size, count);

        base_vertex
    }

    /// Reserves space for `index_count` 16-bit indices.
    ///
    /// Returns the position of the first index, to be passed as the base index of the draw, and the
    /// bytes to fill in.
    pub fn map_index_buffer(&mut self, index_count: u32) -> (u32, &mut [u8]) {
        const INDEX_SIZE: u32 = std::mem::size_of::<u16>() as u32;

        let num_bytes = stream_size("index", INDEX_SIZE, index_count);
        self.reserve(StreamKind::Index, num_bytes, INDEX_SIZE);

        let sb = &mut self.streams.index;
        let base_index = sb.current_offset() / INDEX_SIZE;

        (base_index, &mut sb.host_mut()[..(num_bytes as usize)])
    }

    pub fn unmap_index_buffer(&mut self, index_count: u32) {
        self.commit(StreamKind::Index, stream_size("index", 2, index_count));
    }

    /// Streams `indices` and returns the base index to draw them with.
    pub fn push_indices(&mut self, indices: &[u16]) -> u32 {
        let count = indices.len() as u32;
        let (base_index, dst) = self.map_index_buffer(count);
        dst.copy_from_slice(bytemuck::cast_slice(indices));
        self.unmap_index_buffer(count);

        base_index
    }

    /// Reserves a uniform block of `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size` is larger than [`MAX_UNIFORM_BUFFER_SIZE`].
    pub fn map_uniform_buffer(&mut self, size: u32) -> &mut [u8] {
        assert!(
            size <= MAX_UNIFORM_BUFFER_SIZE,
            "uniform block of {size} bytes exceeds {MAX_UNIFORM_BUFFER_SIZE}",
        );

        // Every binding covers the largest block, so reserve that much.
        let alignment = self.caps.uniform_buffer_alignment;
        self.reserve(
            StreamKind::Uniform,
            align_up(MAX_UNIFORM_BUFFER_SIZE, alignment),
            alignment,
        );

        &mut self.streams.uniform.host_mut()[..(size as usize)]
    }

    pub fn unmap_uniform_buffer(&mut self, size: u32) {
        let used = align_up(size, self.caps.uniform_buffer_alignment);
        let range = self.commit(StreamKind::Uniform, used);
        self.encoder.set_uniform_offset(range.start);
    }

    pub fn push_uniforms<T: bytemuck::Pod>(&mut self, uniforms: &T) {
        let bytes = bytemuck::bytes_of(uniforms);
        let size = bytes.len() as u32;
        self.map_uniform_buffer(size).copy_from_slice(bytes);
        self.unmap_uniform_buffer(size);
    }

    pub fn map_texture_buffer<'t>(
        &mut self,
        buffer: &'t mut TextureBuffer,
        element_count: u32,
    ) -> &'t mut [u8] {
        let element_size = buffer.format().element_size();
        let num_bytes = stream_size("texture buffer", element_size, element_count);

        let mut retried = false;
        loop {
            let reservation = buffer.stream.reserve(num_bytes, element_size, &self.fences);
            if self.handle_reservation(reservation, &mut retried, "texture buffer", num_bytes) {
                break;
            }
        }

        &mut buffer.stream.host_mut()[..(num_bytes as usize)]
    }

    /// Returns the index of the first element written, for the shader to read from.
    pub fn unmap_texture_buffer(&mut self, buffer: &mut TextureBuffer, element_count: u32) -> u32 {
        let element_size = buffer.format().element_size();
        let num_bytes = stream_size("texture buffer", element_size, element_count);

        let range = buffer.stream.commit(num_bytes, &self.fences);
        flush_stream(self.backend.as_mut(), &buffer.stream, range.clone());
        self.stats.buffer_streamed += u64::from(num_bytes);
        buffer.current_position = range.start / element_size;

        buffer.current_position
    }

    // Texture transfers.

    /// Uploads `width`x`height` pixels from `data`, whose rows are `pitch` bytes apart, to `at`.
    pub fn update_texture(
        &mut self,
        texture: &Texture,
        at: Origin,
        width: u32,
        height: u32,
        data: &[u8],
        pitch: u32,
    ) -> Result<(), Error> {
        texture.check_region(at, width, height)?;
        let row = width * texture.format().pixel_size();
        let needed = (pitch as usize) * (height as usize - 1) + row as usize;
        if pitch < row || data.len() < needed {
            return Err(Error::InvalidRegion(format!(
                "{} bytes with pitch {} for {}x{} pixels",
                data.len(),
                pitch,
                width,
                height,
            )));
        }

        let aligned_pitch = align_up(row, self.caps.texture_upload_pitch_alignment);
        let num_bytes = aligned_pitch * height;
        self.stats.num_uploads += 1;

        if num_bytes >= self.streams.texture.size() / 2 {
            // Too big for the ring. Stage through a buffer that lives until this command buffer
            // completes.
            let id = self
                .backend
                .create_buffer(BufferUsage::COPY_SRC, num_bytes, "texture staging buffer")
                .map_err(|e| {
                    tracing::error!("Failed to create staging buffer: {}", e);
                    e
                })?;
            let staging = Handle::new(id, self.release_tx.clone());

            let mut contents = vec![0; num_bytes as usize];
            copy_rows(
                &mut contents,
                aligned_pitch as usize,
                data,
                pitch as usize,
                row as usize,
                height as usize,
            );
            self.backend.write_buffer(id, 0, &contents);
            self.stats.buffer_streamed += u64::from(num_bytes);

            self.record_texture_upload(texture, id, 0, aligned_pitch, at, width, height);
            drop(staging);
        } else {
            self.reserve(
                StreamKind::Texture,
                num_bytes,
                self.caps.texture_upload_alignment,
            );
            copy_rows(
                self.streams.texture.host_mut(),
                aligned_pitch as usize,
                data,
                pitch as usize,
                row as usize,
                height as usize,
            );
            let range = self.commit(StreamKind::Texture, num_bytes);
            let buffer = self.streams.texture.buffer();

            self.record_texture_upload(
                texture,
                buffer,
                range.start,
                aligned_pitch,
                at,
                width,
                height,
            );
        }

        Ok(())
    }

    /// Reserves upload space for a region of level 0 of layer 0.
    ///
    /// Returns the bytes to fill in and the pitch to fill them with. The upload happens in
    /// [`unmap_texture`](Self::unmap_texture).
    pub fn map_texture(
        &mut self,
        texture: &Texture,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<(&mut [u8], u32), Error> {
        if self.mapped_texture.is_some() {
            return Err(Error::Unsupported("mapping two textures at once"));
        }

        let at = Origin::new(x, y);
        texture.check_region(at, width, height)?;

        let pitch = align_up(
            width * texture.format().pixel_size(),
            self.caps.texture_upload_pitch_alignment,
        );
        let num_bytes = pitch * height;
        if num_bytes >= self.streams.texture.size() / 2 {
            return Err(Error::Unsupported("mapping more than half the upload buffer"));
        }

        self.reserve(
            StreamKind::Texture,
            num_bytes,
            self.caps.texture_upload_alignment,
        );
        self.mapped_texture = Some(MappedTexture {
            texture: texture.id(),
            at,
            width,
            height,
            pitch,
        });

        Ok((
            &mut self.streams.texture.host_mut()[..(num_bytes as usize)],
            pitch,
        ))
    }

    pub fn unmap_texture(&mut self, texture: &Texture) {
        let Some(mapped) = self.mapped_texture.take() else {
            tracing::error!("Unmapping {:?}, which isn't mapped", texture);
            return;
        };
        if mapped.texture != texture.id() {
            tracing::error!("Unmapping {:?}, but {:?} is mapped", texture, mapped.texture);
            return;
        }

        let range = self.commit(StreamKind::Texture, mapped.pitch * mapped.height);
        let buffer = self.streams.texture.buffer();
        self.stats.num_uploads += 1;

        self.record_texture_upload(
            texture,
            buffer,
            range.start,
            mapped.pitch,
            mapped.at,
            mapped.width,
            mapped.height,
        );
    }

    /// Records a buffer-to-texture copy.
    ///
    /// If the command buffer being built already uses the texture, the copy must stay ordered with
    /// those uses and goes into the main list. Otherwise it goes into the upload list.
    #[allow(clippy::too_many_arguments)]
    fn record_texture_upload(
        &mut self,
        texture: &Texture,
        buffer: BufferId,
        offset: u32,
        pitch: u32,
        at: Origin,
        width: u32,
        height: u32,
    ) {
        let fence = self.fences.current();
        if texture.state() == TextureState::Cleared && !texture.is_full_region(at, width, height) {
            self.encoder.commit_clear(texture, fence);
        }

        let cmd = Command::CopyBufferToTexture {
            buffer,
            offset,
            pitch,
            texture: texture.id(),
            x: at.x,
            y: at.y,
            width,
            height,
            layer: at.layer,
            level: at.level,
        };

        if texture.use_fence() == fence {
            if self.encoder.active() != ActiveEncoder::InlineUpload {
                self.encoder.begin_inline_upload();
            }
            self.encoder.record(cmd);
        } else {
            self.encoder.record_upload(cmd);
        }

        texture.mark_dirty();
    }

    /// Copies `width`x`height` pixels from `src` at `src_at` to `dst` at `dst_at`.
    ///
    /// A pending clear of `src` is carried over to a render target `dst` instead of copied when the
    /// copy covers all of `dst`. Copies out of an invalidated texture, or between textures pending
    /// the same clear, are skipped.
    pub fn copy_texture_region(
        &mut self,
        dst: &Texture,
        dst_at: Origin,
        src: &Texture,
        src_at: Origin,
        width: u32,
        height: u32,
    ) -> Result<(), Error> {
        dst.check_region(dst_at, width, height)?;
        src.check_region(src_at, width, height)?;
        if dst.format() != src.format() || dst.config().samples != src.config().samples {
            return Err(Error::InvalidRegion(format!(
                "copy from {:?} to {:?}",
                src.config(),
                dst.config(),
            )));
        }
        if dst.id() == src.id() {
            return Err(Error::Unsupported("copying a texture into itself"));
        }

        let fence = self.fences.current();
        let dst_full = dst.is_full_region(dst_at, width, height);

        match src.state() {
            TextureState::Cleared
                if dst.state() == TextureState::Cleared
                    && dst.clear_value() == src.clear_value() =>
            {
                return Ok(());
            }
            TextureState::Cleared => {
                let same_kind = (src.is_render_target() && dst.is_render_target())
                    || (src.is_depth_stencil() && dst.is_depth_stencil());
                if dst_full && dst_at.level == 0 && same_kind {
                    dst.adopt_clear(src);
                    if self.encoder.in_render_pass() && self.encoder.is_attached(dst) {
                        self.encoder.end_render_pass();
                    }
                    return Ok(());
                }

                self.encoder.commit_clear(src, fence);
            }
            TextureState::Invalidated => {
                tracing::debug!("Skipping copy from invalidated {:?}", src);
                return Ok(());
            }
            TextureState::Dirty => {}
        }

        if !dst_full {
            self.encoder.commit_clear(dst, fence);
        }

        src.set_use_fence(fence);
        dst.set_use_fence(fence);
        if self.encoder.active() != ActiveEncoder::InlineUpload {
            self.encoder.begin_inline_upload();
        }
        self.encoder.record(Command::CopyTexture {
            src: src.id(),
            src_x: src_at.x,
            src_y: src_at.y,
            src_layer: src_at.layer,
            src_level: src_at.level,
            dst: dst.id(),
            dst_x: dst_at.x,
            dst_y: dst_at.y,
            dst_layer: dst_at.layer,
            dst_level: dst_at.level,
            width,
            height,
        });
        dst.mark_dirty();
        self.stats.num_copies += 1;

        Ok(())
    }

    /// Requests that `texture` be filled with `color` before its next use.
    pub fn clear_render_target(&mut self, texture: &Texture, color: u32) {
        if !texture.is_render_target() {
            tracing::error!("Color clear of non-render-target {:?}", texture);
            return;
        }
        texture.mark_cleared(ClearValue::Color(color));
        self.end_pass_using(texture);
    }

    /// Requests that `texture` be filled with `depth` before its next use.
    pub fn clear_depth(&mut self, texture: &Texture, depth: f32) {
        if !texture.is_depth_stencil() {
            tracing::error!("Depth clear of non-depth texture {:?}", texture);
            return;
        }
        texture.mark_cleared(ClearValue::Depth(depth));
        self.end_pass_using(texture);
    }

    /// Declares the contents of `texture` undefined.
    pub fn invalidate_render_target(&mut self, texture: &Texture) {
        texture.mark_invalidated();
        self.end_pass_using(texture);
    }

    /// Ends the render pass if `texture` is one of its attachments, so the next pass picks up the
    /// texture's new state as a load operation.
    fn end_pass_using(&mut self, texture: &Texture) {
        if self.encoder.in_render_pass() && self.encoder.is_attached(texture) {
            self.encoder.end_render_pass();
        }
    }

    // State and draws.

    pub fn set_framebuffer(&mut self, framebuffer: Option<&Rc<Framebuffer>>) {
        self.encoder.set_framebuffer(framebuffer.cloned());
    }

    pub fn set_pipeline(&mut self, pipeline: &Rc<Pipeline>) {
        self.encoder.set_pipeline(pipeline);
    }

    pub fn set_texture_sampler(
        &mut self,
        slot: usize,
        texture: Option<&Rc<Texture>>,
        sampler: Option<&Rc<Sampler>>,
    ) {
        let fence = self.fences.current();
        self.encoder.set_texture_sampler(slot, texture, sampler, fence);
    }

    pub fn set_texture_buffer(&mut self, buffer: Option<&TextureBuffer>) {
        self.encoder.set_texture_buffer(buffer.map(|b| b.stream.buffer()));
    }

    /// Unbinds `texture` from every slot, so it can be released once the caller drops it.
    pub fn unbind_texture(&mut self, texture: &Texture) {
        self.encoder.unbind_texture(texture);
    }

    pub fn set_viewport(&mut self, rect: Rect) {
        self.encoder.set_viewport(rect);
    }

    pub fn set_scissor(&mut self, rect: Rect) {
        self.encoder.set_scissor(rect);
    }

    pub fn set_viewport_and_scissor(&mut self, rect: Rect) {
        self.set_viewport(rect);
        self.set_scissor(rect);
    }

    fn prepare_draw(&mut self) -> Result<(), Error> {
        if self.encoder.pipeline().is_none() {
            return Err(Error::NoPipeline);
        }
        if !self.encoder.in_render_pass() {
            self.encoder.begin_render_pass(self.fences.current())?;
            self.stats.num_render_passes += 1;
        }

        Ok(())
    }

    pub fn draw(&mut self, vertex_count: u32, base_vertex: u32) -> Result<(), Error> {
        self.prepare_draw()?;
        self.encoder.record(Command::Draw {
            vertex_count,
            base_vertex,
        });
        self.stats.num_draws += 1;

        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        base_index: u32,
        base_vertex: u32,
    ) -> Result<(), Error> {
        self.prepare_draw()?;
        self.encoder.record(Command::DrawIndexed {
            index_count,
            base_index,
            base_vertex,
        });
        self.stats.num_draws += 1;

        Ok(())
    }

    // Presentation.

    /// Starts rendering a frame to the surface.
    ///
    /// Returns `false` if the frame is skipped, there is no surface, or the next surface image
    /// can't be acquired; the caller should not draw to the surface or call
    /// [`end_present`](Self::end_present) in that case.
    pub fn begin_present(&mut self, skip: bool) -> bool {
        if skip || self.backend.surface_format().is_none() {
            return false;
        }
        if !self.backend.acquire_surface() {
            tracing::debug!("Couldn't acquire a surface image");
            return false;
        }

        self.encoder.set_surface_size(self.backend.surface_size());
        self.encoder.begin_present();
        if self.encoder.begin_render_pass(self.fences.current()).is_ok() {
            self.stats.num_render_passes += 1;
        }

        true
    }

    pub fn end_present(&mut self) {
        debug_assert!(self.encoder.is_presenting());
        self.encoder.end_present();
        self.encoder.record(Command::Present);
        self.submit_command_buffer(false);
    }

    /// Waits for the GPU to stop using the surface, then resizes it.
    pub fn resize_surface(&mut self, width: u32, height: u32) {
        self.wait_for_previous_command_buffers();
        self.backend.resize_surface(width, height);
        self.encoder.set_surface_size(self.backend.surface_size());
    }

    // Submission and object lifetime.

    /// Submits everything recorded so far, optionally waiting for it to complete.
    pub fn submit_command_buffer(&mut self, wait_for_completion: bool) {
        let cmdbuf = self.encoder.take_command_buffer();

        // Anything dropped so far may be used by this command buffer.
        self.collect_releases();

        let signal = self.fences.begin_submission();
        let fence = signal.fence();
        self.backend.submit(cmdbuf, signal);
        self.stats.num_submissions += 1;

        if wait_for_completion {
            self.wait_for_fence_counter(fence);
        } else {
            self.cleanup_objects();
        }
    }

    pub fn wait_for_fence_counter(&mut self, fence: u64) {
        let backend = &mut self.backend;
        self.fences.wait_for(fence, || backend.poll());
        self.cleanup_objects();
    }

    pub fn wait_for_previous_command_buffers(&mut self) {
        self.wait_for_fence_counter(self.fences.current() - 1);
    }

    /// Destroys every object whose fence has completed.
    pub fn cleanup_objects(&mut self) {
        self.backend.poll();
        self.collect_releases();

        let completed = self.fences.completed();
        while let Some(object) = self.releases.pop_completed(completed) {
            self.backend.release(object);
        }
    }

    /// Moves dropped objects into the release queue, guarded by the command buffer being built.
    fn collect_releases(&mut self) {
        let fence = self.fences.current();
        for object in self.release_rx.try_iter() {
            self.releases.push(fence, object);
        }
    }
}

/// The byte size of `count` elements of `stride` bytes.
fn stream_size(what: &str, stride: u32, count: u32) -> u32 {
    assert!(stride > 0, "zero-sized {what} elements");
    match stride.checked_mul(count) {
        Some(size) => size,
        None => panic!("{count} {what} elements of {stride} bytes overflow the stream"),
    }
}

/// Copies a committed range of a stream buffer to the GPU.
fn flush_stream(backend: &mut dyn Backend, sb: &StreamBuffer, range: Range<u32>) {
    if range.is_empty() {
        return;
    }

    // Buffer writes must be 4-byte aligned. The padding is rewritten with what it already holds.
    let start = align_down(range.start, 4);
    let end = align_up(range.end, 4).min(sb.size());
    backend.write_buffer(sb.buffer(), start, sb.host(start..end));
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        if !self.encoder.command_buffer().is_empty() {
            self.submit_command_buffer(false);
        }
        self.wait_for_previous_command_buffers();

        self.encoder.reset();
        self.mapped_texture = None;
        for sb in self.streams.all_mut() {
            let id = sb.handle_mut().forget();
            self.backend.release(id.into());
        }

        self.collect_releases();
        for object in self.releases.drain_all() {
            self.backend.release(object);
        }
        for (_, id) in self.depth_states.drain() {
            self.backend.release(id.into());
        }

        tracing::info!("Destroyed {} device", self.backend.kind());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::null::{CompletionMode, NullBackend, NullControl},
        shader::WgslPassthrough,
        texture::{TextureFormat, TextureType},
    };

    fn context() -> (GraphicsContext, NullControl) {
        let (backend, control) = NullBackend::new(Capabilities::default());
        let config = GpuConfig {
            vertex_buffer_size: 64 * 1024,
            index_buffer_size: 64 * 1024,
            uniform_buffer_size: 64 * 1024,
            texture_buffer_size: 256 * 1024,
            ..Default::default()
        };
        let ctx =
            GraphicsContext::new(Box::new(backend), config, Box::new(WgslPassthrough)).unwrap();

        (ctx, control)
    }

    fn target(ctx: &mut GraphicsContext) -> Rc<Texture> {
        ctx.create_texture(
            &TextureConfig::new(64, 64, TextureType::RenderTarget, TextureFormat::Rgba8),
            None,
        )
        .unwrap()
    }

    #[test]
    fn vertex_ring_submits_when_full() {
        let (mut ctx, control) = context();

        // 64 KiB holds three 20000-byte batches.
        let verts = vec![[0u8; 20]; 1000];
        assert_eq!(ctx.push_vertices(&verts), 0);
        assert_eq!(ctx.push_vertices(&verts), 1000);
        assert_eq!(ctx.push_vertices(&verts), 2000);
        assert!(control.submissions().is_empty());

        assert_eq!(ctx.push_vertices(&verts), 0);
        assert_eq!(control.submissions().len(), 1);
        assert_eq!(ctx.current_fence(), 2);
    }

    #[test]
    fn stream_data_reaches_the_buffer() {
        let (mut ctx, control) = context();
        ctx.push_indices(&[1, 2, 3]);
        let base = ctx.push_indices(&[4, 5]);
        assert_eq!(base, 3);

        let index_buffer = ctx.streams.index.buffer();
        assert_eq!(
            control.buffer_contents(index_buffer, 0, 10),
            vec![1, 0, 2, 0, 3, 0, 4, 0, 5, 0],
        );
    }

    #[test]
    fn uniforms_are_bound_at_aligned_offsets() {
        let (mut ctx, _control) = context();
        let rt = target(&mut ctx);
        let fb = ctx.create_framebuffer(Some(&rt), None).unwrap();
        ctx.set_framebuffer(Some(&fb));
        ctx.encoder.begin_render_pass(1).unwrap();

        ctx.push_uniforms(&[1.0f32; 4]);
        ctx.push_uniforms(&[2.0f32; 4]);

        let uniform = ctx.streams.uniform.buffer();
        let offsets: Vec<_> = ctx
            .command_buffer()
            .commands
            .iter()
            .filter_map(|cmd| match *cmd {
                Command::SetUniformBuffer { buffer, offset } if buffer == uniform => Some(offset),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![0, 0, 256]);
    }

    #[test]
    fn small_uploads_to_unused_textures_are_batched() {
        let (mut ctx, _control) = context();
        let texture = ctx
            .create_texture(
                &TextureConfig::new(16, 16, TextureType::Texture, TextureFormat::Rgba8),
                Some((&[0; 16 * 16 * 4], 64)),
            )
            .unwrap();

        ctx.update_texture(&texture, Origin::new(0, 0), 4, 4, &[7; 64], 16)
            .unwrap();
        assert_eq!(ctx.command_buffer().uploads.len(), 1);
        assert!(ctx.command_buffer().commands.is_empty());

        // Once the texture is in use, uploads stay ordered with the main list.
        ctx.set_texture_sampler(0, Some(&texture), None);
        ctx.update_texture(&texture, Origin::new(4, 4), 4, 4, &[7; 64], 16)
            .unwrap();
        assert_eq!(ctx.command_buffer().uploads.len(), 1);
        assert!(matches!(
            ctx.command_buffer().commands.last(),
            Some(Command::CopyBufferToTexture { pitch: 256, x: 4, y: 4, .. }),
        ));
        assert_eq!(ctx.active_encoder(), ActiveEncoder::InlineUpload);
    }

    #[test]
    fn large_uploads_use_a_staging_buffer() {
        let (mut ctx, control) = context();
        control.set_completion_mode(CompletionMode::Immediate);
        let texture = ctx
            .create_texture(
                &TextureConfig::new(256, 256, TextureType::Texture, TextureFormat::Rgba8),
                None,
            )
            .unwrap();
        let before = control.live_objects();

        // 256 KiB, the whole upload ring.
        let data = vec![0xAB; 256 * 256 * 4];
        ctx.update_texture(&texture, Origin::new(0, 0), 256, 256, &data, 1024)
            .unwrap();
        assert_eq!(control.live_objects(), before + 1);
        assert_eq!(ctx.streams.texture.current_offset(), 0);

        let staging = match ctx.command_buffer().uploads[0] {
            Command::CopyBufferToTexture { buffer, .. } => buffer,
            ref cmd => panic!("unexpected {cmd:?}"),
        };
        ctx.submit_command_buffer(true);
        assert!(!control.is_live(staging));
        assert!(control.violations().is_empty());
    }

    #[test]
    fn partial_update_of_cleared_texture_commits_clear_first() {
        let (mut ctx, _control) = context();
        let rt = target(&mut ctx);
        ctx.clear_render_target(&rt, 0xFF00_00FF);

        ctx.update_texture(&rt, Origin::new(8, 8), 2, 2, &[0; 16], 8)
            .unwrap();

        let cmds = &ctx.command_buffer().commands;
        assert_eq!(
            cmds[0],
            Command::ClearTexture {
                texture: rt.id(),
                value: ClearValue::Color(0xFF00_00FF),
            },
        );
        assert!(matches!(cmds[1], Command::CopyBufferToTexture { .. }));
        assert_eq!(rt.state(), TextureState::Dirty);
    }

    #[test]
    fn map_texture_round_trip() {
        let (mut ctx, control) = context();
        let texture = ctx
            .create_texture(
                &TextureConfig::new(32, 32, TextureType::Texture, TextureFormat::R8),
                None,
            )
            .unwrap();

        let (dst, pitch) = ctx.map_texture(&texture, 0, 0, 8, 2).unwrap();
        assert_eq!(pitch, 256);
        dst[..8].copy_from_slice(&[1; 8]);
        dst[256..264].copy_from_slice(&[2; 8]);
        assert!(ctx.map_texture(&texture, 0, 0, 1, 1).is_err());
        ctx.unmap_texture(&texture);

        let upload_buffer = ctx.streams.texture.buffer();
        assert_eq!(control.buffer_contents(upload_buffer, 256, 260), vec![2; 4]);
        assert_eq!(ctx.command_buffer().uploads.len(), 1);
        assert_eq!(ctx.statistics().num_uploads, 1);
    }

    #[test]
    fn copies_from_invalidated_textures_are_skipped() {
        let (mut ctx, _control) = context();
        let src = target(&mut ctx);
        let dst = target(&mut ctx);

        ctx.copy_texture_region(&dst, Origin::new(0, 0), &src, Origin::new(0, 0), 16, 16)
            .unwrap();
        assert!(ctx.command_buffer().is_empty());
        assert_eq!(ctx.statistics().num_copies, 0);
    }

    #[test]
    fn partial_copy_of_cleared_source_materializes_the_clear() {
        let (mut ctx, _control) = context();
        let src = target(&mut ctx);
        let dst = target(&mut ctx);
        ctx.clear_render_target(&src, 0x8080_8080);

        ctx.copy_texture_region(&dst, Origin::new(0, 0), &src, Origin::new(0, 0), 16, 16)
            .unwrap();

        let cmds = &ctx.command_buffer().commands;
        assert!(matches!(cmds[0], Command::ClearTexture { texture, .. } if texture == src.id()));
        assert!(matches!(cmds[1], Command::CopyTexture { .. }));
        assert_eq!(src.state(), TextureState::Dirty);
        assert_eq!(dst.state(), TextureState::Dirty);
        assert_eq!(ctx.statistics().num_copies, 1);
    }

    #[test]
    fn draw_requires_pipeline_and_target() {
        let (mut ctx, _control) = context();
        assert!(matches!(ctx.draw(3, 0), Err(Error::NoPipeline)));
    }

    #[test]
    fn begin_present_fails_without_image() {
        let (mut ctx, control) = context();
        assert!(!ctx.begin_present(true));

        control.set_acquire_fails(true);
        assert!(!ctx.begin_present(false));

        control.set_acquire_fails(false);
        control.set_surface(None);
        assert!(!ctx.begin_present(false));
        assert!(ctx.command_buffer().is_empty());
    }

    #[test]
    fn present_submits_the_frame() {
        let (mut ctx, control) = context();
        assert!(ctx.begin_present(false));
        assert!(ctx.encoder.in_render_pass());
        ctx.end_present();

        let frame = control.last_submission().unwrap();
        assert_eq!(frame.commands.last(), Some(&Command::Present));
        assert_eq!(ctx.statistics().num_render_passes, 1);
    }

    #[test]
    fn resize_waits_for_the_gpu() {
        let (mut ctx, control) = context();
        ctx.submit_command_buffer(false);
        ctx.submit_command_buffer(false);
        assert_eq!(control.in_flight(), 0);

        ctx.resize_surface(800, 600);
        assert_eq!(ctx.completed_fence(), 2);
        assert_eq!(ctx.encoder.target_size(), (800, 600));
    }

    #[test]
    fn unsupported_border_color_fails_sampler_creation() {
        let (mut ctx, _control) = context();
        let config = SamplerConfig {
            address_u: crate::sampler::AddressMode::ClampToBorder,
            border_color: 0xFF12_3456,
            ..SamplerConfig::POINT
        };
        assert!(matches!(
            ctx.create_sampler(&config),
            Err(Error::UnsupportedBorderColor(0xFF12_3456)),
        ));
    }

    #[test]
    fn texture_buffer_positions_advance() {
        let (mut ctx, control) = context();
        let mut tb = ctx
            .create_texture_buffer(TextureBufferFormat::R16U, 1024)
            .unwrap();

        ctx.map_texture_buffer(&mut tb, 3)
            .copy_from_slice(&[1, 0, 2, 0, 3, 0]);
        assert_eq!(ctx.unmap_texture_buffer(&mut tb, 3), 0);
        ctx.map_texture_buffer(&mut tb, 2).copy_from_slice(&[4, 0, 5, 0]);
        assert_eq!(ctx.unmap_texture_buffer(&mut tb, 2), 3);

        assert_eq!(
            control.buffer_contents(tb.stream.buffer(), 0, 12),
            vec![1, 0, 2, 0, 3, 0, 4, 0, 5, 0, 0, 0],
        );
    }
}
