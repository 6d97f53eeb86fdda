// SPDX-License-Identifier: MPL-2.0

//! Render pass and binding state.
//!
//! [`EncoderState`] caches everything the next draw depends on and records commands into the
//! command buffer being built. At most one encoding context is open at a time: a render pass, an
//! inline upload, or nothing. Outside a render pass, binding changes are only cached; a new render
//! pass binds the whole cached state. Inside one, only bindings that actually change are recorded.

use std::rc::Rc;

use crate::{
    backend::{BufferId, DepthStateId},
    cmd::{ColorAttachment, ColorTarget, Command, CommandBuffer, DepthAttachment, LoadOp, Rect},
    pipeline::{CullMode, Pipeline},
    sampler::Sampler,
    texture::{ClearValue, Framebuffer, Texture, TextureState},
    Error, MAX_TEXTURE_SAMPLERS,
};

/// The surface is cleared to opaque black at the start of each presented frame.
const SURFACE_CLEAR_COLOR: u32 = 0xFF00_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActiveEncoder {
    Idle,
    RenderPass,
    /// Transfers recorded into the main command list.
    InlineUpload,
}

/// The stream buffers every render pass binds.
#[derive(Clone, Copy, Debug)]
pub struct StreamBindings {
    pub vertex: BufferId,
    pub index: BufferId,
    pub uniform: BufferId,
}

#[derive(Debug)]
pub struct EncoderState {
    cmdbuf: CommandBuffer,
    active: ActiveEncoder,
    streams: StreamBindings,
    framebuffer: Option<Rc<Framebuffer>>,
    pipeline: Option<Rc<Pipeline>>,
    depth_state: Option<DepthStateId>,
    cull_mode: Option<CullMode>,
    viewport: Rect,
    scissor: Rect,
    textures: [Option<Rc<Texture>>; MAX_TEXTURE_SAMPLERS],
    samplers: [Option<Rc<Sampler>>; MAX_TEXTURE_SAMPLERS],
    texture_buffer: Option<BufferId>,
    uniform_offset: u32,
    surface_size: (u32, u32),
    presenting: bool,
    surface_cleared: bool,
}

impl EncoderState {
    pub fn new(streams: StreamBindings, surface_size: (u32, u32)) -> Self {
        Self {
            cmdbuf: CommandBuffer::default(),
            active: ActiveEncoder::Idle,
            streams,
            framebuffer: None,
            pipeline: None,
            depth_state: None,
            cull_mode: None,
            viewport: Rect::default(),
            scissor: Rect::default(),
            textures: Default::default(),
            samplers: Default::default(),
            texture_buffer: None,
            uniform_offset: 0,
            surface_size,
            presenting: false,
            surface_cleared: false,
        }
    }

    pub fn active(&self) -> ActiveEncoder {
        self.active
    }

    pub fn in_render_pass(&self) -> bool {
        self.active == ActiveEncoder::RenderPass
    }

    pub fn command_buffer(&self) -> &CommandBuffer {
        &self.cmdbuf
    }

    pub fn framebuffer(&self) -> Option<&Rc<Framebuffer>> {
        self.framebuffer.as_ref()
    }

    pub fn pipeline(&self) -> Option<&Rc<Pipeline>> {
        self.pipeline.as_ref()
    }

    pub fn is_presenting(&self) -> bool {
        self.presenting
    }

    pub(crate) fn set_surface_size(&mut self, size: (u32, u32)) {
        self.surface_size = size;
    }

    /// The size viewports and scissors are clamped to.
    pub fn target_size(&self) -> (u32, u32) {
        match &self.framebuffer {
            Some(fb) => (fb.width(), fb.height()),
            None => self.surface_size,
        }
    }

    pub fn record(&mut self, cmd: Command) {
        self.cmdbuf.commands.push(cmd);
    }

    /// Records into the list that runs before the main one.
    pub fn record_upload(&mut self, cmd: Command) {
        self.cmdbuf.uploads.push(cmd);
    }

    /// Ends any encoding context and hands over everything recorded so far.
    ///
    /// A submission in the middle of a presented frame keeps the surface contents, so the next
    /// pass on the surface loads them instead of clearing again.
    pub fn take_command_buffer(&mut self) -> CommandBuffer {
        self.end_any();
        if !self.presenting {
            self.surface_cleared = false;
        }

        std::mem::take(&mut self.cmdbuf)
    }

    pub fn end_render_pass(&mut self) {
        if self.active == ActiveEncoder::RenderPass {
            self.record(Command::EndRenderPass);
            self.active = ActiveEncoder::Idle;
        }
    }

    pub fn end_any(&mut self) {
        match self.active {
            ActiveEncoder::RenderPass => self.end_render_pass(),
            ActiveEncoder::InlineUpload => self.active = ActiveEncoder::Idle,
            ActiveEncoder::Idle => {}
        }
    }

    /// Opens an encoding context for transfers that must stay ordered with the main command list.
    pub fn begin_inline_upload(&mut self) {
        self.end_render_pass();
        self.active = ActiveEncoder::InlineUpload;
    }

    pub fn set_framebuffer(&mut self, fb: Option<Rc<Framebuffer>>) {
        let same = match (&self.framebuffer, &fb) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if same {
            return;
        }

        self.end_render_pass();
        self.framebuffer = fb;

        // The new attachments may not match the formats the pipeline was built for.
        self.pipeline = None;
        self.depth_state = None;
        self.cull_mode = None;
    }

    pub fn set_pipeline(&mut self, pipeline: &Rc<Pipeline>) {
        if self.pipeline.as_ref().map_or(false, |p| Rc::ptr_eq(p, pipeline)) {
            return;
        }
        self.pipeline = Some(Rc::clone(pipeline));

        if self.in_render_pass() {
            self.apply_pipeline();
        }
    }

    /// Records the bound pipeline and whichever of its fixed-function state differs from what is
    /// bound.
    fn apply_pipeline(&mut self) {
        let Some(pipeline) = self.pipeline.as_ref() else {
            return;
        };
        let (id, depth_state, cull_mode) =
            (pipeline.id(), pipeline.depth_state(), pipeline.cull_mode());

        self.record(Command::SetPipeline(id));
        if self.depth_state != Some(depth_state) {
            self.depth_state = Some(depth_state);
            self.record(Command::SetDepthState(depth_state));
        }
        if self.cull_mode != Some(cull_mode) {
            self.cull_mode = Some(cull_mode);
            self.record(Command::SetCullMode(cull_mode));
        }
    }

    /// Binds `texture` and `sampler` to `slot`, resolving any pending clear on the texture first.
    pub fn set_texture_sampler(
        &mut self,
        slot: usize,
        texture: Option<&Rc<Texture>>,
        sampler: Option<&Rc<Sampler>>,
        fence: u64,
    ) {
        assert!(slot < MAX_TEXTURE_SAMPLERS, "texture slot {slot} out of range");

        if let Some(texture) = texture {
            self.commit_clear(texture, fence);
            texture.set_use_fence(fence);
        }

        let texture_changed = match (&self.textures[slot], texture) {
            (Some(a), Some(b)) => !Rc::ptr_eq(a, b),
            (None, None) => false,
            _ => true,
        };
        if texture_changed {
            self.textures[slot] = texture.cloned();
            if self.in_render_pass() {
                self.record(Command::SetTexture {
                    slot: slot as u32,
                    texture: texture.map(|t| t.id()),
                });
            }
        }

        let sampler_changed = match (&self.samplers[slot], sampler) {
            (Some(a), Some(b)) => !Rc::ptr_eq(a, b),
            (None, None) => false,
            _ => true,
        };
        if sampler_changed {
            self.samplers[slot] = sampler.cloned();
            if self.in_render_pass() {
                self.record(Command::SetSampler {
                    slot: slot as u32,
                    sampler: sampler.map(|s| s.id()),
                });
            }
        }
    }

    pub fn set_texture_buffer(&mut self, buffer: Option<BufferId>) {
        if self.texture_buffer == buffer {
            return;
        }
        self.texture_buffer = buffer;

        if self.in_render_pass() {
            self.record(Command::SetTextureBuffer(buffer));
        }
    }

    /// Unbinds `texture` from every slot it is bound to.
    pub fn unbind_texture(&mut self, texture: &Texture) {
        let id = texture.id();
        for slot in 0..MAX_TEXTURE_SAMPLERS {
            if self.textures[slot].as_ref().map_or(false, |t| t.id() == id) {
                self.textures[slot] = None;
                if self.in_render_pass() {
                    self.record(Command::SetTexture {
                        slot: slot as u32,
                        texture: None,
                    });
                }
            }
        }
    }

    pub fn set_viewport(&mut self, rect: Rect) {
        self.viewport = rect;
        if self.in_render_pass() {
            let (w, h) = self.target_size();
            self.record(Command::SetViewport(rect.clamped(w, h)));
        }
    }

    pub fn set_scissor(&mut self, rect: Rect) {
        self.scissor = rect;
        if self.in_render_pass() {
            let (w, h) = self.target_size();
            self.record(Command::SetScissor(rect.clamped(w, h)));
        }
    }

    pub fn set_uniform_offset(&mut self, offset: u32) {
        self.uniform_offset = offset;
        if self.in_render_pass() {
            self.record(Command::SetUniformBuffer {
                buffer: self.streams.uniform,
                offset,
            });
        }
    }

    /// Whether `texture` is an attachment of the bound framebuffer.
    pub fn is_attached(&self, texture: &Texture) -> bool {
        self.framebuffer
            .as_ref()
            .map_or(false, |fb| fb.has_attachment(texture))
    }

    /// Makes a pending clear real.
    ///
    /// A cleared texture gets an explicit clear command, which ends any open render pass. An
    /// invalidated texture needs no GPU work, as whatever comes next overwrites undefined contents.
    pub fn commit_clear(&mut self, texture: &Texture, fence: u64) {
        match texture.state() {
            TextureState::Dirty => return,
            TextureState::Cleared => {
                self.end_any();
                self.record(Command::ClearTexture {
                    texture: texture.id(),
                    value: texture.clear_value(),
                });
                texture.set_use_fence(fence);
            }
            TextureState::Invalidated => {}
        }

        texture.mark_dirty();
    }

    pub(crate) fn begin_present(&mut self) {
        self.set_framebuffer(None);
        self.presenting = true;
        self.surface_cleared = false;
    }

    pub(crate) fn end_present(&mut self) {
        self.end_render_pass();
        self.presenting = false;
    }

    /// Opens a render pass on the bound framebuffer (or the surface, while presenting) and binds
    /// all cached state.
    ///
    /// Pending clears of the attachments become load operations. Pending clears of bound textures
    /// are resolved before the pass begins.
    pub fn begin_render_pass(&mut self, fence: u64) -> Result<(), Error> {
        if self.framebuffer.is_none() && !self.presenting {
            return Err(Error::NoRenderTarget);
        }

        self.end_any();

        for slot in 0..MAX_TEXTURE_SAMPLERS {
            if let Some(texture) = self.textures[slot].clone() {
                self.commit_clear(&texture, fence);
                texture.set_use_fence(fence);
            }
        }

        let (color, depth) = match &self.framebuffer {
            Some(fb) => {
                let color = fb.color().map(|t| ColorAttachment {
                    target: ColorTarget::Texture(t.id()),
                    load: match (t.state(), t.clear_value()) {
                        (TextureState::Cleared, ClearValue::Color(c)) => LoadOp::Clear(c),
                        (TextureState::Invalidated, _) => LoadOp::DontCare,
                        _ => LoadOp::Load,
                    },
                });
                let depth = fb.depth().map(|t| DepthAttachment {
                    texture: t.id(),
                    load: match (t.state(), t.clear_value()) {
                        (TextureState::Cleared, ClearValue::Depth(d)) => LoadOp::Clear(d),
                        (TextureState::Invalidated, _) => LoadOp::DontCare,
                        _ => LoadOp::Load,
                    },
                });
                for t in fb.color().into_iter().chain(fb.depth()) {
                    t.mark_dirty();
                    t.set_use_fence(fence);
                }

                (color, depth)
            }
            None => {
                let load = if self.surface_cleared {
                    LoadOp::Load
                } else {
                    LoadOp::Clear(SURFACE_CLEAR_COLOR)
                };
                self.surface_cleared = true;

                (
                    Some(ColorAttachment {
                        target: ColorTarget::Surface,
                        load,
                    }),
                    None,
                )
            }
        };

        self.record(Command::BeginRenderPass { color, depth });
        self.active = ActiveEncoder::RenderPass;
        self.bind_all();

        Ok(())
    }

    fn bind_all(&mut self) {
        let streams = self.streams;
        self.record(Command::SetUniformBuffer {
            buffer: streams.uniform,
            offset: self.uniform_offset,
        });
        self.record(Command::SetVertexBuffer {
            buffer: streams.vertex,
            offset: 0,
        });
        self.record(Command::SetIndexBuffer {
            buffer: streams.index,
            offset: 0,
        });

        // The pass starts with no fixed-function state bound.
        self.depth_state = None;
        self.cull_mode = None;
        self.apply_pipeline();

        for slot in 0..MAX_TEXTURE_SAMPLERS {
            if let Some(texture) = &self.textures[slot] {
                let cmd = Command::SetTexture {
                    slot: slot as u32,
                    texture: Some(texture.id()),
                };
                self.cmdbuf.commands.push(cmd);
            }
            if let Some(sampler) = &self.samplers[slot] {
                let cmd = Command::SetSampler {
                    slot: slot as u32,
                    sampler: Some(sampler.id()),
                };
                self.cmdbuf.commands.push(cmd);
            }
        }
        if self.texture_buffer.is_some() {
            self.record(Command::SetTextureBuffer(self.texture_buffer));
        }

        let (w, h) = self.target_size();
        self.record(Command::SetViewport(self.viewport.clamped(w, h)));
        self.record(Command::SetScissor(self.scissor.clamped(w, h)));
    }

    /// Drops every binding.
    pub fn reset(&mut self) {
        self.end_any();
        self.framebuffer = None;
        self.pipeline = None;
        self.depth_state = None;
        self.cull_mode = None;
        self.textures = Default::default();
        self.samplers = Default::default();
        self.texture_buffer = None;
        self.presenting = false;
        self.surface_cleared = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{PipelineId, SamplerId, TextureId},
        pipeline::PipelineLayout,
        release::Handle,
        sampler::SamplerConfig,
        texture::{TextureConfig, TextureFormat, TextureType},
    };

    struct Fixture {
        sink: crate::release::ReleaseSender,
        _rx: crate::release::ReleaseReceiver,
        next: u32,
    }

    impl Fixture {
        fn new() -> Self {
            let (sink, _rx) = crossbeam_channel::unbounded();
            Self { sink, _rx, next: 1 }
        }

        fn next(&mut self) -> u32 {
            self.next += 1;
            self.next
        }

        fn target(&mut self) -> Rc<Texture> {
            let id = TextureId(self.next());
            Rc::new(Texture::new(
                Handle::new(id, self.sink.clone()),
                TextureConfig::new(320, 240, TextureType::RenderTarget, TextureFormat::Rgba8),
                false,
            ))
        }

        fn pipeline(&mut self, depth_state: u32, cull_mode: CullMode) -> Rc<Pipeline> {
            let id = PipelineId(self.next());
            Rc::new(Pipeline::new(
                Handle::new(id, self.sink.clone()),
                PipelineLayout::SingleTextureAndUbo,
                DepthStateId(depth_state),
                cull_mode,
            ))
        }

        fn sampler(&mut self) -> Rc<Sampler> {
            let id = SamplerId(self.next());
            Rc::new(Sampler::new(Handle::new(id, self.sink.clone()), SamplerConfig::POINT))
        }
    }

    fn encoder() -> EncoderState {
        EncoderState::new(
            StreamBindings {
                vertex: BufferId(100),
                index: BufferId(101),
                uniform: BufferId(102),
            },
            (640, 480),
        )
    }

    #[test]
    fn no_pass_without_a_target() {
        let mut enc = encoder();
        assert!(matches!(enc.begin_render_pass(1), Err(Error::NoRenderTarget)));
        assert_eq!(enc.active(), ActiveEncoder::Idle);
    }

    #[test]
    fn load_ops_follow_texture_state() {
        let mut fx = Fixture::new();
        let mut enc = encoder();

        let rt = fx.target();
        rt.mark_cleared(ClearValue::Color(0xFF00_FF00));
        let fb = Rc::new(Framebuffer::new(Some(Rc::clone(&rt)), None).unwrap());
        enc.set_framebuffer(Some(Rc::clone(&fb)));

        enc.begin_render_pass(3).unwrap();
        assert_eq!(
            enc.command_buffer().commands[0],
            Command::BeginRenderPass {
                color: Some(ColorAttachment {
                    target: ColorTarget::Texture(rt.id()),
                    load: LoadOp::Clear(0xFF00_FF00),
                }),
                depth: None,
            },
        );
        assert_eq!(rt.state(), TextureState::Dirty);
        assert_eq!(rt.use_fence(), 3);

        enc.end_render_pass();
        enc.begin_render_pass(3).unwrap();
        let begins: Vec<_> = enc
            .command_buffer()
            .commands
            .iter()
            .filter_map(|cmd| match cmd {
                Command::BeginRenderPass { color, .. } => color.map(|c| c.load),
                _ => None,
            })
            .collect();
        assert_eq!(begins, vec![LoadOp::Clear(0xFF00_FF00), LoadOp::Load]);

        let other = fx.target();
        let fb2 = Rc::new(Framebuffer::new(Some(other), None).unwrap());
        enc.set_framebuffer(Some(fb2));
        enc.begin_render_pass(3).unwrap();
        let last_begin = enc
            .command_buffer()
            .commands
            .iter()
            .rev()
            .find(|c| matches!(c, Command::BeginRenderPass { .. }));
        assert!(matches!(
            last_begin,
            Some(Command::BeginRenderPass {
                color: Some(ColorAttachment {
                    load: LoadOp::DontCare,
                    ..
                }),
                ..
            }),
        ));
    }

    #[test]
    fn framebuffer_change_ends_pass_and_unbinds_pipeline() {
        let mut fx = Fixture::new();
        let mut enc = encoder();

        let fb = Rc::new(Framebuffer::new(Some(fx.target()), None).unwrap());
        enc.set_framebuffer(Some(Rc::clone(&fb)));
        enc.set_pipeline(&fx.pipeline(1, CullMode::None));
        enc.begin_render_pass(1).unwrap();

        // Rebinding the same framebuffer is a no-op.
        enc.set_framebuffer(Some(Rc::clone(&fb)));
        assert!(enc.in_render_pass());

        let fb2 = Rc::new(Framebuffer::new(Some(fx.target()), None).unwrap());
        enc.set_framebuffer(Some(fb2));
        assert!(!enc.in_render_pass());
        assert!(enc.pipeline().is_none());
        assert_eq!(enc.command_buffer().commands.last(), Some(&Command::EndRenderPass));
    }

    #[test]
    fn pipeline_change_mid_pass_rebinds_only_differences() {
        let mut fx = Fixture::new();
        let mut enc = encoder();

        let fb = Rc::new(Framebuffer::new(Some(fx.target()), None).unwrap());
        let texture = fx.target();
        texture.mark_dirty();
        let sampler = fx.sampler();
        enc.set_framebuffer(Some(fb));
        enc.set_pipeline(&fx.pipeline(1, CullMode::Back));
        enc.set_texture_sampler(0, Some(&texture), Some(&sampler), 1);
        enc.begin_render_pass(1).unwrap();

        let before = enc.command_buffer().commands.len();
        let second = fx.pipeline(2, CullMode::Back);
        enc.set_pipeline(&second);

        let new = &enc.command_buffer().commands[before..];
        assert_eq!(
            new,
            &[
                Command::SetPipeline(second.id()),
                Command::SetDepthState(DepthStateId(2)),
            ],
        );

        // Binding the same pipeline again records nothing.
        enc.set_pipeline(&second);
        assert_eq!(enc.command_buffer().commands.len(), before + 2);
    }

    #[test]
    fn binding_a_cleared_texture_commits_the_clear() {
        let mut fx = Fixture::new();
        let mut enc = encoder();

        let fb = Rc::new(Framebuffer::new(Some(fx.target()), None).unwrap());
        enc.set_framebuffer(Some(fb));
        enc.begin_render_pass(5).unwrap();

        let texture = fx.target();
        texture.mark_cleared(ClearValue::Color(0x1234_5678));
        enc.set_texture_sampler(1, Some(&texture), None, 5);

        assert!(!enc.in_render_pass());
        assert_eq!(texture.state(), TextureState::Dirty);
        assert_eq!(texture.use_fence(), 5);
        let cmds = &enc.command_buffer().commands;
        assert_eq!(
            &cmds[(cmds.len() - 2)..],
            &[
                Command::EndRenderPass,
                Command::ClearTexture {
                    texture: texture.id(),
                    value: ClearValue::Color(0x1234_5678),
                },
            ],
        );

        // An invalidated texture needs no clear.
        let invalid = fx.target();
        let len = enc.command_buffer().commands.len();
        enc.set_texture_sampler(2, Some(&invalid), None, 5);
        assert_eq!(enc.command_buffer().commands.len(), len);
        assert_eq!(invalid.state(), TextureState::Dirty);
    }

    #[test]
    fn viewport_is_clamped_to_target() {
        let mut fx = Fixture::new();
        let mut enc = encoder();

        let fb = Rc::new(Framebuffer::new(Some(fx.target()), None).unwrap());
        enc.set_framebuffer(Some(fb));
        enc.set_viewport(Rect::new(-5, -5, 1000, 1000));
        enc.begin_render_pass(1).unwrap();

        assert!(enc
            .command_buffer()
            .commands
            .contains(&Command::SetViewport(Rect::new(0, 0, 320, 240))));

        enc.set_scissor(Rect::new(10, 10, 400, 20));
        assert_eq!(
            enc.command_buffer().commands.last(),
            Some(&Command::SetScissor(Rect::new(10, 10, 320, 20))),
        );
    }

    #[test]
    fn present_clears_surface_once_per_command_buffer() {
        let mut enc = encoder();
        enc.begin_present();
        enc.begin_render_pass(1).unwrap();
        enc.end_render_pass();
        enc.begin_render_pass(1).unwrap();
        enc.end_present();

        let loads: Vec<_> = enc
            .command_buffer()
            .commands
            .iter()
            .filter_map(|cmd| match cmd {
                Command::BeginRenderPass { color: Some(c), .. } => Some((c.target, c.load)),
                _ => None,
            })
            .collect();
        assert_eq!(
            loads,
            vec![
                (ColorTarget::Surface, LoadOp::Clear(SURFACE_CLEAR_COLOR)),
                (ColorTarget::Surface, LoadOp::Load),
            ],
        );

        let cmdbuf = enc.take_command_buffer();
        assert_eq!(cmdbuf.commands.last(), Some(&Command::EndRenderPass));
        assert!(enc.command_buffer().is_empty());
    }

    #[test]
    fn submitting_mid_frame_keeps_the_surface() {
        let mut enc = encoder();
        enc.begin_present();
        enc.begin_render_pass(1).unwrap();
        let first = enc.take_command_buffer();
        assert!(first.commands.contains(&Command::EndRenderPass));

        enc.begin_render_pass(2).unwrap();
        let loads: Vec<_> = enc
            .command_buffer()
            .commands
            .iter()
            .filter_map(|cmd| match cmd {
                Command::BeginRenderPass { color: Some(c), .. } => Some(c.load),
                _ => None,
            })
            .collect();
        assert_eq!(loads, vec![LoadOp::Load]);

        // The next frame clears again.
        enc.end_present();
        enc.take_command_buffer();
        enc.begin_present();
        enc.begin_render_pass(3).unwrap();
        assert!(enc.command_buffer().commands.iter().any(|cmd| matches!(
            cmd,
            Command::BeginRenderPass { color: Some(c), .. }
                if c.load == LoadOp::Clear(SURFACE_CLEAR_COLOR)
        )));
    }

    #[test]
    fn inline_upload_and_pass_are_exclusive() {
        let mut fx = Fixture::new();
        let mut enc = encoder();

        let fb = Rc::new(Framebuffer::new(Some(fx.target()), None).unwrap());
        enc.set_framebuffer(Some(fb));
        enc.begin_render_pass(1).unwrap();

        enc.begin_inline_upload();
        assert_eq!(enc.active(), ActiveEncoder::InlineUpload);
        assert_eq!(enc.command_buffer().commands.last(), Some(&Command::EndRenderPass));

        enc.begin_render_pass(1).unwrap();
        assert_eq!(enc.active(), ActiveEncoder::RenderPass);
        enc.take_command_buffer();
        assert_eq!(enc.active(), ActiveEncoder::Idle);
    }
}
