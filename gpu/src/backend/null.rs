// SPDX-License-Identifier: MPL-2.0

//! A backend that draws nothing.
//!
//! [`NullBackend`] keeps track of the objects it is asked to create, remembers every command
//! buffer submitted to it, and completes them when told to. A [`NullControl`] shared with the
//! backend inspects that record and drives completion from the outside, which makes the backend
//! useful for headless runs and for exercising fence and release ordering.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use super::{
    Backend, BackendKind, BufferId, BufferUsage, Capabilities, DepthStateId, PipelineId,
    SamplerId, ShaderId, TextureId,
};
use crate::{
    cmd::{ColorTarget, Command, CommandBuffer},
    fence::CompletionSignal,
    pipeline::{DepthState, PipelineConfig},
    release::Release,
    sampler::SamplerConfig,
    shader::ShaderStage,
    texture::{TextureConfig, TextureFormat},
    Error,
};

/// When submitted command buffers complete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompletionMode {
    /// During [`Backend::submit`].
    Immediate,
    /// During the next [`Backend::poll`].
    #[default]
    OnPoll,
    /// Only through [`NullControl`].
    ///
    /// Anything that waits for a fence blocks until another thread completes it, including
    /// dropping the context. Switch back to another mode first.
    Manual,
}

struct InFlight {
    objects: HashSet<Release>,
    signal: CompletionSignal,
}

#[derive(Default)]
struct State {
    mode: CompletionMode,
    in_flight: VecDeque<InFlight>,
    submissions: Vec<CommandBuffer>,
    live: HashSet<Release>,
    released: Vec<Release>,
    /// Objects released while an incomplete command buffer still used them.
    violations: Vec<Release>,
    buffers: HashMap<BufferId, Vec<u8>>,
    textures: HashMap<TextureId, TextureConfig>,
    surface: Option<(u32, u32)>,
    acquire_fails: bool,
    pipeline_error: Option<String>,
    next_id: u32,
}

impl State {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn complete_front(&mut self) -> bool {
        match self.in_flight.pop_front() {
            Some(cb) => {
                cb.signal.signal();
                true
            }
            None => false,
        }
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The objects a command buffer refers to.
fn referenced_objects(cmdbuf: &CommandBuffer) -> HashSet<Release> {
    let mut objects = HashSet::new();
    for cmd in cmdbuf.iter() {
        match *cmd {
            Command::BeginRenderPass { color, depth } => {
                if let Some(ColorTarget::Texture(t)) = color.map(|c| c.target) {
                    objects.insert(t.into());
                }
                if let Some(d) = depth {
                    objects.insert(d.texture.into());
                }
            }
            Command::SetPipeline(p) => {
                objects.insert(p.into());
            }
            Command::SetDepthState(d) => {
                objects.insert(d.into());
            }
            Command::SetUniformBuffer { buffer, .. }
            | Command::SetVertexBuffer { buffer, .. }
            | Command::SetIndexBuffer { buffer, .. }
            | Command::SetTextureBuffer(Some(buffer)) => {
                objects.insert(buffer.into());
            }
            Command::SetTexture {
                texture: Some(t), ..
            }
            | Command::ClearTexture { texture: t, .. } => {
                objects.insert(t.into());
            }
            Command::SetSampler {
                sampler: Some(s), ..
            } => {
                objects.insert(s.into());
            }
            Command::CopyTexture { src, dst, .. } => {
                objects.insert(src.into());
                objects.insert(dst.into());
            }
            Command::CopyBufferToTexture {
                buffer, texture, ..
            } => {
                objects.insert(buffer.into());
                objects.insert(texture.into());
            }
            _ => {}
        }
    }

    objects
}

/// Inspects and drives a [`NullBackend`].
#[derive(Clone)]
pub struct NullControl(Arc<Mutex<State>>);

impl NullControl {
    pub fn set_completion_mode(&self, mode: CompletionMode) {
        lock(&self.0).mode = mode;
    }

    /// Completes the oldest incomplete command buffer. Returns `false` if there was none.
    pub fn complete_next(&self) -> bool {
        lock(&self.0).complete_front()
    }

    /// Completes the incomplete command buffer with fence value `fence`, out of order.
    pub fn complete(&self, fence: u64) -> bool {
        let mut state = lock(&self.0);
        match state.in_flight.iter().position(|cb| cb.signal.fence() == fence) {
            Some(i) => {
                if let Some(cb) = state.in_flight.remove(i) {
                    cb.signal.signal();
                }
                true
            }
            None => false,
        }
    }

    pub fn complete_all(&self) {
        let mut state = lock(&self.0);
        while state.complete_front() {}
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.0).in_flight.len()
    }

    pub fn submissions(&self) -> Vec<CommandBuffer> {
        lock(&self.0).submissions.clone()
    }

    pub fn last_submission(&self) -> Option<CommandBuffer> {
        lock(&self.0).submissions.last().cloned()
    }

    pub fn released(&self) -> Vec<Release> {
        lock(&self.0).released.clone()
    }

    pub fn violations(&self) -> Vec<Release> {
        lock(&self.0).violations.clone()
    }

    pub fn live_objects(&self) -> usize {
        lock(&self.0).live.len()
    }

    pub fn is_live(&self, object: impl Into<Release>) -> bool {
        lock(&self.0).live.contains(&object.into())
    }

    /// The bytes last written to `buffer` in `start..end`.
    pub fn buffer_contents(&self, buffer: BufferId, start: u32, end: u32) -> Vec<u8> {
        lock(&self.0)
            .buffers
            .get(&buffer)
            .and_then(|data| data.get((start as usize)..(end as usize)))
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    pub fn set_surface(&self, size: Option<(u32, u32)>) {
        lock(&self.0).surface = size;
    }

    pub fn set_acquire_fails(&self, fails: bool) {
        lock(&self.0).acquire_fails = fails;
    }

    /// Makes the next pipeline creation fail with `diagnostic`.
    pub fn fail_next_pipeline(&self, diagnostic: &str) {
        lock(&self.0).pipeline_error = Some(diagnostic.to_string());
    }
}

pub struct NullBackend {
    state: Arc<Mutex<State>>,
    caps: Capabilities,
}

impl NullBackend {
    pub fn new(caps: Capabilities) -> (Self, NullControl) {
        let state = Arc::new(Mutex::new(State {
            surface: Some((640, 480)),
            ..Default::default()
        }));

        (
            Self {
                state: Arc::clone(&state),
                caps,
            },
            NullControl(state),
        )
    }

    fn create(&mut self, make: impl FnOnce(u32) -> Release) -> u32 {
        let mut state = lock(&self.state);
        let id = state.next_id();
        state.live.insert(make(id));

        id
    }
}

impl Backend for NullBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Null
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn create_buffer(
        &mut self,
        _: BufferUsage,
        size: u32,
        label: &str,
    ) -> Result<BufferId, Error> {
        if size == 0 {
            return Err(Error::Backend(format!("{label}: zero-sized buffer")));
        }

        let id = BufferId(self.create(|id| BufferId(id).into()));
        lock(&self.state).buffers.insert(id, vec![0; size as usize]);

        Ok(id)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u32, data: &[u8]) {
        let mut state = lock(&self.state);
        let Some(contents) = state.buffers.get_mut(&buffer) else {
            tracing::error!("Write to unknown {:?}", buffer);
            return;
        };

        let start = offset as usize;
        let end = start + data.len();
        if offset % 4 != 0 || data.len() % 4 != 0 || end > contents.len() {
            tracing::error!(
                "Misaligned or out-of-bounds write of {} bytes at {} to {:?}",
                data.len(),
                offset,
                buffer,
            );
            return;
        }

        contents[start..end].copy_from_slice(data);
    }

    fn create_texture(
        &mut self,
        config: &TextureConfig,
        data: Option<(&[u8], u32)>,
    ) -> Result<TextureId, Error> {
        config.validate(&self.caps)?;
        if let Some((data, pitch)) = data {
            let row = config.width * config.format.pixel_size();
            let needed = (pitch as usize) * (config.height as usize - 1) + row as usize;
            if pitch < row || data.len() < needed {
                return Err(Error::Backend(format!(
                    "{} bytes of initial data with pitch {} for {:?}",
                    data.len(),
                    pitch,
                    config,
                )));
            }
        }

        let id = TextureId(self.create(|id| TextureId(id).into()));
        lock(&self.state).textures.insert(id, *config);

        Ok(id)
    }

    fn create_sampler(&mut self, config: &SamplerConfig) -> Result<SamplerId, Error> {
        config.border()?;

        Ok(SamplerId(self.create(|id| SamplerId(id).into())))
    }

    fn create_shader(
        &mut self,
        _: ShaderStage,
        code: &[u8],
        entry_point: &str,
    ) -> Result<ShaderId, Error> {
        if code.is_empty() || entry_point.is_empty() {
            return Err(Error::Backend("empty shader".into()));
        }

        Ok(ShaderId(self.create(|id| ShaderId(id).into())))
    }

    fn create_depth_state(&mut self, _: DepthState) -> Result<DepthStateId, Error> {
        Ok(DepthStateId(self.create(|id| DepthStateId(id).into())))
    }

    fn create_pipeline(&mut self, config: &PipelineConfig) -> Result<PipelineId, Error> {
        if let Some(diagnostic) = lock(&self.state).pipeline_error.take() {
            return Err(Error::Backend(diagnostic));
        }

        let shaders_live = {
            let state = lock(&self.state);
            state.live.contains(&config.vertex_shader.id().into())
                && state.live.contains(&config.fragment_shader.id().into())
        };
        if !shaders_live {
            return Err(Error::Backend("pipeline uses a released shader".into()));
        }

        Ok(PipelineId(self.create(|id| PipelineId(id).into())))
    }

    fn release(&mut self, object: Release) {
        let mut state = lock(&self.state);
        if state.in_flight.iter().any(|cb| cb.objects.contains(&object)) {
            tracing::error!("{:?} released while in use", object);
            state.violations.push(object);
        }
        if !state.live.remove(&object) {
            tracing::warn!("Releasing unknown {:?}", object);
        }
        if let Release::Buffer(id) = object {
            state.buffers.remove(&id);
        }
        if let Release::Texture(id) = object {
            state.textures.remove(&id);
        }
        state.released.push(object);
    }

    fn submit(&mut self, cmdbuf: CommandBuffer, signal: CompletionSignal) {
        let mut state = lock(&self.state);

        let objects = referenced_objects(&cmdbuf);
        for object in &objects {
            if !state.live.contains(object) {
                tracing::error!("Command buffer {} uses dead {:?}", signal.fence(), object);
                state.violations.push(*object);
            }
        }
        state.submissions.push(cmdbuf);

        if state.mode == CompletionMode::Immediate {
            signal.signal();
        } else {
            state.in_flight.push_back(InFlight { objects, signal });
        }
    }

    fn poll(&mut self) {
        let mut state = lock(&self.state);
        if state.mode == CompletionMode::OnPoll {
            while state.complete_front() {}
        }
    }

    fn acquire_surface(&mut self) -> bool {
        let state = lock(&self.state);

        !state.acquire_fails && state.surface.map_or(false, |(w, h)| w > 0 && h > 0)
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        let mut state = lock(&self.state);
        if state.surface.is_some() {
            state.surface = Some((width, height));
        }
    }

    fn surface_size(&self) -> (u32, u32) {
        lock(&self.state).surface.unwrap_or((0, 0))
    }

    fn surface_format(&self) -> Option<TextureFormat> {
        lock(&self.state).surface.map(|_| TextureFormat::Bgra8)
    }
}

impl Drop for NullBackend {
    fn drop(&mut self) {
        let state = lock(&self.state);
        if !state.live.is_empty() {
            tracing::warn!("{} objects still live at backend teardown", state.live.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::FenceTracker;

    #[test]
    fn completion_modes() {
        let (mut backend, control) = NullBackend::new(Capabilities::default());
        let mut fences = FenceTracker::new();

        backend.submit(CommandBuffer::default(), fences.begin_submission());
        assert_eq!(fences.completed(), 0);
        backend.poll();
        assert_eq!(fences.completed(), 1);

        control.set_completion_mode(CompletionMode::Manual);
        backend.submit(CommandBuffer::default(), fences.begin_submission());
        backend.submit(CommandBuffer::default(), fences.begin_submission());
        backend.poll();
        assert_eq!(control.in_flight(), 2);

        assert!(control.complete(3));
        assert_eq!(fences.completed(), 3);
        assert!(control.complete_next());
        assert_eq!(fences.completed(), 3);
        assert!(!control.complete_next());

        control.set_completion_mode(CompletionMode::Immediate);
        backend.submit(CommandBuffer::default(), fences.begin_submission());
        assert_eq!(fences.completed(), 4);
        assert_eq!(control.submissions().len(), 4);
    }

    #[test]
    fn releasing_an_object_in_flight_is_a_violation() {
        let (mut backend, control) = NullBackend::new(Capabilities::default());
        let mut fences = FenceTracker::new();
        control.set_completion_mode(CompletionMode::Manual);

        let buffer = backend.create_buffer(BufferUsage::VERTEX, 64, "test").unwrap();
        let cmdbuf = CommandBuffer {
            uploads: vec![],
            commands: vec![Command::SetVertexBuffer { buffer, offset: 0 }],
        };
        backend.submit(cmdbuf, fences.begin_submission());

        backend.release(buffer.into());
        assert_eq!(control.violations(), vec![Release::Buffer(buffer)]);
        assert!(!control.is_live(buffer));
        control.complete_all();
    }

    #[test]
    fn writes_must_be_aligned() {
        let (mut backend, control) = NullBackend::new(Capabilities::default());
        let buffer = backend.create_buffer(BufferUsage::UNIFORM, 16, "test").unwrap();

        backend.write_buffer(buffer, 4, &[1, 2, 3, 4]);
        backend.write_buffer(buffer, 2, &[9, 9, 9, 9]);
        backend.write_buffer(buffer, 12, &[9; 8]);

        assert_eq!(
            control.buffer_contents(buffer, 0, 16),
            vec![0, 0, 0, 0, 1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0, 0],
        );
    }
}
