// SPDX-License-Identifier: MPL-2.0

//! The interface every rendering API implements.
//!
//! A [`Backend`] owns native GPU objects and names them with small integer IDs. It never decides
//! when an object may be destroyed; [`GraphicsContext`](crate::GraphicsContext) only calls
//! [`Backend::release`] once the fence guarding the object has completed.

pub mod null;
pub mod wgpu;

use std::{collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    cmd::CommandBuffer,
    fence::CompletionSignal,
    pipeline::{DepthState, PipelineConfig},
    release::Release,
    sampler::SamplerConfig,
    shader::ShaderStage,
    texture::{TextureConfig, TextureFormat},
    Error,
};

macro_rules! def_ids {
    ($($name:ident),* $(,)?) => {
        $(
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub(crate) u32);

            impl $name {
                pub fn raw(self) -> u32 {
                    self.0
                }
            }
        )*
    };
}

def_ids!(BufferId, TextureId, SamplerId, ShaderId, PipelineId, DepthStateId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Null,
    Vulkan,
    Metal,
    #[serde(rename = "d3d12")]
    Direct3D12,
    #[serde(rename = "opengl")]
    OpenGl,
}

impl BackendKind {
    pub const ALL: [Self; 5] = [
        Self::Vulkan,
        Self::Metal,
        Self::Direct3D12,
        Self::OpenGl,
        Self::Null,
    ];
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Null => "Null",
            Self::Vulkan => "Vulkan",
            Self::Metal => "Metal",
            Self::Direct3D12 => "D3D12",
            Self::OpenGl => "OpenGL",
        })
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "null" | "none" => Ok(Self::Null),
            "vulkan" | "vk" => Ok(Self::Vulkan),
            "metal" | "mtl" => Ok(Self::Metal),
            "d3d12" | "dx12" | "direct3d12" => Ok(Self::Direct3D12),
            "opengl" | "gl" => Ok(Self::OpenGl),
            _ => Err(format!("unknown backend '{s}'")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub max_texture_size: u32,
    pub max_multisamples: u32,
    /// Required alignment of uniform buffer binding offsets.
    pub uniform_buffer_alignment: u32,
    /// Required alignment of the row pitch of buffer-to-texture copies.
    pub texture_upload_pitch_alignment: u32,
    /// Required alignment of the source offset of buffer-to-texture copies.
    pub texture_upload_alignment: u32,
    pub supports_border_color: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_texture_size: 8192,
            max_multisamples: 4,
            uniform_buffer_alignment: 256,
            texture_upload_pitch_alignment: 256,
            texture_upload_alignment: 16,
            supports_border_color: true,
        }
    }
}

bitflags::bitflags! {
    pub struct BufferUsage: u8 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const COPY_SRC = 1 << 4;
    }
}

pub trait Backend {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> Capabilities;

    fn create_buffer(&mut self, usage: BufferUsage, size: u32, label: &str)
        -> Result<BufferId, Error>;

    /// Copies `data` into the buffer at `offset`. The write is ordered before any command buffer
    /// submitted afterwards.
    fn write_buffer(&mut self, buffer: BufferId, offset: u32, data: &[u8]);

    /// Creates a texture, optionally filled with tightly-packed `data` for level 0 of layer 0.
    fn create_texture(
        &mut self,
        config: &TextureConfig,
        data: Option<(&[u8], u32)>,
    ) -> Result<TextureId, Error>;

    fn create_sampler(&mut self, config: &SamplerConfig) -> Result<SamplerId, Error>;

    fn create_shader(
        &mut self,
        stage: ShaderStage,
        code: &[u8],
        entry_point: &str,
    ) -> Result<ShaderId, Error>;

    fn create_depth_state(&mut self, state: DepthState) -> Result<DepthStateId, Error>;

    fn create_pipeline(&mut self, config: &PipelineConfig) -> Result<PipelineId, Error>;

    /// Destroys an object. No command buffer that references it is still executing.
    fn release(&mut self, object: Release);

    /// Executes `cmdbuf`. `signal` must eventually be signalled, from any thread, once the GPU has
    /// finished with it, even if execution failed.
    fn submit(&mut self, cmdbuf: CommandBuffer, signal: CompletionSignal);

    /// Gives the backend a chance to deliver completion signals.
    fn poll(&mut self);

    /// Acquires the next surface image to present into. Returns `false` if there is no surface or
    /// the image can't be acquired right now.
    fn acquire_surface(&mut self) -> bool;

    fn resize_surface(&mut self, width: u32, height: u32);

    fn surface_size(&self) -> (u32, u32);

    fn surface_format(&self) -> Option<TextureFormat>;
}

/// Storage for backend objects keyed by their ID.
pub(crate) struct Registry<T> {
    label: &'static str,
    next: u32,
    items: HashMap<u32, T>,
}

impl<T> Registry<T> {
    pub(crate) fn new(label: &'static str) -> Self {
        Self {
            label,
            next: 1,
            items: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, item: T) -> u32 {
        let id = self.next;
        self.next += 1;
        self.items.insert(id, item);

        id
    }

    pub(crate) fn get(&self, id: u32) -> Option<&T> {
        let item = self.items.get(&id);
        if item.is_none() {
            tracing::error!("Unknown {} {}", self.label, id);
        }

        item
    }

    pub(crate) fn remove(&mut self, id: u32) -> Option<T> {
        let item = self.items.remove(&id);
        if item.is_none() {
            tracing::warn!("Releasing unknown {} {}", self.label, id);
        }

        item
    }
}
