// SPDX-License-Identifier: MPL-2.0

//! Umbra's GPU device layer.
//!
//! Everything the emulator draws goes through a [`GraphicsContext`], which records commands into
//! a [`CommandBuffer`](cmd::CommandBuffer) and hands finished buffers to a [`Backend`]. Transient
//! vertex, index, uniform, and texture data is streamed through fixed-size ring buffers, and GPU
//! objects are only destroyed once the command buffers that might reference them have completed.

pub mod backend;
pub mod cmd;
pub mod config;
pub mod context;
pub mod encoder;
pub mod fence;
pub mod pipeline;
pub mod release;
pub mod sampler;
pub mod shader;
pub mod stats;
pub mod stream;
pub mod texture;

use std::fmt;

pub use backend::{Backend, BackendKind, Capabilities};
pub use config::GpuConfig;
pub use context::GraphicsContext;
pub use stats::Statistics;

/// The number of texture/sampler slots a pipeline may use.
pub const MAX_TEXTURE_SAMPLERS: usize = 8;

/// The largest uniform block a single draw may see.
pub const MAX_UNIFORM_BUFFER_SIZE: u32 = 256;

#[derive(Debug)]
pub enum Error {
    NoCompatibleAdapterFound,
    NoCompatibleDeviceFound(String),
    NoCompatibleSurfaceFormat,
    Unsupported(&'static str),
    UnsupportedFormat(texture::TextureFormat),
    UnsupportedBorderColor(u32),
    InvalidTextureConfig(String),
    InvalidRegion(String),
    InvalidFramebuffer(String),
    InvalidPipelineConfig(String),
    ShaderCompilation(String),
    MissingEntryPoint(String),
    NoPipeline,
    NoRenderTarget,
    Backend(String),
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCompatibleAdapterFound => write!(f, "no compatible adapter found"),
            Self::NoCompatibleDeviceFound(e) => write!(f, "no compatible device found: {e}"),
            Self::NoCompatibleSurfaceFormat => write!(f, "surface has no usable format"),
            Self::Unsupported(what) => write!(f, "unsupported: {what}"),
            Self::UnsupportedFormat(format) => write!(f, "unsupported texture format {format:?}"),
            Self::UnsupportedBorderColor(color) => {
                write!(f, "unsupported border color: {color:08X}")
            }
            Self::InvalidTextureConfig(e) => write!(f, "invalid texture configuration: {e}"),
            Self::InvalidRegion(e) => write!(f, "invalid texture region: {e}"),
            Self::InvalidFramebuffer(e) => write!(f, "invalid framebuffer: {e}"),
            Self::InvalidPipelineConfig(e) => write!(f, "invalid pipeline configuration: {e}"),
            Self::ShaderCompilation(e) => write!(f, "shader compilation failed: {e}"),
            Self::MissingEntryPoint(name) => write!(f, "shader has no entry point '{name}'"),
            Self::NoPipeline => write!(f, "draw issued with no pipeline bound"),
            Self::NoRenderTarget => write!(f, "draw issued with no framebuffer or surface"),
            Self::Backend(e) => write!(f, "backend error: {e}"),
            Self::Config(e) => write!(f, "invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for Error {}
