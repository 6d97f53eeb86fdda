// SPDX-License-Identifier: MPL-2.0

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Error;

const MIB: u32 = 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    pub vertex_buffer_size: u32,
    pub index_buffer_size: u32,
    pub uniform_buffer_size: u32,
    /// The size of the ring texture uploads are staged in.
    pub texture_buffer_size: u32,
    pub vsync: bool,
    /// Ask the backend for validation.
    pub debug_device: bool,
    pub dump_shaders: bool,
    pub shader_dump_dir: PathBuf,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            vertex_buffer_size: 8 * MIB,
            index_buffer_size: 4 * MIB,
            uniform_buffer_size: 2 * MIB,
            texture_buffer_size: 32 * MIB,
            vsync: false,
            debug_device: false,
            dump_shaders: false,
            shader_dump_dir: PathBuf::from("."),
        }
    }
}

impl GpuConfig {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let sizes = [
            ("vertex_buffer_size", self.vertex_buffer_size),
            ("index_buffer_size", self.index_buffer_size),
            ("uniform_buffer_size", self.uniform_buffer_size),
            ("texture_buffer_size", self.texture_buffer_size),
        ];
        for (name, size) in sizes {
            if size < 64 * 1024 || size % 4 != 0 {
                return Err(Error::Config(format!(
                    "{name} must be a multiple of 4 and at least 64 KiB, not {size}",
                )));
            }
        }

        Ok(())
    }
}
