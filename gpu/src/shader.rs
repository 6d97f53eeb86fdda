// SPDX-License-Identifier: MPL-2.0

//! Shader compilation and shader dumps.
//!
//! Shaders are compiled in two steps: source text to an intermediate form, then the intermediate
//! form to whatever the backend consumes. Both steps go through a [`ShaderCompiler`], which is
//! opaque to the device.

use std::{
    fmt,
    path::Path,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{backend::ShaderId, release::Handle};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompileOptions {
    /// Keep debug information in the output.
    pub debug: bool,
}

pub trait ShaderCompiler {
    /// Compiles source text into the intermediate form.
    fn compile(
        &self,
        stage: ShaderStage,
        source: &str,
        options: &CompileOptions,
    ) -> Result<Vec<u8>, String>;

    /// Translates the intermediate form into the backend's shader language.
    fn translate(&self, intermediate: &[u8]) -> Result<String, String>;

    /// Appended to `shader` in dump file names.
    fn target_suffix(&self) -> &str;
}

/// A compiler for shaders that are already written in WGSL.
///
/// The intermediate form is the UTF-8 source itself. Compilation only checks that the source is
/// non-empty; syntax errors are reported by the backend when the module is created.
#[derive(Debug, Default)]
pub struct WgslPassthrough;

impl ShaderCompiler for WgslPassthrough {
    fn compile(
        &self,
        _: ShaderStage,
        source: &str,
        _: &CompileOptions,
    ) -> Result<Vec<u8>, String> {
        if source.trim().is_empty() {
            return Err("empty shader source".into());
        }

        Ok(source.as_bytes().to_vec())
    }

    fn translate(&self, intermediate: &[u8]) -> Result<String, String> {
        String::from_utf8(intermediate.to_vec()).map_err(|e| e.to_string())
    }

    fn target_suffix(&self) -> &str {
        "_wgsl"
    }
}

/// Whether `code` declares a function named `entry_point`.
pub fn has_entry_point(code: &str, entry_point: &str) -> bool {
    code.match_indices(entry_point).any(|(i, _)| {
        let before = code[..i].trim_end();
        let after = code[(i + entry_point.len())..].trim_start();

        before.ends_with("fn") && after.starts_with('(')
    })
}

static SHADER_DUMPS: AtomicU32 = AtomicU32::new(0);
static BAD_SHADER_DUMPS: AtomicU32 = AtomicU32::new(0);

/// Writes a translated shader to `shader{suffix}_{n}.txt` in `dir`.
pub fn dump_shader(dir: &Path, suffix: &str, code: &str) {
    let n = SHADER_DUMPS.fetch_add(1, Ordering::Relaxed);
    umbra_util::dump_text(&dir.join(format!("shader{suffix}_{n}.txt")), &[code]);
}

/// Writes a shader that failed to compile to `bad_shader_{n}.txt` in `dir`, followed by the
/// compiler's complaint.
pub fn dump_bad_shader(dir: &Path, source: &str, diagnostic: &str) {
    let n = BAD_SHADER_DUMPS.fetch_add(1, Ordering::Relaxed);
    umbra_util::dump_text(
        &dir.join(format!("bad_shader_{n}.txt")),
        &[source, "\n\n", diagnostic],
    );
}

pub struct Shader {
    handle: Handle<ShaderId>,
    stage: ShaderStage,
}

impl Shader {
    pub(crate) fn new(handle: Handle<ShaderId>, stage: ShaderStage) -> Self {
        Self { handle, stage }
    }

    pub fn id(&self) -> ShaderId {
        self.handle.id()
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }
}

impl fmt::Debug for Shader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shader")
            .field("id", &self.id())
            .field("stage", &self.stage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_entry_points() {
        let code = "@vertex\n\
                    fn main_vs(@builtin(vertex_index) i: u32) -> @builtin(position) vec4<f32> {}";
        assert!(has_entry_point(code, "main_vs"));
        assert!(!has_entry_point(code, "main"));
        assert!(!has_entry_point(code, "vertex_index"));
        assert!(has_entry_point("fn  main ()", "main"));
    }

    #[test]
    fn passthrough_rejects_empty_source() {
        let compiler = WgslPassthrough;
        let options = CompileOptions::default();

        assert!(compiler.compile(ShaderStage::Fragment, "  \n", &options).is_err());

        let bytes = compiler
            .compile(ShaderStage::Fragment, "fn main() {}", &options)
            .unwrap();
        assert_eq!(compiler.translate(&bytes).unwrap(), "fn main() {}");
    }

    #[test]
    fn dumps_are_numbered() {
        let dir = std::env::temp_dir().join(format!("umbra-shader-dumps-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        dump_bad_shader(&dir, "fn broken(", "expected ')'");
        dump_bad_shader(&dir, "fn broken(", "expected ')'");

        let count = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("bad_shader_"))
            .count();
        assert_eq!(count, 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
