// SPDX-License-Identifier: MPL-2.0

//! Starting Umbra's renderer.
//!
//! The emulator asks for backends in order of preference. Each one is tried in turn until a
//! [`GraphicsContext`] comes up; a backend that fails to initialize is logged and skipped.

pub mod log;

use std::sync::Arc;

use anyhow::{bail, Context as _};
pub use umbra_gpu::{BackendKind, GpuConfig, GraphicsContext};
use umbra_gpu::{
    backend::{null::NullBackend, wgpu::WgpuBackend},
    shader::WgslPassthrough,
    Backend, Capabilities,
};

/// Creates a context that presents to `window`, whose client area is `size` pixels.
pub fn create_context<W: wgpu::WindowHandle + 'static>(
    config: &GpuConfig,
    preferred: &[BackendKind],
    window: Arc<W>,
    size: (u32, u32),
) -> anyhow::Result<GraphicsContext> {
    try_backends(config, preferred, |kind| {
        Ok(Box::new(WgpuBackend::with_window(kind, config, Arc::clone(&window), size)?))
    })
}

/// Creates a context with nothing to present to.
pub fn create_headless_context(
    config: &GpuConfig,
    preferred: &[BackendKind],
) -> anyhow::Result<GraphicsContext> {
    try_backends(config, preferred, |kind| {
        Ok(Box::new(WgpuBackend::headless(kind, config)?))
    })
}

fn try_backends(
    config: &GpuConfig,
    preferred: &[BackendKind],
    mut create_backend: impl FnMut(BackendKind) -> anyhow::Result<Box<dyn Backend>>,
) -> anyhow::Result<GraphicsContext> {
    if preferred.is_empty() {
        bail!("no backends to try");
    }

    for &kind in preferred {
        match try_backend(config, kind, &mut create_backend) {
            Ok(ctx) => return Ok(ctx),
            Err(e) => tracing::warn!("{:#}", e),
        }
    }

    bail!(
        "none of the backends could be initialized: {}",
        preferred
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
    )
}

fn try_backend(
    config: &GpuConfig,
    kind: BackendKind,
    create_backend: &mut impl FnMut(BackendKind) -> anyhow::Result<Box<dyn Backend>>,
) -> anyhow::Result<GraphicsContext> {
    let backend = if kind == BackendKind::Null {
        let (backend, _) = NullBackend::new(Capabilities::default());
        Box::new(backend)
    } else {
        create_backend(kind).with_context(|| format!("failed to create {kind} backend"))?
    };

    GraphicsContext::new(backend, config.clone(), Box::new(WgslPassthrough))
        .with_context(|| format!("failed to create {kind} device"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_the_next_backend() {
        let mut tried = Vec::new();
        let ctx = try_backends(
            &GpuConfig::default(),
            &[BackendKind::Vulkan, BackendKind::Metal, BackendKind::Null],
            |kind| {
                tried.push(kind);
                bail!("{kind} is not available here")
            },
        )
        .unwrap();

        assert_eq!(tried, [BackendKind::Vulkan, BackendKind::Metal]);
        assert_eq!(ctx.backend_kind(), BackendKind::Null);
    }

    #[test]
    fn stops_at_the_first_backend_that_works() {
        let mut tried = 0;
        let ctx = try_backends(
            &GpuConfig::default(),
            &[BackendKind::Null, BackendKind::Vulkan],
            |_| {
                tried += 1;
                bail!("unreachable")
            },
        )
        .unwrap();

        assert_eq!(tried, 0);
        assert_eq!(ctx.backend_kind(), BackendKind::Null);
    }

    #[test]
    fn fails_when_every_backend_fails() {
        let err = try_backends(&GpuConfig::default(), &[BackendKind::OpenGl], |_| {
            bail!("no GL")
        })
        .err().unwrap();
        assert!(err.to_string().contains("OpenGL"));

        assert!(try_backends(&GpuConfig::default(), &[], |_| bail!("unreachable")).is_err());
    }

    #[test]
    fn device_errors_count_as_failures() {
        let config = GpuConfig {
            uniform_buffer_size: 3,
            ..Default::default()
        };
        assert!(try_backends(&config, &[BackendKind::Null], |_| bail!("unreachable")).is_err());
    }
}
