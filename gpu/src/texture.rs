// SPDX-License-Identifier: MPL-2.0

//! Textures, framebuffers, and texel buffers.
//!
//! Render targets and depth buffers are cleared and invalidated lazily. A clear request only
//! records the clear value; the clear happens as the load operation of the next render pass that
//! uses the texture, or as an explicit clear command if the texture is written or read some other
//! way first. See [`TextureState`].

use std::{cell::Cell, fmt, rc::Rc};

use crate::{
    backend::{Capabilities, TextureId},
    release::Handle,
    stream::StreamBuffer,
    Error,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8,
    Bgra8,
    Rgb565,
    Rgba5551,
    R8,
    R16U,
    R16F,
    R32I,
    R32U,
    R32F,
    Rg8,
    Rg16F,
    Rg32F,
    Rgba16F,
    Rgba32F,
    Rgb10A2,
    D16,
    D24S8,
    D32F,
}

impl TextureFormat {
    /// The size of one pixel, in bytes.
    pub fn pixel_size(self) -> u32 {
        match self {
            Self::R8 => 1,
            Self::Rgb565 | Self::Rgba5551 | Self::R16U | Self::R16F | Self::Rg8 | Self::D16 => 2,
            Self::Rgba8
            | Self::Bgra8
            | Self::R32I
            | Self::R32U
            | Self::R32F
            | Self::Rg16F
            | Self::Rgb10A2
            | Self::D24S8
            | Self::D32F => 4,
            Self::Rg32F | Self::Rgba16F => 8,
            Self::Rgba32F => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Self::D16 | Self::D24S8 | Self::D32F)
    }
}

/// A texel position within one level of one layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Origin {
    pub x: u32,
    pub y: u32,
    pub layer: u32,
    pub level: u32,
}

impl Origin {
    pub fn new(x: u32, y: u32) -> Self {
        Self {
            x,
            y,
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureType {
    /// Sampled only.
    Texture,
    RenderTarget,
    DepthStencil,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureConfig {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub levels: u32,
    pub samples: u32,
    pub ty: TextureType,
    pub format: TextureFormat,
}

impl TextureConfig {
    pub fn new(width: u32, height: u32, ty: TextureType, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            layers: 1,
            levels: 1,
            samples: 1,
            ty,
            format,
        }
    }

    pub fn validate(&self, caps: &Capabilities) -> Result<(), Error> {
        let fail = |msg: String| Err(Error::InvalidTextureConfig(msg));

        if self.width == 0 || self.height == 0 || self.layers == 0 || self.levels == 0 {
            return fail(format!(
                "{}x{} with {} layers and {} levels",
                self.width, self.height, self.layers, self.levels,
            ));
        }
        if self.width > caps.max_texture_size || self.height > caps.max_texture_size {
            return fail(format!(
                "{}x{} exceeds the maximum size of {}",
                self.width, self.height, caps.max_texture_size,
            ));
        }
        if self.samples == 0 || !self.samples.is_power_of_two() {
            return fail(format!("{} samples", self.samples));
        }
        if self.samples > caps.max_multisamples {
            return fail(format!(
                "{} samples exceeds the maximum of {}",
                self.samples, caps.max_multisamples,
            ));
        }
        if self.samples > 1 && self.levels > 1 {
            return fail("multisampled textures can't have mipmaps".into());
        }
        let max_levels = 32 - self.width.max(self.height).leading_zeros();
        if self.levels > max_levels {
            return fail(format!(
                "{} levels for a {}x{} texture",
                self.levels, self.width, self.height,
            ));
        }
        if self.ty != TextureType::Texture && (self.layers > 1 || self.levels > 1) {
            return fail("render targets can't have layers or mipmaps".into());
        }
        if (self.ty == TextureType::DepthStencil) != self.format.is_depth() {
            return fail(format!("{:?} can't be a {:?}", self.format, self.ty));
        }

        Ok(())
    }

    pub fn level_width(&self, level: u32) -> u32 {
        (self.width >> level).max(1)
    }

    pub fn level_height(&self, level: u32) -> u32 {
        (self.height >> level).max(1)
    }
}

/// The lazily-resolved contents of a texture.
///
/// ```text
/// Cleared ─┬─▶ Dirty
/// Invalidated ─┘
/// ```
///
/// A texture only leaves `Dirty` on an explicit clear or invalidate request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureState {
    /// The contents are real and GPU-resident.
    Dirty,
    /// The contents are the pending clear value, which hasn't been written yet.
    Cleared,
    /// The contents are undefined.
    Invalidated,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClearValue {
    /// RGBA8, with red in the low byte.
    Color(u32),
    Depth(f32),
}

impl ClearValue {
    pub fn color_f32(color: u32) -> [f32; 4] {
        color.to_le_bytes().map(|c| f32::from(c) / 255.0)
    }
}

impl Default for ClearValue {
    fn default() -> Self {
        Self::Color(0)
    }
}

pub struct Texture {
    handle: Handle<TextureId>,
    config: TextureConfig,
    state: Cell<TextureState>,
    clear_value: Cell<ClearValue>,
    /// The fence of the last command buffer that referenced this texture.
    use_fence: Cell<u64>,
}

impl Texture {
    pub(crate) fn new(handle: Handle<TextureId>, config: TextureConfig, has_data: bool) -> Self {
        let default_clear = if config.format.is_depth() {
            ClearValue::Depth(1.0)
        } else {
            ClearValue::Color(0)
        };

        Self {
            handle,
            config,
            state: Cell::new(if has_data {
                TextureState::Dirty
            } else {
                TextureState::Invalidated
            }),
            clear_value: Cell::new(default_clear),
            use_fence: Cell::new(0),
        }
    }

    pub fn id(&self) -> TextureId {
        self.handle.id()
    }

    pub fn config(&self) -> &TextureConfig {
        &self.config
    }

    pub fn width(&self) -> u32 {
        self.config.width
    }

    pub fn height(&self) -> u32 {
        self.config.height
    }

    pub fn format(&self) -> TextureFormat {
        self.config.format
    }

    pub fn is_render_target(&self) -> bool {
        self.config.ty == TextureType::RenderTarget
    }

    pub fn is_depth_stencil(&self) -> bool {
        self.config.ty == TextureType::DepthStencil
    }

    pub fn state(&self) -> TextureState {
        self.state.get()
    }

    pub fn clear_value(&self) -> ClearValue {
        self.clear_value.get()
    }

    pub fn is_cleared_or_invalidated(&self) -> bool {
        self.state.get() != TextureState::Dirty
    }

    pub(crate) fn mark_cleared(&self, value: ClearValue) {
        self.clear_value.set(value);
        self.state.set(TextureState::Cleared);
    }

    pub(crate) fn mark_invalidated(&self) {
        self.state.set(TextureState::Invalidated);
    }

    pub(crate) fn mark_dirty(&self) {
        self.state.set(TextureState::Dirty);
    }

    /// Takes on `other`'s pending clear, as if `other` had been copied in full.
    pub(crate) fn adopt_clear(&self, other: &Texture) {
        self.clear_value.set(other.clear_value.get());
        self.state.set(other.state.get());
    }

    pub fn use_fence(&self) -> u64 {
        self.use_fence.get()
    }

    pub(crate) fn set_use_fence(&self, fence: u64) {
        self.use_fence.set(fence);
    }

    /// Whether `width`x`height` at `at` covers its whole level.
    pub(crate) fn is_full_region(&self, at: Origin, width: u32, height: u32) -> bool {
        at.x == 0
            && at.y == 0
            && width == self.config.level_width(at.level)
            && height == self.config.level_height(at.level)
    }

    pub(crate) fn check_region(&self, at: Origin, width: u32, height: u32) -> Result<(), Error> {
        let in_bounds = at.layer < self.config.layers
            && at.level < self.config.levels
            && width > 0
            && height > 0
            && at
                .x
                .checked_add(width)
                .map_or(false, |r| r <= self.config.level_width(at.level))
            && at
                .y
                .checked_add(height)
                .map_or(false, |b| b <= self.config.level_height(at.level));

        if in_bounds {
            Ok(())
        } else {
            Err(Error::InvalidRegion(format!(
                "{width}x{height} at {at:?} of {:?}",
                self.config,
            )))
        }
    }
}

impl fmt::Debug for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Texture")
            .field("id", &self.id())
            .field("config", &self.config)
            .field("state", &self.state.get())
            .finish()
    }
}

/// A color target, a depth target, or both.
#[derive(Clone, Debug)]
pub struct Framebuffer {
    color: Option<Rc<Texture>>,
    depth: Option<Rc<Texture>>,
    width: u32,
    height: u32,
}

impl Framebuffer {
    pub(crate) fn new(
        color: Option<Rc<Texture>>,
        depth: Option<Rc<Texture>>,
    ) -> Result<Self, Error> {
        let fail = |msg: &str| Err(Error::InvalidFramebuffer(msg.into()));

        let (width, height) = match (&color, &depth) {
            (None, None) => return fail("no attachments"),
            (Some(c), Some(d)) if (c.width(), c.height()) != (d.width(), d.height()) => {
                return fail("attachment sizes differ");
            }
            (Some(c), _) => (c.width(), c.height()),
            (None, Some(d)) => (d.width(), d.height()),
        };
        if color.as_ref().map_or(false, |c| !c.is_render_target()) {
            return fail("color attachment is not a render target");
        }
        if depth.as_ref().map_or(false, |d| !d.is_depth_stencil()) {
            return fail("depth attachment is not a depth buffer");
        }

        Ok(Self {
            color,
            depth,
            width,
            height,
        })
    }

    pub fn color(&self) -> Option<&Rc<Texture>> {
        self.color.as_ref()
    }

    pub fn depth(&self) -> Option<&Rc<Texture>> {
        self.depth.as_ref()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn has_attachment(&self, texture: &Texture) -> bool {
        let id = texture.id();
        [&self.color, &self.depth]
            .into_iter()
            .flatten()
            .any(|t| t.id() == id)
    }
}

/// A buffer of texels read by index from the fragment stage.
#[derive(Debug)]
pub struct TextureBuffer {
    pub(crate) stream: StreamBuffer,
    format: TextureBufferFormat,
    size_in_elements: u32,
    pub(crate) current_position: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureBufferFormat {
    R16U,
}

impl TextureBufferFormat {
    pub fn element_size(self) -> u32 {
        match self {
            Self::R16U => 2,
        }
    }
}

impl TextureBuffer {
    pub(crate) fn new(
        stream: StreamBuffer,
        format: TextureBufferFormat,
        size_in_elements: u32,
    ) -> Self {
        Self {
            stream,
            format,
            size_in_elements,
            current_position: 0,
        }
    }

    pub fn format(&self) -> TextureBufferFormat {
        self.format
    }

    pub fn size_in_elements(&self) -> u32 {
        self.size_in_elements
    }

    /// The element index of the last unmapped range.
    pub fn current_position(&self) -> u32 {
        self.current_position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture(ty: TextureType, format: TextureFormat, has_data: bool) -> Texture {
        let (tx, rx) = crossbeam_channel::unbounded();
        std::mem::forget(rx);

        Texture::new(
            Handle::new(TextureId(1), tx),
            TextureConfig::new(64, 32, ty, format),
            has_data,
        )
    }

    #[test]
    fn validation_checks_capabilities() {
        let caps = Capabilities {
            max_texture_size: 1024,
            max_multisamples: 4,
            ..Default::default()
        };
        let ok = TextureConfig::new(1024, 512, TextureType::RenderTarget, TextureFormat::Rgba8);
        assert!(ok.validate(&caps).is_ok());

        let too_big = TextureConfig { width: 2048, ..ok };
        assert!(too_big.validate(&caps).is_err());

        let too_many_samples = TextureConfig { samples: 8, ..ok };
        assert!(too_many_samples.validate(&caps).is_err());

        let npot_samples = TextureConfig { samples: 3, ..ok };
        assert!(npot_samples.validate(&caps).is_err());

        let mipped_target = TextureConfig { levels: 2, ..ok };
        assert!(mipped_target.validate(&caps).is_err());

        let depth_color = TextureConfig { format: TextureFormat::D16, ..ok };
        assert!(depth_color.validate(&caps).is_err());

        let mipped = TextureConfig {
            ty: TextureType::Texture,
            levels: 11,
            ..ok
        };
        assert!(mipped.validate(&caps).is_ok());
        assert!(TextureConfig { levels: 12, ..mipped }.validate(&caps).is_err());
    }

    #[test]
    fn initial_state_depends_on_data() {
        let t = texture(TextureType::Texture, TextureFormat::Rgba8, true);
        assert_eq!(t.state(), TextureState::Dirty);

        let rt = texture(TextureType::RenderTarget, TextureFormat::Rgba8, false);
        assert_eq!(rt.state(), TextureState::Invalidated);

        let ds = texture(TextureType::DepthStencil, TextureFormat::D32F, false);
        assert_eq!(ds.clear_value(), ClearValue::Depth(1.0));
    }

    #[test]
    fn only_explicit_requests_leave_dirty() {
        let rt = texture(TextureType::RenderTarget, TextureFormat::Rgba8, false);

        rt.mark_cleared(ClearValue::Color(0xFF00_00FF));
        assert_eq!(rt.state(), TextureState::Cleared);
        assert_eq!(rt.clear_value(), ClearValue::Color(0xFF00_00FF));
        rt.mark_dirty();
        assert_eq!(rt.state(), TextureState::Dirty);

        rt.mark_invalidated();
        assert!(rt.is_cleared_or_invalidated());
    }

    #[test]
    fn region_checks() {
        let t = texture(TextureType::Texture, TextureFormat::Rgba8, true);
        let layer1 = Origin {
            layer: 1,
            ..Default::default()
        };
        assert!(t.check_region(Origin::new(0, 0), 64, 32).is_ok());
        assert!(t.check_region(Origin::new(60, 0), 8, 1).is_err());
        assert!(t.check_region(layer1, 1, 1).is_err());
        assert!(t.check_region(Origin::new(0, 0), 0, 1).is_err());
        assert!(t.is_full_region(Origin::new(0, 0), 64, 32));
        assert!(!t.is_full_region(Origin::new(0, 0), 64, 31));
    }

    #[test]
    fn clear_color_unpacks_red_first() {
        assert_eq!(ClearValue::color_f32(0xFF00_00FF), [1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn framebuffer_attachments_must_match() {
        let color = Rc::new(texture(TextureType::RenderTarget, TextureFormat::Rgba8, false));
        let depth = Rc::new(texture(TextureType::DepthStencil, TextureFormat::D16, false));
        let sampled = Rc::new(texture(TextureType::Texture, TextureFormat::Rgba8, true));

        let fb = Framebuffer::new(Some(Rc::clone(&color)), Some(depth)).unwrap();
        assert_eq!((fb.width(), fb.height()), (64, 32));
        assert!(fb.has_attachment(&color));

        assert!(Framebuffer::new(None, None).is_err());
        assert!(Framebuffer::new(Some(sampled), None).is_err());
    }
}
