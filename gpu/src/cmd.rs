// SPDX-License-Identifier: MPL-2.0

//! Recorded GPU commands.
//!
//! A [`CommandBuffer`] is what the device hands to a backend on submission. It holds two lists:
//! uploads into textures the main list hasn't touched yet, which run first, and the main list.

use crate::{
    backend::{BufferId, DepthStateId, PipelineId, SamplerId, TextureId},
    pipeline::CullMode,
    texture::ClearValue,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn from_extent(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self::new(
            x,
            y,
            x.saturating_add(width.min(i32::MAX as u32) as i32),
            y.saturating_add(height.min(i32::MAX as u32) as i32),
        )
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top).max(0) as u32
    }

    /// Clamps the rectangle to `[0, width) x [0, height)`.
    pub fn clamped(&self, width: u32, height: u32) -> Self {
        let w = width.min(i32::MAX as u32) as i32;
        let h = height.min(i32::MAX as u32) as i32;
        let left = self.left.clamp(0, w);
        let top = self.top.clamp(0, h);

        Self {
            left,
            top,
            right: self.right.clamp(left, w),
            bottom: self.bottom.clamp(top, h),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LoadOp<T> {
    Load,
    Clear(T),
    DontCare,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorTarget {
    /// The image acquired for presentation.
    Surface,
    Texture(TextureId),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColorAttachment {
    pub target: ColorTarget,
    /// RGBA8, with red in the low byte.
    pub load: LoadOp<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthAttachment {
    pub texture: TextureId,
    pub load: LoadOp<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command {
    BeginRenderPass {
        color: Option<ColorAttachment>,
        depth: Option<DepthAttachment>,
    },
    EndRenderPass,
    SetPipeline(PipelineId),
    SetDepthState(DepthStateId),
    SetCullMode(CullMode),
    SetViewport(Rect),
    SetScissor(Rect),
    SetUniformBuffer {
        buffer: BufferId,
        offset: u32,
    },
    SetVertexBuffer {
        buffer: BufferId,
        offset: u32,
    },
    SetIndexBuffer {
        buffer: BufferId,
        offset: u32,
    },
    SetTexture {
        slot: u32,
        texture: Option<TextureId>,
    },
    SetSampler {
        slot: u32,
        sampler: Option<SamplerId>,
    },
    SetTextureBuffer(Option<BufferId>),
    Draw {
        vertex_count: u32,
        base_vertex: u32,
    },
    DrawIndexed {
        index_count: u32,
        base_index: u32,
        base_vertex: u32,
    },
    /// Writes the clear value to the whole texture, outside of any render pass.
    ClearTexture {
        texture: TextureId,
        value: ClearValue,
    },
    CopyTexture {
        src: TextureId,
        src_x: u32,
        src_y: u32,
        src_layer: u32,
        src_level: u32,
        dst: TextureId,
        dst_x: u32,
        dst_y: u32,
        dst_layer: u32,
        dst_level: u32,
        width: u32,
        height: u32,
    },
    CopyBufferToTexture {
        buffer: BufferId,
        offset: u32,
        /// Bytes between the starts of consecutive rows.
        pitch: u32,
        texture: TextureId,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        layer: u32,
        level: u32,
    },
    /// Presents the surface image the main list rendered into.
    Present,
}

impl Command {
    pub fn is_draw(&self) -> bool {
        matches!(self, Self::Draw { .. } | Self::DrawIndexed { .. })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandBuffer {
    /// Executed before `commands`.
    pub uploads: Vec<Command>,
    pub commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty() && self.commands.is_empty()
    }

    /// Both lists, in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.uploads.iter().chain(&self.commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_clamps_to_target() {
        let r = Rect::new(-10, 5, 700, 300).clamped(640, 480);
        assert_eq!(r, Rect::new(0, 5, 640, 300));
        assert_eq!((r.width(), r.height()), (640, 295));

        let outside = Rect::new(800, 600, 900, 700).clamped(640, 480);
        assert_eq!((outside.width(), outside.height()), (0, 0));

        let inverted = Rect::new(100, 100, 50, 50).clamped(640, 480);
        assert_eq!((inverted.width(), inverted.height()), (0, 0));
    }

    #[test]
    fn uploads_come_first() {
        let cmdbuf = CommandBuffer {
            uploads: vec![Command::Present],
            commands: vec![Command::EndRenderPass],
        };
        let order: Vec<_> = cmdbuf.iter().copied().collect();
        assert_eq!(order, vec![Command::Present, Command::EndRenderPass]);
    }
}
