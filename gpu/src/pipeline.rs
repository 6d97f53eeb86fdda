// SPDX-License-Identifier: MPL-2.0

//! Graphics pipeline descriptions.

use std::fmt;

use crate::{
    backend::{DepthStateId, PipelineId},
    release::Handle,
    shader::{Shader, ShaderStage},
    texture::TextureFormat,
    Error, MAX_TEXTURE_SAMPLERS,
};

/// What a pipeline binds besides its uniform block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineLayout {
    /// One texture and sampler in slot 0.
    SingleTextureAndUbo,
    /// A texture and sampler in each of the slots up to [`MAX_TEXTURE_SAMPLERS`].
    MultiTextureAndUbo,
    /// A texture buffer instead of textures.
    SingleTextureBufferAndUbo,
}

impl PipelineLayout {
    pub fn texture_slots(self) -> usize {
        match self {
            Self::SingleTextureAndUbo => 1,
            Self::MultiTextureAndUbo => MAX_TEXTURE_SAMPLERS,
            Self::SingleTextureBufferAndUbo => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Primitive {
    Points,
    Lines,
    LineStrip,
    Triangles,
    TriangleStrip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Float,
    UInt8,
    SInt8,
    UNorm8,
    UInt16,
    SInt16,
    UNorm16,
    UInt32,
    SInt32,
}

impl AttributeType {
    pub fn size(self) -> u32 {
        match self {
            Self::UInt8 | Self::SInt8 | Self::UNorm8 => 1,
            Self::UInt16 | Self::SInt16 | Self::UNorm16 => 2,
            Self::Float | Self::UInt32 | Self::SInt32 => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub ty: AttributeType,
    pub components: u32,
    pub offset: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct InputLayout {
    pub attributes: Vec<VertexAttribute>,
    pub stride: u32,
}

impl InputLayout {
    fn validate(&self) -> Result<(), String> {
        for attr in &self.attributes {
            if !(1..=4).contains(&attr.components) {
                return Err(format!(
                    "attribute {} has {} components",
                    attr.location, attr.components,
                ));
            }
            let end = attr.offset + attr.ty.size() * attr.components;
            if end > self.stride {
                return Err(format!(
                    "attribute {} ends at {} but the stride is {}",
                    attr.location, end, self.stride,
                ));
            }
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DepthFunc {
    Never,
    Always,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DepthState {
    pub func: DepthFunc,
    pub write: bool,
}

impl DepthState {
    pub const DISABLED: Self = Self {
        func: DepthFunc::Always,
        write: false,
    };

    /// Packs the state into the key depth states are cached under.
    pub fn key(self) -> u8 {
        (self.func as u8) | (u8::from(self.write) << 3)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    InvSrcColor,
    DstColor,
    InvDstColor,
    SrcAlpha,
    InvSrcAlpha,
    DstAlpha,
    InvDstAlpha,
    ConstantColor,
    InvConstantColor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

bitflags::bitflags! {
    pub struct ColorMask: u8 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub enable: bool,
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub color_op: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub alpha_op: BlendOp,
    pub write_mask: ColorMask,
    /// RGBA8, with red in the low byte.
    pub constant: u32,
}

impl BlendState {
    pub const DISABLED: Self = Self {
        enable: false,
        src_color: BlendFactor::One,
        dst_color: BlendFactor::Zero,
        color_op: BlendOp::Add,
        src_alpha: BlendFactor::One,
        dst_alpha: BlendFactor::Zero,
        alpha_op: BlendOp::Add,
        write_mask: ColorMask::all(),
        constant: 0,
    };

    /// Whether any factor reads the constant color.
    pub fn uses_constant(&self) -> bool {
        [self.src_color, self.dst_color, self.src_alpha, self.dst_alpha]
            .iter()
            .any(|f| matches!(f, BlendFactor::ConstantColor | BlendFactor::InvConstantColor))
    }
}

pub struct PipelineConfig<'a> {
    pub layout: PipelineLayout,
    pub primitive: Primitive,
    pub input_layout: InputLayout,
    pub cull_mode: CullMode,
    pub depth: DepthState,
    pub blend: BlendState,
    pub vertex_shader: &'a Shader,
    pub fragment_shader: &'a Shader,
    /// `None` for pipelines that don't write color.
    pub color_format: Option<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
    pub samples: u32,
}

impl PipelineConfig<'_> {
    pub fn validate(&self) -> Result<(), Error> {
        let fail = |msg: String| Err(Error::InvalidPipelineConfig(msg));

        if self.vertex_shader.stage() != ShaderStage::Vertex {
            return fail(format!("{:?} bound as the vertex shader", self.vertex_shader));
        }
        if self.fragment_shader.stage() != ShaderStage::Fragment {
            return fail(format!("{:?} bound as the fragment shader", self.fragment_shader));
        }
        if let Err(e) = self.input_layout.validate() {
            return fail(e);
        }
        if self.color_format.map_or(false, TextureFormat::is_depth) {
            return fail(format!("{:?} is not a color format", self.color_format));
        }
        if self.depth_format.map_or(false, |f| !f.is_depth()) {
            return fail(format!("{:?} is not a depth format", self.depth_format));
        }
        if self.color_format.is_none() && self.depth_format.is_none() {
            return fail("no color or depth format".into());
        }
        if self.samples == 0 || !self.samples.is_power_of_two() {
            return fail(format!("{} samples", self.samples));
        }

        Ok(())
    }
}

pub struct Pipeline {
    handle: Handle<PipelineId>,
    layout: PipelineLayout,
    depth_state: DepthStateId,
    cull_mode: CullMode,
}

impl Pipeline {
    pub(crate) fn new(
        handle: Handle<PipelineId>,
        layout: PipelineLayout,
        depth_state: DepthStateId,
        cull_mode: CullMode,
    ) -> Self {
        Self {
            handle,
            layout,
            depth_state,
            cull_mode,
        }
    }

    pub fn id(&self) -> PipelineId {
        self.handle.id()
    }

    pub fn layout(&self) -> PipelineLayout {
        self.layout
    }

    pub fn depth_state(&self) -> DepthStateId {
        self.depth_state
    }

    pub fn cull_mode(&self) -> CullMode {
        self.cull_mode
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id())
            .field("layout", &self.layout)
            .field("depth_state", &self.depth_state)
            .field("cull_mode", &self.cull_mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FUNCS: [DepthFunc; 7] = [
        DepthFunc::Never,
        DepthFunc::Always,
        DepthFunc::Less,
        DepthFunc::LessEqual,
        DepthFunc::Greater,
        DepthFunc::GreaterEqual,
        DepthFunc::Equal,
    ];

    #[test]
    fn depth_state_keys_are_unique() {
        let mut keys = std::collections::HashSet::new();
        for func in FUNCS {
            for write in [false, true] {
                assert!(keys.insert(DepthState { func, write }.key()));
            }
        }
        assert_eq!(keys.len(), 14);
    }

    #[test]
    fn input_layout_limits_components() {
        let attr = |components, offset| VertexAttribute {
            location: 0,
            ty: AttributeType::Float,
            components,
            offset,
        };
        let layout = |attributes| InputLayout {
            attributes,
            stride: 16,
        };

        assert!(layout(vec![attr(4, 0)]).validate().is_ok());
        assert!(layout(vec![attr(5, 0)]).validate().is_err());
        assert!(layout(vec![attr(0, 0)]).validate().is_err());
        assert!(layout(vec![attr(2, 12)]).validate().is_err());
    }
}
