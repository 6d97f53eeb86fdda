// SPDX-License-Identifier: MPL-2.0

use std::fmt;

use crate::{backend::SamplerId, release::Handle, Error};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Repeat,
    ClampToEdge,
    ClampToBorder,
    MirrorRepeat,
}

/// The only border colors every backend can express.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BorderColor {
    TransparentBlack,
    OpaqueBlack,
    OpaqueWhite,
}

impl BorderColor {
    pub fn from_rgba8(color: u32) -> Result<Self, Error> {
        match color {
            0x0000_0000 => Ok(Self::TransparentBlack),
            0xFF00_0000 => Ok(Self::OpaqueBlack),
            0xFFFF_FFFF => Ok(Self::OpaqueWhite),
            _ => Err(Error::UnsupportedBorderColor(color)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerConfig {
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mip_filter: Filter,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    /// 1 disables anisotropic filtering.
    pub anisotropy: u8,
    pub min_lod: f32,
    pub max_lod: f32,
    /// RGBA8, with red in the low byte. Only used with [`AddressMode::ClampToBorder`].
    pub border_color: u32,
}

impl SamplerConfig {
    pub const POINT: Self = Self {
        min_filter: Filter::Nearest,
        mag_filter: Filter::Nearest,
        mip_filter: Filter::Nearest,
        address_u: AddressMode::ClampToEdge,
        address_v: AddressMode::ClampToEdge,
        address_w: AddressMode::ClampToEdge,
        anisotropy: 1,
        min_lod: 0.0,
        max_lod: 0.0,
        border_color: 0,
    };

    pub const LINEAR: Self = Self {
        min_filter: Filter::Linear,
        mag_filter: Filter::Linear,
        mip_filter: Filter::Nearest,
        ..Self::POINT
    };

    pub fn uses_border(&self) -> bool {
        [self.address_u, self.address_v, self.address_w].contains(&AddressMode::ClampToBorder)
    }

    /// The border color, if any address mode uses it.
    pub fn border(&self) -> Result<Option<BorderColor>, Error> {
        if self.uses_border() {
            BorderColor::from_rgba8(self.border_color).map(Some)
        } else {
            Ok(None)
        }
    }
}

pub struct Sampler {
    handle: Handle<SamplerId>,
    config: SamplerConfig,
}

impl Sampler {
    pub(crate) fn new(handle: Handle<SamplerId>, config: SamplerConfig) -> Self {
        Self { handle, config }
    }

    pub fn id(&self) -> SamplerId {
        self.handle.id()
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }
}

impl fmt::Debug for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Sampler").field(&self.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_known_border_colors_are_accepted() {
        assert!(matches!(BorderColor::from_rgba8(0), Ok(BorderColor::TransparentBlack)));
        assert!(matches!(BorderColor::from_rgba8(0xFF00_0000), Ok(BorderColor::OpaqueBlack)));
        assert!(matches!(BorderColor::from_rgba8(0xFFFF_FFFF), Ok(BorderColor::OpaqueWhite)));
        assert!(matches!(
            BorderColor::from_rgba8(0xFF00_00FF),
            Err(Error::UnsupportedBorderColor(0xFF00_00FF)),
        ));
    }

    #[test]
    fn border_color_is_ignored_without_clamp_to_border() {
        let config = SamplerConfig {
            border_color: 0x1234_5678,
            ..SamplerConfig::LINEAR
        };
        assert!(matches!(config.border(), Ok(None)));

        let config = SamplerConfig {
            address_u: AddressMode::ClampToBorder,
            ..config
        };
        assert!(config.border().is_err());
    }
}
