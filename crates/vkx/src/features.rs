//! Optional device feature negotiation
//!
//! Examples ask for features such as tessellation shaders or wide lines.
//! A feature marked `required` that the GPU lacks is fatal; an optional one
//! is logged and left disabled.

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::error::{VkxError, VkxResult};

/// Device features examples commonly depend on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFeature {
    /// Tessellation control/evaluation stages
    TessellationShader,
    /// Geometry shader stage
    GeometryShader,
    /// Line widths other than 1.0
    WideLines,
    /// Anisotropic texture filtering
    SamplerAnisotropy,
    /// Wireframe and point polygon modes
    FillModeNonSolid,
    /// BC compressed texture formats
    TextureCompressionBc,
    /// 64-bit floats in shaders
    ShaderFloat64,
    /// Point sizes greater than 1.0
    LargePoints,
}

impl DeviceFeature {
    /// Vulkan name of the feature, as it appears in `VkPhysicalDeviceFeatures`
    pub const fn name(self) -> &'static str {
        match self {
            Self::TessellationShader => "tessellationShader",
            Self::GeometryShader => "geometryShader",
            Self::WideLines => "wideLines",
            Self::SamplerAnisotropy => "samplerAnisotropy",
            Self::FillModeNonSolid => "fillModeNonSolid",
            Self::TextureCompressionBc => "textureCompressionBC",
            Self::ShaderFloat64 => "shaderFloat64",
            Self::LargePoints => "largePoints",
        }
    }

    fn slot(self, features: &mut vk::PhysicalDeviceFeatures) -> &mut vk::Bool32 {
        match self {
            Self::TessellationShader => &mut features.tessellation_shader,
            Self::GeometryShader => &mut features.geometry_shader,
            Self::WideLines => &mut features.wide_lines,
            Self::SamplerAnisotropy => &mut features.sampler_anisotropy,
            Self::FillModeNonSolid => &mut features.fill_mode_non_solid,
            Self::TextureCompressionBc => &mut features.texture_compression_bc,
            Self::ShaderFloat64 => &mut features.shader_float64,
            Self::LargePoints => &mut features.large_points,
        }
    }

    /// Whether `available` reports this feature as supported
    pub fn is_supported(self, available: &vk::PhysicalDeviceFeatures) -> bool {
        let mut copy = *available;
        *self.slot(&mut copy) == vk::TRUE
    }
}

/// A feature an example wants enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRequest {
    /// The feature
    pub feature: DeviceFeature,
    /// Whether the example must exit when the feature is unavailable
    pub required: bool,
}

impl FeatureRequest {
    /// A feature the example cannot run without
    pub const fn required(feature: DeviceFeature) -> Self {
        Self { feature, required: true }
    }

    /// A feature the example uses when present
    pub const fn optional(feature: DeviceFeature) -> Self {
        Self { feature, required: false }
    }
}

/// Build the feature set to enable at device creation
///
/// Returns the enabled set; the first unsupported required feature is an error.
pub fn resolve_features(
    available: &vk::PhysicalDeviceFeatures,
    requests: &[FeatureRequest],
) -> VkxResult<vk::PhysicalDeviceFeatures> {
    let mut enabled = vk::PhysicalDeviceFeatures::default();

    for request in requests {
        if request.feature.is_supported(available) {
            *request.feature.slot(&mut enabled) = vk::TRUE;
        } else if request.required {
            log::error!("Device does not support required feature {}", request.feature.name());
            return Err(VkxError::MissingFeature { feature: request.feature.name() });
        } else {
            log::warn!("Optional feature {} not supported, continuing without it", request.feature.name());
        }
    }

    Ok(enabled)
}
