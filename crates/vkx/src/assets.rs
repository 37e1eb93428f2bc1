//! Asset path conventions and SPIR-V loading
//!
//! Examples find their files by convention:
//! `shaders/<example>/<name>.<stage>.spv`, `models/<file>` and
//! `textures/<file>`, all relative to a configurable root.

use std::fs::File;
use std::path::{Path, PathBuf};

use ash::vk;

use crate::error::{VkxError, VkxResult};

/// Shader stage, used for the file extension and pipeline stage flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Vertex shader
    Vertex,
    /// Fragment shader
    Fragment,
    /// Tessellation control shader
    TessellationControl,
    /// Tessellation evaluation shader
    TessellationEvaluation,
    /// Geometry shader
    Geometry,
    /// Compute shader
    Compute,
}

impl ShaderStage {
    /// File extension used for this stage (`vert`, `frag`, ...)
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Vertex => "vert",
            Self::Fragment => "frag",
            Self::TessellationControl => "tesc",
            Self::TessellationEvaluation => "tese",
            Self::Geometry => "geom",
            Self::Compute => "comp",
        }
    }

    /// Matching Vulkan stage flag
    pub const fn flags(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::TessellationControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            Self::TessellationEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            Self::Geometry => vk::ShaderStageFlags::GEOMETRY,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// Resolves asset files relative to a root directory
#[derive(Debug, Clone)]
pub struct AssetPaths {
    root: PathBuf,
}

impl AssetPaths {
    /// Create a resolver rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `shaders/<example>/<name>.<stage>.spv`
    pub fn shader(&self, example: &str, name: &str, stage: ShaderStage) -> PathBuf {
        self.root
            .join("shaders")
            .join(example)
            .join(format!("{name}.{}.spv", stage.extension()))
    }

    /// `models/<file>`
    pub fn model(&self, file: &str) -> PathBuf {
        self.root.join("models").join(file)
    }

    /// `textures/<file>`
    pub fn texture(&self, file: &str) -> PathBuf {
        self.root.join("textures").join(file)
    }

    /// Load the SPIR-V words for a shader of `example`
    pub fn load_shader(&self, example: &str, name: &str, stage: ShaderStage) -> VkxResult<Vec<u32>> {
        load_spirv(&self.shader(example, name, stage))
    }
}

/// Read a SPIR-V binary as aligned 32-bit words
pub fn load_spirv(path: &Path) -> VkxResult<Vec<u32>> {
    let asset_error = |reason: String| VkxError::Asset {
        path: path.display().to_string(),
        reason,
    };

    let mut file = File::open(path).map_err(|e| asset_error(e.to_string()))?;
    let words = ash::util::read_spv(&mut file).map_err(|e| asset_error(e.to_string()))?;
    log::debug!("Loaded {} SPIR-V words from {}", words.len(), path.display());
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_shader_path_convention() {
        let assets = AssetPaths::new("data");
        let path = assets.shader("tessellation", "base", ShaderStage::TessellationEvaluation);
        assert_eq!(path, Path::new("data/shaders/tessellation/base.tese.spv"));
    }

    #[test]
    fn test_model_and_texture_paths() {
        let assets = AssetPaths::new("data");
        assert_eq!(assets.model("cube.obj"), Path::new("data/models/cube.obj"));
        assert_eq!(assets.texture("stone.ktx"), Path::new("data/textures/stone.ktx"));
    }

    #[test]
    fn test_missing_shader_is_asset_error() {
        let assets = AssetPaths::new("does-not-exist");
        let err = assets.load_shader("triangle", "triangle", ShaderStage::Vertex).unwrap_err();
        match err {
            VkxError::Asset { path, .. } => assert!(path.ends_with("triangle.vert.spv")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_load_spirv_words() {
        let path = std::env::temp_dir().join(format!("vkx-test-{}.spv", std::process::id()));
        {
            let mut file = File::create(&path).unwrap();
            // SPIR-V magic number followed by one word, little endian
            file.write_all(&[0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00]).unwrap();
        }

        let words = load_spirv(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(words, vec![0x0723_0203, 0x0001_0000]);
    }

    #[test]
    fn test_truncated_spirv_rejected() {
        let path = std::env::temp_dir().join(format!("vkx-test-truncated-{}.spv", std::process::id()));
        std::fs::write(&path, [0x03, 0x02, 0x23]).unwrap();

        let result = load_spirv(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(VkxError::Asset { .. })));
    }

    #[test]
    fn test_stage_flags() {
        assert_eq!(ShaderStage::Compute.flags(), vk::ShaderStageFlags::COMPUTE);
        assert_eq!(ShaderStage::Fragment.extension(), "frag");
    }
}
