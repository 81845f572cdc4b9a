//! Shader modules, from SPIR-V or compiled by an external `glslc`.

use crate::device::{DeviceContext, LogicalDevice};
use crate::error::{CoreError, Result, VkResultExt};
use ash::util::read_spv;
use ash::vk;
use std::ffi::{CStr, OsStr};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info};

const ENTRY_POINT: &CStr = c"main";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// Stage implied by a `.vert`, `.frag` or `.comp` extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(OsStr::to_str) {
            Some("vert") => Some(ShaderStage::Vertex),
            Some("frag") => Some(ShaderStage::Fragment),
            Some("comp") => Some(ShaderStage::Compute),
            _ => None,
        }
    }

    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }

    /// Value of glslc's `-fshader-stage`.
    pub fn glslc_name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vert",
            ShaderStage::Fragment => "frag",
            ShaderStage::Compute => "comp",
        }
    }
}

/// Runs `glslc` on GLSL source. Compilation happens once, at pipeline setup.
#[derive(Debug, Clone)]
pub struct ShaderCompiler {
    glslc: PathBuf,
}

impl ShaderCompiler {
    pub fn new(glslc: impl Into<PathBuf>) -> Self {
        Self {
            glslc: glslc.into(),
        }
    }

    pub fn glslc(&self) -> &Path {
        &self.glslc
    }

    /// Compiles `source` (without a `#version` line; `#version 450` is
    /// prepended) to SPIR-V words. `name` only labels errors.
    pub fn compile(&self, name: &str, source: &str, stage: ShaderStage) -> Result<Vec<u32>> {
        let compile_error = |message: String| CoreError::ShaderCompile {
            name: name.to_string(),
            message,
        };

        let mut input = tempfile::Builder::new()
            .prefix("novade-shader-")
            .suffix(".glsl")
            .tempfile()?;
        writeln!(input, "#version 450")?;
        input.write_all(source.as_bytes())?;
        input.flush()?;
        let output_path = input.path().with_extension("spv");

        let output = Command::new(&self.glslc)
            .arg(format!("-fshader-stage={}", stage.glslc_name()))
            .arg(input.path())
            .arg("-o")
            .arg(&output_path)
            .output()
            .map_err(|e| compile_error(format!("failed to run {}: {}", self.glslc.display(), e)))?;

        if !output.status.success() {
            let _ = std::fs::remove_file(&output_path);
            return Err(compile_error(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let bytes = std::fs::read(&output_path);
        let _ = std::fs::remove_file(&output_path);
        let words = read_spv(&mut Cursor::new(bytes?))?;
        debug!("Compiled {} ({:?}): {} SPIR-V words.", name, stage, words.len());
        Ok(words)
    }
}

pub struct ShaderModule {
    ctx: Arc<DeviceContext>,
    raw: vk::ShaderModule,
    stage: ShaderStage,
}

impl ShaderModule {
    pub fn from_words(device: &LogicalDevice, stage: ShaderStage, words: &[u32]) -> Result<Self> {
        let ctx = device.context();
        let create_info = vk::ShaderModuleCreateInfo::builder().code(words);
        let raw = unsafe { ctx.raw().create_shader_module(&create_info, None) }
            .at("vkCreateShaderModule")?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            raw,
            stage,
        })
    }

    /// Creates a module from SPIR-V bytes, e.g. from `include_bytes!`.
    pub fn from_spirv(device: &LogicalDevice, stage: ShaderStage, bytes: &[u8]) -> Result<Self> {
        let words = read_spv(&mut Cursor::new(bytes))?;
        Self::from_words(device, stage, &words)
    }

    /// Compiles `source` with `compiler` and creates the module.
    pub fn compile(
        device: &LogicalDevice,
        compiler: &ShaderCompiler,
        name: &str,
        source: &str,
        stage: ShaderStage,
    ) -> Result<Self> {
        let words = compiler.compile(name, source, stage)?;
        Self::from_words(device, stage, &words)
    }

    /// Loads a GLSL file, inferring the stage from its extension.
    pub fn load(device: &LogicalDevice, compiler: &ShaderCompiler, path: &Path) -> Result<Self> {
        let stage = ShaderStage::from_path(path).ok_or_else(|| CoreError::ShaderCompile {
            name: path.display().to_string(),
            message: "unknown shader stage; expected .vert, .frag or .comp".into(),
        })?;
        let source = std::fs::read_to_string(path)?;
        info!("Loading {:?} shader from {}.", stage, path.display());
        Self::compile(device, compiler, &path.display().to_string(), &source, stage)
    }

    pub fn raw(&self) -> vk::ShaderModule {
        self.raw
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub(crate) fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(self.stage.flags())
            .module(self.raw)
            .name(ENTRY_POINT)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.ctx.raw().destroy_shader_module(self.raw, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("triangle.vert", Some(ShaderStage::Vertex))]
    #[case("shaders/triangle.frag", Some(ShaderStage::Fragment))]
    #[case("blur.comp", Some(ShaderStage::Compute))]
    #[case("triangle.glsl", None)]
    #[case("noext", None)]
    fn stage_from_extension(#[case] path: &str, #[case] expected: Option<ShaderStage>) {
        assert_eq!(ShaderStage::from_path(Path::new(path)), expected);
    }

    #[test]
    fn missing_compiler_is_a_compile_error() {
        let compiler = ShaderCompiler::new("/nonexistent/bin/glslc");
        let err = compiler
            .compile("triangle.vert", "void main() {}", ShaderStage::Vertex)
            .unwrap_err();
        match err {
            CoreError::ShaderCompile { name, message } => {
                assert_eq!(name, "triangle.vert");
                assert!(message.contains("/nonexistent/bin/glslc"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
