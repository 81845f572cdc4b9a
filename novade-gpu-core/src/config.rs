//! Runtime configuration for the GPU core.
//!
//! [`CoreConfig`] is deserialized from TOML. Every field has a default, so an
//! empty document (or a missing file) yields a usable configuration.

use crate::error::{CoreError, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;

pub mod defaults {
    pub fn application_name() -> String {
        "novade-gpu-core".to_string()
    }
    pub fn engine_name() -> String {
        "NovaDE".to_string()
    }
    pub fn enable_validation() -> bool {
        cfg!(debug_assertions)
    }
    pub fn command_ring_size() -> usize {
        8
    }
    pub fn descriptor_generations() -> usize {
        2
    }
    pub fn frames_in_flight() -> usize {
        1
    }
    pub fn glslc_path() -> String {
        "glslc".to_string()
    }
    pub fn log_level() -> String {
        "info".to_string()
    }
}

/// Preferred presentation mode. FIFO is always available and is used as the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresentModePreference {
    #[default]
    Fifo,
    Mailbox,
    Immediate,
}

impl PresentModePreference {
    pub fn as_vk(self) -> vk::PresentModeKHR {
        match self {
            PresentModePreference::Fifo => vk::PresentModeKHR::FIFO,
            PresentModePreference::Mailbox => vk::PresentModeKHR::MAILBOX,
            PresentModePreference::Immediate => vk::PresentModeKHR::IMMEDIATE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Minimum level: "trace", "debug", "info", "warn" or "error".
    /// `RUST_LOG` takes precedence when set.
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    #[serde(default = "defaults::application_name")]
    pub application_name: String,
    #[serde(default = "defaults::engine_name")]
    pub engine_name: String,
    /// Enables `VK_LAYER_KHRONOS_validation` and the debug messenger.
    #[serde(default = "defaults::enable_validation")]
    pub enable_validation: bool,
    /// Number of command-buffer slots per queue.
    #[serde(default = "defaults::command_ring_size")]
    pub command_ring_size: usize,
    /// Number of parallel descriptor-set generations per declared set.
    #[serde(default = "defaults::descriptor_generations")]
    pub descriptor_generations: usize,
    #[serde(default = "defaults::frames_in_flight")]
    pub frames_in_flight: usize,
    #[serde(default)]
    pub present_mode: PresentModePreference,
    #[serde(default = "defaults::glslc_path")]
    pub glslc_path: String,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            application_name: defaults::application_name(),
            engine_name: defaults::engine_name(),
            enable_validation: defaults::enable_validation(),
            command_ring_size: defaults::command_ring_size(),
            descriptor_generations: defaults::descriptor_generations(),
            frames_in_flight: defaults::frames_in_flight(),
            present_mode: PresentModePreference::default(),
            glslc_path: defaults::glslc_path(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: CoreConfig =
            toml::from_str(text).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration at `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => {
                tracing::info!("Loading GPU core configuration from {}", path.display());
                Self::from_toml_str(&text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    "No configuration at {}, using defaults.",
                    path.display()
                );
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
            Err(e) => Err(CoreError::Io(e)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.command_ring_size == 0 {
            return Err(CoreError::Config("command_ring_size must be at least 1".into()));
        }
        if self.descriptor_generations == 0 {
            return Err(CoreError::Config(
                "descriptor_generations must be at least 1".into(),
            ));
        }
        if self.frames_in_flight == 0 {
            return Err(CoreError::Config("frames_in_flight must be at least 1".into()));
        }
        let bound = self.command_ring_size.min(self.descriptor_generations);
        if self.frames_in_flight > bound {
            return Err(CoreError::Config(format!(
                "frames_in_flight ({}) exceeds min(command_ring_size, descriptor_generations) ({})",
                self.frames_in_flight, bound
            )));
        }
        match self.logging.level.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(CoreError::Config(format!("unknown log level `{other}`"))),
        }
    }
}
