//! Error type and `Result` alias for the GPU core.
//!
//! Every native call that can fail goes through [`VkResultExt::at`], which
//! records the Vulkan entry point and the Rust call site. None of these
//! errors are retried; callers are expected to propagate them to `main`.

use ash::vk;
use std::panic::Location;
use thiserror::Error;

/// A specialized `Result` type for GPU core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// A native call returned something other than `VK_SUCCESS`.
    #[error("{call} failed with {result} at {location}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
        location: &'static Location<'static>,
    },

    /// The Vulkan loader library could not be opened.
    #[error("failed to load the Vulkan library: {0}")]
    Loader(#[from] ash::LoadingError),

    #[error("no physical device available")]
    NoSuitableAdapter,

    #[error("no queue family supports {flags:?} (presentation required: {present})")]
    QueueFamilyNotFound { flags: vk::QueueFlags, present: bool },

    /// No memory type satisfies both the resource's type mask and the requested properties.
    #[error("no memory type matches type bits {type_bits:#b} with properties {required:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("shader compilation of `{name}` failed: {message}")]
    ShaderCompile { name: String, message: String },

    #[error("descriptor set {set} binding {binding} is not declared by this pipeline")]
    UnknownDescriptorSet { set: usize, binding: u32 },

    #[error("push-constant range {0} is not declared by this pipeline or is too small")]
    UnknownPushConstantRange(usize),

    #[error("memory is not host-visible and cannot be mapped")]
    NotHostVisible,

    #[error("command slot {0} does not belong to this queue")]
    UnknownCommandSlot(usize),

    #[error("queue {0} was already taken from the device")]
    QueueUnavailable(usize),

    #[error("render pass declares {expected} attachments but {got} view lists were supplied")]
    AttachmentMismatch { expected: usize, got: usize },

    #[error("vertex format {0:?} has no known size")]
    UnsupportedVertexFormat(vk::Format),

    #[error("format {0:?} has several aspects and cannot be uploaded in one copy")]
    UnsupportedUploadFormat(vk::Format),

    #[error("dynamic rendering is not enabled on this device")]
    DynamicRenderingUnsupported,

    #[error("swapchain is out of date and must be recreated")]
    SwapchainOutOfDate,

    #[error("no surface was supplied; presentation is unavailable")]
    NoSurface,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Attaches call-site context to raw `ash` results.
pub trait VkResultExt<T> {
    /// Converts a `VkResult<T>` into a [`CoreError::Vulkan`] naming `call` and
    /// the caller's source location.
    fn at(self, call: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    #[track_caller]
    fn at(self, call: &'static str) -> Result<T> {
        let location = Location::caller();
        self.map_err(|result| CoreError::Vulkan {
            call,
            result,
            location,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_error_names_call_and_location() {
        let failed: std::result::Result<(), vk::Result> = Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let err = failed.at("vkAllocateMemory").unwrap_err();
        match &err {
            CoreError::Vulkan { call, result, location } => {
                assert_eq!(*call, "vkAllocateMemory");
                assert_eq!(*result, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
                assert!(location.file().ends_with("error.rs"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let text = err.to_string();
        assert!(text.contains("vkAllocateMemory"));
        assert!(text.contains("error.rs"));
    }

    #[test]
    fn success_passes_through() {
        let ok: std::result::Result<u32, vk::Result> = Ok(7);
        assert_eq!(ok.at("vkCreateFence").unwrap(), 7);
    }
}
