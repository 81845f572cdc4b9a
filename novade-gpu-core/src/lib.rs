//! Explicit GPU resource and command-submission layer on Vulkan.
//!
//! Objects are created in dependency order: [`Instance`], an optional
//! [`Surface`] from the windowing layer, [`AdapterContext`], then a
//! [`DeviceBuilder`] that collects queue requests and finalizes into a
//! [`LogicalDevice`]. Buffers, images, pipelines, render passes and queues
//! all hold the device context alive, so dropping them in any order is safe;
//! the device itself goes last.

pub mod adapter;
pub mod buffer;
pub mod command;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod image;
pub mod instance;
pub mod logging;
pub mod memory;
pub mod pipeline;
pub mod producer;
pub mod queue;
pub mod render_pass;
pub mod ring;
pub mod shader;
mod staging;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use adapter::{AdapterContext, QueueRequest};
pub use buffer::Buffer;
pub use command::{CommandRecorder, ImageTransition, RenderingAttachment};
pub use config::CoreConfig;
pub use descriptor::{DescriptorBinding, DescriptorResource};
pub use device::{DeviceBuilder, LogicalDevice, QueueTicket};
pub use error::{CoreError, Result};
pub use image::{Image, ImageDesc};
pub use instance::Instance;
pub use memory::Visibility;
pub use pipeline::{GraphicsPipelineDesc, Pipeline, RenderTarget, VertexInputBinding};
pub use producer::{DecodedFrame, FrameRing};
pub use queue::{CommandSlot, Queue, Submission};
pub use render_pass::{AttachmentDesc, RenderPass};
pub use shader::{ShaderCompiler, ShaderModule, ShaderStage};
pub use surface::Surface;
pub use swapchain::Swapchain;
pub use sync::{Fence, Frame, FrameSynchronizer, Semaphore};

pub use ash;
