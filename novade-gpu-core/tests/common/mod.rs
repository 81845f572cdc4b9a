//! Shared setup for tests that need a real Vulkan device.
//!
//! Every helper returns `None` (after logging a warning) when the loader,
//! a physical device or headless-surface support is missing, so the calling
//! test can return early on machines without a GPU.

#![allow(dead_code)]

use novade_gpu_core::ash::vk;
use novade_gpu_core::{
    AdapterContext, CoreConfig, DeviceBuilder, Instance, LogicalDevice, QueueRequest,
    QueueTicket, ShaderCompiler, Surface,
};
use std::fmt::Debug;

pub const EXTENT: vk::Extent2D = vk::Extent2D {
    width: 64,
    height: 64,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Unwraps `result` or logs why the test is being skipped.
pub fn or_skip<T, E: Debug>(what: &str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Skipping: {} failed (this might be expected without a GPU): {:?}", what, e);
            None
        }
    }
}

pub struct Gpu {
    pub device: LogicalDevice,
    pub graphics: QueueTicket,
    pub present: Option<QueueTicket>,
}

pub fn config() -> CoreConfig {
    CoreConfig {
        enable_validation: true,
        ..CoreConfig::default()
    }
}

/// A device with one graphics queue and no surface.
pub fn offscreen_device(config: &CoreConfig) -> Option<Gpu> {
    init_tracing();
    let instance = or_skip("instance creation", Instance::new(config, &[]))?;
    let adapter = or_skip("adapter enumeration", AdapterContext::enumerate(instance, None))?;
    let mut builder = or_skip("device builder", DeviceBuilder::new(adapter, None, config))?;
    let graphics = or_skip("graphics queue request", builder.request_queue(QueueRequest::graphics()))?;
    let device = or_skip("device finalize", builder.finalize())?;
    Some(Gpu {
        device,
        graphics,
        present: None,
    })
}

/// A device with a graphics queue and a presentation queue on a headless surface.
pub fn headless_device(config: &CoreConfig) -> Option<Gpu> {
    init_tracing();
    let instance = or_skip(
        "instance creation with VK_EXT_headless_surface",
        Instance::new(config, &[Surface::headless_extension_name()]),
    )?;
    let surface = or_skip("headless surface", Surface::headless(instance.clone(), EXTENT))?;
    let adapter = or_skip(
        "adapter enumeration",
        AdapterContext::enumerate(instance, Some(&surface)),
    )?;
    let mut builder = or_skip(
        "device builder",
        DeviceBuilder::new(adapter, Some(surface), config),
    )?;
    let graphics = or_skip("graphics queue request", builder.request_queue(QueueRequest::graphics()))?;
    let present = or_skip(
        "presentation queue request",
        builder.request_queue(QueueRequest::presentation()),
    )?;
    let device = or_skip("device finalize", builder.finalize())?;
    Some(Gpu {
        device,
        graphics,
        present: Some(present),
    })
}

/// The first adapter, for tests that build devices themselves.
pub fn adapter(config: &CoreConfig) -> Option<AdapterContext> {
    init_tracing();
    let instance = or_skip("instance creation", Instance::new(config, &[]))?;
    or_skip("adapter enumeration", AdapterContext::enumerate(instance, None))
}

/// `glslc` from the configuration, if it can actually be run.
pub fn compiler(config: &CoreConfig) -> Option<ShaderCompiler> {
    let compiler = ShaderCompiler::new(&config.glslc_path);
    let version = std::process::Command::new(compiler.glslc())
        .arg("--version")
        .output();
    match version {
        Ok(output) if output.status.success() => Some(compiler),
        other => {
            tracing::warn!("Skipping: glslc is not available: {:?}", other.map(|o| o.status));
            None
        }
    }
}
