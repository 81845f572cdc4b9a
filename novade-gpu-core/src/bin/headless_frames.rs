//! Streams synthetic decoded frames through a headless swap chain.
//!
//! A producer thread fills a [`FrameRing`]; the render thread uploads each
//! frame into an image, blits it onto the acquired swap-chain image and
//! presents. Usage: `headless_frames [config.toml] [frame-count]`.

use anyhow::{bail, Context};
use novade_gpu_core::ash::vk;
use novade_gpu_core::command::ImageTransition;
use novade_gpu_core::producer::DEFAULT_CAPACITY;
use novade_gpu_core::{
    logging, AdapterContext, CoreConfig, CoreError, DecodedFrame, DeviceBuilder, FrameRing,
    FrameSynchronizer, Image, ImageDesc, Instance, QueueRequest, Submission, Surface, Visibility,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

const EXTENT: vk::Extent2D = vk::Extent2D {
    width: 256,
    height: 256,
};

fn gradient(extent: vk::Extent2D, tick: u32) -> DecodedFrame {
    let mut pixels = Vec::with_capacity((extent.width * extent.height * 4) as usize);
    for y in 0..extent.height {
        for x in 0..extent.width {
            pixels.extend_from_slice(&[
                ((x + tick) % 256) as u8,
                ((y + tick) % 256) as u8,
                (tick % 256) as u8,
                255,
            ]);
        }
    }
    DecodedFrame {
        width: extent.width,
        height: extent.height,
        format: vk::Format::R8G8B8A8_UNORM,
        pixels,
    }
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => CoreConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => CoreConfig::default(),
    };
    let frame_count: u32 = match args.next() {
        Some(n) => n.parse().context("frame count must be a number")?,
        None => 60,
    };
    logging::init(&config.logging);

    let instance = Instance::new(&config, &[Surface::headless_extension_name()])
        .context("creating instance with VK_EXT_headless_surface")?;
    let surface = Surface::headless(Arc::clone(&instance), EXTENT)?;
    let adapter = AdapterContext::enumerate(instance, Some(&surface))?;
    info!("Using adapter {}", adapter.device_name());

    let mut builder = DeviceBuilder::new(adapter, Some(surface), &config)?;
    let graphics = builder.request_queue(QueueRequest::graphics())?;
    let present = builder.request_queue(QueueRequest::presentation())?;
    let mut device = builder.finalize()?;
    let mut graphics = device.take_queue(graphics)?;
    let present = device.take_queue(present)?;
    let mut frames = FrameSynchronizer::new(&device, config.frames_in_flight)?;

    let ring = Arc::new(FrameRing::new(DEFAULT_CAPACITY));
    let producer = {
        let ring = Arc::clone(&ring);
        thread::spawn(move || {
            for tick in 0..frame_count {
                ring.push(gradient(EXTENT, tick));
                thread::sleep(Duration::from_millis(2));
            }
            ring.close();
        })
    };

    let source = Image::new(
        &device,
        ImageDesc::new(
            EXTENT,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::SAMPLED,
        ),
        Visibility::DeviceLocal,
    )?;

    while let Some(decoded) = ring.next() {
        if decoded.extent() != source.extent() {
            warn!("Skipping frame with unexpected extent {:?}", decoded.extent());
            continue;
        }
        // Every frame still in flight may be blitting from `source`.
        frames.wait_all()?;
        source.upload(&decoded.pixels, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;

        let frame = match frames.begin_frame(&device) {
            Ok(frame) => frame,
            Err(CoreError::SwapchainOutOfDate) => {
                device.recreate_swapchain(EXTENT)?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let Some(sync) = frames.get(frame) else {
            bail!("frame slot {} vanished", frame.slot);
        };
        let Some(target) = device.swapchain_image(frame.image_index) else {
            bail!("swap chain has no image {}", frame.image_index);
        };

        let slot = graphics.next_slot();
        graphics.record(slot, |rec| {
            rec.transition_image(
                target,
                ImageTransition::new(
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                )
                .access(vk::AccessFlags::empty(), vk::AccessFlags::TRANSFER_WRITE)
                .stages(
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                ),
            );
            rec.blit(
                &source,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                target,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            rec.transition_image(
                target,
                ImageTransition::new(
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                )
                .access(vk::AccessFlags::TRANSFER_WRITE, vk::AccessFlags::empty())
                .stages(
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                ),
            );
            Ok(())
        })?;
        graphics.submit(
            slot,
            Submission::new()
                .wait(sync.image_available(), vk::PipelineStageFlags::TRANSFER)
                .signal(sync.present_ready())
                .fence(sync.in_flight()),
        )?;

        match frames.present(&present, &device, frame) {
            Ok(_) => {}
            Err(CoreError::SwapchainOutOfDate) => device.recreate_swapchain(EXTENT)?,
            Err(e) => return Err(e.into()),
        }
    }

    device.idle()?;
    if producer.join().is_err() {
        bail!("frame producer panicked");
    }
    info!(
        "Presented {} frame(s), {} dropped by the producer ring.",
        frames.frames_presented(),
        ring.dropped()
    );
    Ok(())
}
