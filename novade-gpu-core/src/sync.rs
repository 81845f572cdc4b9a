//! Semaphores, fences and per-frame synchronization.
//!
//! A frame runs: wait on the frame fence, acquire a swap-chain image
//! (signaling `image_available`), submit work chained through semaphores,
//! submit the last pass with `present_ready` and the frame fence, present.
//! Whether producer and consumer passes on the same family also need a
//! semaphore is the caller's choice; submission order already serializes a
//! single queue.

use crate::device::{DeviceContext, LogicalDevice};
use crate::error::{CoreError, Result, VkResultExt};
use crate::queue::Queue;
use crate::ring::Ring;
use ash::vk;
use std::sync::Arc;
use tracing::{debug, info, trace};

pub struct Semaphore {
    ctx: Arc<DeviceContext>,
    raw: vk::Semaphore,
}

impl Semaphore {
    pub fn new(ctx: &Arc<DeviceContext>) -> Result<Self> {
        let raw = unsafe {
            ctx.raw()
                .create_semaphore(&vk::SemaphoreCreateInfo::builder(), None)
        }
        .at("vkCreateSemaphore")?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            raw,
        })
    }

    pub fn raw(&self) -> vk::Semaphore {
        self.raw
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { self.ctx.raw().destroy_semaphore(self.raw, None) };
    }
}

pub struct Fence {
    ctx: Arc<DeviceContext>,
    raw: vk::Fence,
}

impl Fence {
    pub fn new(ctx: &Arc<DeviceContext>, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let raw = unsafe {
            ctx.raw()
                .create_fence(&vk::FenceCreateInfo::builder().flags(flags), None)
        }
        .at("vkCreateFence")?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            raw,
        })
    }

    pub fn raw(&self) -> vk::Fence {
        self.raw
    }

    pub fn wait(&self) -> Result<()> {
        unsafe { self.ctx.raw().wait_for_fences(&[self.raw], true, u64::MAX) }
            .at("vkWaitForFences")
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.ctx.raw().reset_fences(&[self.raw]) }.at("vkResetFences")
    }

    /// Blocks until signaled, then resets so the fence can gate the next submission.
    pub fn wait_and_reset(&self) -> Result<()> {
        self.wait()?;
        self.reset()
    }

    pub fn is_signaled(&self) -> Result<bool> {
        unsafe { self.ctx.raw().get_fence_status(self.raw) }.at("vkGetFenceStatus")
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { self.ctx.raw().destroy_fence(self.raw, None) };
    }
}

/// Signals used by one frame in flight.
pub struct FrameSync {
    image_available: Semaphore,
    render_finished: Semaphore,
    present_ready: Semaphore,
    in_flight: Fence,
}

impl FrameSync {
    pub fn new(device: &LogicalDevice) -> Result<Self> {
        Ok(Self {
            image_available: device.semaphore()?,
            render_finished: device.semaphore()?,
            present_ready: device.semaphore()?,
            // Signaled so the first wait returns immediately.
            in_flight: device.fence(true)?,
        })
    }

    /// Signaled by image acquisition.
    pub fn image_available(&self) -> &Semaphore {
        &self.image_available
    }

    /// For chaining a graphics pass to a later pass on another family.
    pub fn render_finished(&self) -> &Semaphore {
        &self.render_finished
    }

    /// Signaled by the last submission of the frame; presentation waits on it.
    pub fn present_ready(&self) -> &Semaphore {
        &self.present_ready
    }

    /// Signaled by the last submission of the frame; the CPU waits on it.
    pub fn in_flight(&self) -> &Fence {
        &self.in_flight
    }
}

/// An acquired swap-chain image and the frame-sync slot it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub image_index: u32,
    pub slot: usize,
}

pub struct FrameSynchronizer {
    frames: Ring<FrameSync>,
    presented: u64,
}

impl FrameSynchronizer {
    pub fn new(device: &LogicalDevice, frames_in_flight: usize) -> Result<Self> {
        if frames_in_flight == 0 {
            return Err(CoreError::Config("frames_in_flight must be at least 1".into()));
        }
        let frames = (0..frames_in_flight)
            .map(|_| FrameSync::new(device))
            .collect::<Result<Vec<_>>>()?;
        info!("Frame synchronizer ready with {} frame(s) in flight.", frames_in_flight);
        Ok(Self {
            frames: Ring::new("frame-sync", frames),
            presented: 0,
        })
    }

    /// Sync objects of the frame that [`FrameSynchronizer::begin_frame`] will use next.
    pub fn current(&self) -> Option<&FrameSync> {
        self.frames.current()
    }

    pub fn get(&self, frame: Frame) -> Option<&FrameSync> {
        self.frames.get(frame.slot)
    }

    /// Blocks until every frame slot's fence is signaled, without resetting
    /// any of them. Use before overwriting a resource read by earlier frames.
    pub fn wait_all(&self) -> Result<()> {
        for sync in self.frames.iter() {
            sync.in_flight.wait()?;
        }
        Ok(())
    }

    pub fn frames(&self) -> std::slice::Iter<'_, FrameSync> {
        self.frames.iter()
    }

    pub fn frames_presented(&self) -> u64 {
        self.presented
    }

    /// Waits for the slot's previous frame to retire, then acquires the next
    /// image. The fence is reset only after a successful acquire, so an
    /// out-of-date swap chain leaves it signaled for the retry.
    pub fn begin_frame(&mut self, device: &LogicalDevice) -> Result<Frame> {
        let slot = self.frames.cursor();
        let sync = self
            .frames
            .current()
            .ok_or_else(|| CoreError::Config("frame synchronizer has no frames".into()))?;
        sync.in_flight.wait()?;
        let image_index = device.acquire_next_image(&sync.image_available)?;
        sync.in_flight.reset()?;
        trace!("Frame slot {} acquired image {}.", slot, image_index);
        Ok(Frame { image_index, slot })
    }

    /// Presents `frame` once its `present_ready` semaphore is signaled and
    /// moves to the next slot. Returns whether the swap chain is suboptimal.
    pub fn present(&mut self, queue: &Queue, device: &LogicalDevice, frame: Frame) -> Result<bool> {
        let sync = self
            .frames
            .get(frame.slot)
            .ok_or_else(|| CoreError::Config(format!("unknown frame slot {}", frame.slot)))?;
        let result = queue.present(device.swapchain()?, frame.image_index, &[&sync.present_ready]);
        self.frames.advance();
        match result {
            Ok(suboptimal) => {
                self.presented += 1;
                if suboptimal {
                    debug!("Swapchain reported suboptimal on present.");
                }
                Ok(suboptimal)
            }
            Err(e) => Err(e),
        }
    }
}
