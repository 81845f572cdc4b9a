//! Hardware queues and their command-buffer slot rings.

use crate::command::CommandRecorder;
use crate::device::DeviceContext;
use crate::error::{CoreError, Result, VkResultExt};
use crate::ring::Ring;
use crate::swapchain::Swapchain;
use crate::sync::{Fence, Semaphore};
use ash::vk;
use std::sync::Arc;
use tracing::{debug, warn};

/// Index of a command-buffer slot in a queue's ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandSlot(usize);

impl CommandSlot {
    pub fn index(self) -> usize {
        self.0
    }
}

/// GPU-side dependencies of one submission.
#[derive(Default)]
pub struct Submission<'a> {
    waits: Vec<(&'a Semaphore, vk::PipelineStageFlags)>,
    signals: Vec<&'a Semaphore>,
    fence: Option<&'a Fence>,
}

impl<'a> Submission<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for `semaphore` before `stage` executes.
    pub fn wait(mut self, semaphore: &'a Semaphore, stage: vk::PipelineStageFlags) -> Self {
        self.waits.push((semaphore, stage));
        self
    }

    pub fn signal(mut self, semaphore: &'a Semaphore) -> Self {
        self.signals.push(semaphore);
        self
    }

    /// Fence signaled when the submission completes.
    pub fn fence(mut self, fence: &'a Fence) -> Self {
        self.fence = Some(fence);
        self
    }
}

pub struct Queue {
    ctx: Arc<DeviceContext>,
    family: u32,
    raw: vk::Queue,
    pool: vk::CommandPool,
    slots: Ring<vk::CommandBuffer>,
}

impl Queue {
    /// Queue 0 of `family`, with `command_ring_size` slots.
    pub(crate) fn new(ctx: &Arc<DeviceContext>, family: u32) -> Result<Self> {
        let raw = unsafe { ctx.raw().get_device_queue(family, 0) };

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(family);
        let pool = unsafe { ctx.raw().create_command_pool(&pool_info, None) }
            .at("vkCreateCommandPool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(ctx.command_ring_size() as u32);
        let buffers = match unsafe { ctx.raw().allocate_command_buffers(&alloc_info) }
            .at("vkAllocateCommandBuffers")
        {
            Ok(buffers) => buffers,
            Err(e) => {
                unsafe { ctx.raw().destroy_command_pool(pool, None) };
                return Err(e);
            }
        };

        debug!("Queue on family {} with {} command slots.", family, buffers.len());
        Ok(Self {
            ctx: Arc::clone(ctx),
            family,
            raw,
            pool,
            slots: Ring::new("command-slots", buffers),
        })
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn raw(&self) -> vk::Queue {
        self.raw
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Next slot in round-robin order. A slot is handed out again after a
    /// full lap whether or not its last submission has retired.
    pub fn next_slot(&mut self) -> CommandSlot {
        // The ring is never empty: config validation keeps the size at least 1.
        CommandSlot(self.slots.next_index().unwrap_or(0))
    }

    pub fn command_buffer(&self, slot: CommandSlot) -> Result<vk::CommandBuffer> {
        self.slots
            .get(slot.0)
            .copied()
            .ok_or(CoreError::UnknownCommandSlot(slot.0))
    }

    /// Resets `slot`, begins recording, runs `body` and ends recording.
    ///
    /// Recording is ended on every exit path, including an error or panic in
    /// `body`. An error from `body` is returned in preference to one from ending.
    pub fn record<R>(
        &self,
        slot: CommandSlot,
        body: impl FnOnce(&mut CommandRecorder<'_>) -> Result<R>,
    ) -> Result<R> {
        let cmd = self.command_buffer(slot)?;
        unsafe {
            self.ctx
                .raw()
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .at("vkResetCommandBuffer")?;
            self.ctx
                .raw()
                .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::builder())
                .at("vkBeginCommandBuffer")?;
        }
        let mut recorder = CommandRecorder::new(&self.ctx, cmd);
        let out = body(&mut recorder);
        let ended = recorder.finish();
        let out = out?;
        ended?;
        Ok(out)
    }

    pub fn submit(&self, slot: CommandSlot, submission: Submission<'_>) -> Result<()> {
        let cmds = [self.command_buffer(slot)?];
        let wait_semaphores: Vec<vk::Semaphore> =
            submission.waits.iter().map(|(s, _)| s.raw()).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> =
            submission.waits.iter().map(|(_, stage)| *stage).collect();
        let signal_semaphores: Vec<vk::Semaphore> =
            submission.signals.iter().map(|s| s.raw()).collect();
        let fence = submission
            .fence
            .map(Fence::raw)
            .unwrap_or_else(vk::Fence::null);

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&cmds)
            .signal_semaphores(&signal_semaphores);
        unsafe {
            self.ctx
                .raw()
                .queue_submit(self.raw, &[submit_info.build()], fence)
        }
        .at("vkQueueSubmit")?;
        tracing::trace!(
            "Submitted slot {} on family {} ({} waits, {} signals).",
            slot.0,
            self.family,
            wait_semaphores.len(),
            signal_semaphores.len()
        );
        Ok(())
    }

    /// Presents `image_index` once every semaphore in `waits` is signaled.
    /// Returns whether the swap chain is suboptimal for the surface.
    pub fn present(
        &self,
        swapchain: &Swapchain,
        image_index: u32,
        waits: &[&Semaphore],
    ) -> Result<bool> {
        let wait_semaphores: Vec<vk::Semaphore> = waits.iter().map(|s| s.raw()).collect();
        let swapchains = [swapchain.raw()];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);
        match unsafe { swapchain.loader().queue_present(self.raw, &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(CoreError::SwapchainOutOfDate),
            Err(e) => Err(e).at("vkQueuePresentKHR"),
        }
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.ctx.raw().queue_wait_idle(self.raw) }.at("vkQueueWaitIdle")
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            warn!("Queue on family {} did not drain: {}", self.family, e);
        }
        // Frees every slot's command buffer with it.
        unsafe { self.ctx.raw().destroy_command_pool(self.pool, None) };
    }
}
