//! Internal transfer queue used by staged uploads.
//!
//! Each copy is recorded into a single reusable command buffer, submitted
//! with a private fence, and waited on before returning, so the staging
//! buffer can be destroyed as soon as the call completes.

use crate::command::buffer_image_region;
use crate::error::{Result, VkResultExt};
use ash::vk;
use tracing::{debug, info};

pub(crate) struct Stager {
    family: u32,
    queue: vk::Queue,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
}

impl Stager {
    pub(crate) fn new(device: &ash::Device, family: u32) -> Result<Self> {
        let queue = unsafe { device.get_device_queue(family, 0) };

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                    | vk::CommandPoolCreateFlags::TRANSIENT,
            )
            .queue_family_index(family);
        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .at("vkCreateCommandPool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = match unsafe { device.allocate_command_buffers(&alloc_info) }
            .at("vkAllocateCommandBuffers")
        {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(e);
            }
        };

        let fence = match unsafe { device.create_fence(&vk::FenceCreateInfo::builder(), None) }
            .at("vkCreateFence")
        {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(e);
            }
        };

        info!("Staging transfer queue ready on family {}.", family);
        Ok(Self {
            family,
            queue,
            pool,
            cmd,
            fence,
        })
    }

    pub(crate) fn family(&self) -> u32 {
        self.family
    }

    /// Records `record` into the staging command buffer, submits it and
    /// blocks until the GPU has finished executing it.
    fn submit_and_wait(
        &self,
        device: &ash::Device,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> Result<()> {
        unsafe {
            device
                .reset_command_buffer(self.cmd, vk::CommandBufferResetFlags::empty())
                .at("vkResetCommandBuffer")?;
            let begin = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(self.cmd, &begin)
                .at("vkBeginCommandBuffer")?;
            record(device, self.cmd);
            device
                .end_command_buffer(self.cmd)
                .at("vkEndCommandBuffer")?;

            let cmds = [self.cmd];
            let submit = vk::SubmitInfo::builder().command_buffers(&cmds);
            device
                .queue_submit(self.queue, &[submit.build()], self.fence)
                .at("vkQueueSubmit")?;
            device
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .at("vkWaitForFences")?;
            device
                .reset_fences(&[self.fence])
                .at("vkResetFences")?;
        }
        Ok(())
    }

    pub(crate) fn copy_buffer(
        &self,
        device: &ash::Device,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) -> Result<()> {
        debug!("Staged copy of {} bytes.", size);
        self.submit_and_wait(device, |device, cmd| {
            let region = vk::BufferCopy::builder().size(size).build();
            unsafe { device.cmd_copy_buffer(cmd, src, dst, &[region]) };
        })
    }

    /// Copies `src` into mip 0 / layer 0 of `image`, leaving it in `final_layout`.
    /// `aspect` must name a single aspect.
    pub(crate) fn copy_buffer_to_image(
        &self,
        device: &ash::Device,
        src: vk::Buffer,
        image: vk::Image,
        extent: vk::Extent2D,
        aspect: vk::ImageAspectFlags,
        final_layout: vk::ImageLayout,
    ) -> Result<()> {
        debug!("Staged image copy ({}x{}).", extent.width, extent.height);
        self.submit_and_wait(device, |device, cmd| {
            let range = vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            };
            let to_transfer = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(range)
                .build();
            let region = buffer_image_region(aspect, extent);
            let to_final = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::MEMORY_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(final_layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(range)
                .build();
            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_transfer],
                );
                device.cmd_copy_buffer_to_image(
                    cmd,
                    src,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_final],
                );
            }
        })
    }

    /// Destroys the pool and fence. The device must be idle.
    pub(crate) unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_fence(self.fence, None);
        device.destroy_command_pool(self.pool, None);
    }
}
