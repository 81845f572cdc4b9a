//! Command recording.
//!
//! A [`CommandRecorder`] only exists inside [`Queue::record`](crate::queue::Queue::record),
//! which begins the command buffer before handing it out and ends it on
//! every exit path. Barriers are explicit: nothing here tracks hazards.

use crate::buffer::Buffer;
use crate::device::DeviceContext;
use crate::error::{CoreError, Result, VkResultExt};
use crate::image::Image;
use crate::pipeline::Pipeline;
use crate::render_pass::RenderPass;
use ash::vk;
use bytemuck::Pod;
use tracing::warn;

/// Layout and access change for a whole image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl ImageTransition {
    /// Layout change with full-pipeline stage masks and no access masks.
    pub fn new(old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        Self {
            old_layout,
            new_layout,
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::empty(),
            src_stage: vk::PipelineStageFlags::ALL_COMMANDS,
            dst_stage: vk::PipelineStageFlags::ALL_COMMANDS,
        }
    }

    pub fn access(mut self, src: vk::AccessFlags, dst: vk::AccessFlags) -> Self {
        self.src_access = src;
        self.dst_access = dst;
        self
    }

    pub fn stages(mut self, src: vk::PipelineStageFlags, dst: vk::PipelineStageFlags) -> Self {
        self.src_stage = src;
        self.dst_stage = dst;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferTransition {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// One attachment of a dynamic-rendering scope.
#[derive(Clone, Copy)]
pub struct RenderingAttachment {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear: vk::ClearValue,
}

impl RenderingAttachment {
    /// Color attachment cleared to `rgba` and stored.
    pub fn color(view: vk::ImageView, layout: vk::ImageLayout, rgba: [f32; 4]) -> Self {
        Self {
            view,
            layout,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            clear: vk::ClearValue {
                color: vk::ClearColorValue { float32: rgba },
            },
        }
    }

    /// Depth attachment cleared to `depth`; contents are not kept.
    pub fn depth(view: vk::ImageView, layout: vk::ImageLayout, depth: f32) -> Self {
        Self {
            view,
            layout,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            clear: vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
            },
        }
    }

    /// Keeps the previous contents instead of clearing.
    pub fn load(mut self) -> Self {
        self.load_op = vk::AttachmentLoadOp::LOAD;
        self
    }

    fn info(&self) -> vk::RenderingAttachmentInfo {
        vk::RenderingAttachmentInfo::builder()
            .image_view(self.view)
            .image_layout(self.layout)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .clear_value(self.clear)
            .build()
    }
}

/// Whole-extent copy between a tightly packed buffer and mip 0, layer 0 of one aspect.
pub fn buffer_image_region(
    aspect: vk::ImageAspectFlags,
    extent: vk::Extent2D,
) -> vk::BufferImageCopy {
    vk::BufferImageCopy::builder()
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: aspect,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        })
        .image_extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .build()
}

/// Full-extent blit region for mip 0, layer 0.
pub fn blit_region(
    src_aspect: vk::ImageAspectFlags,
    src_extent: vk::Extent2D,
    dst_aspect: vk::ImageAspectFlags,
    dst_extent: vk::Extent2D,
) -> vk::ImageBlit {
    let layers = |aspect_mask| vk::ImageSubresourceLayers {
        aspect_mask,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    };
    let corner = |extent: vk::Extent2D| vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    };
    vk::ImageBlit {
        src_subresource: layers(src_aspect),
        src_offsets: [vk::Offset3D::default(), corner(src_extent)],
        dst_subresource: layers(dst_aspect),
        dst_offsets: [vk::Offset3D::default(), corner(dst_extent)],
    }
}

pub struct CommandRecorder<'a> {
    ctx: &'a DeviceContext,
    cmd: vk::CommandBuffer,
    ended: bool,
}

impl<'a> CommandRecorder<'a> {
    pub(crate) fn new(ctx: &'a DeviceContext, cmd: vk::CommandBuffer) -> Self {
        Self {
            ctx,
            cmd,
            ended: false,
        }
    }

    pub(crate) fn finish(mut self) -> Result<()> {
        self.ended = true;
        unsafe { self.ctx.raw().end_command_buffer(self.cmd) }.at("vkEndCommandBuffer")
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.cmd
    }

    fn device(&self) -> &ash::Device {
        self.ctx.raw()
    }

    pub fn transition_image(&mut self, image: &Image, transition: ImageTransition) {
        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(transition.src_access)
            .dst_access_mask(transition.dst_access)
            .old_layout(transition.old_layout)
            .new_layout(transition.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.raw())
            .subresource_range(image.subresource_range())
            .build();
        unsafe {
            self.device().cmd_pipeline_barrier(
                self.cmd,
                transition.src_stage,
                transition.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            )
        };
    }

    pub fn transition_buffer(&mut self, buffer: &Buffer, transition: BufferTransition) {
        let barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(transition.src_access)
            .dst_access_mask(transition.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer.raw())
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe {
            self.device().cmd_pipeline_barrier(
                self.cmd,
                transition.src_stage,
                transition.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            )
        };
    }

    /// Binds `pipeline` and the current generation of each of its descriptor sets.
    pub fn bind_pipeline(&mut self, pipeline: &Pipeline) {
        let bind_point = pipeline.bind_point();
        unsafe {
            self.device()
                .cmd_bind_pipeline(self.cmd, bind_point, pipeline.raw());
        }
        let sets = pipeline.bound_sets();
        if !sets.is_empty() {
            unsafe {
                self.device().cmd_bind_descriptor_sets(
                    self.cmd,
                    bind_point,
                    pipeline.layout(),
                    0,
                    &sets,
                    &[],
                );
            }
        }
    }

    /// Writes `value` at the start of `pipeline`'s push-constant range `range`.
    pub fn push_constants<T: Pod>(&mut self, pipeline: &Pipeline, range: usize, value: &T) -> Result<()> {
        let bytes = bytemuck::bytes_of(value);
        let declared = pipeline
            .push_constant_range(range)
            .filter(|r| bytes.len() as u32 <= r.size)
            .ok_or(CoreError::UnknownPushConstantRange(range))?;
        unsafe {
            self.device().cmd_push_constants(
                self.cmd,
                pipeline.layout(),
                declared.stage_flags,
                declared.offset,
                bytes,
            );
        }
        Ok(())
    }

    pub fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[&Buffer]) {
        let handles: Vec<vk::Buffer> = buffers.iter().map(|b| b.raw()).collect();
        let offsets = vec![0; handles.len()];
        unsafe {
            self.device()
                .cmd_bind_vertex_buffers(self.cmd, first_binding, &handles, &offsets)
        };
    }

    pub fn bind_index_buffer(&mut self, buffer: &Buffer, index_type: vk::IndexType) {
        unsafe {
            self.device()
                .cmd_bind_index_buffer(self.cmd, buffer.raw(), 0, index_type)
        };
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.device().cmd_draw(
                self.cmd,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        };
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device().cmd_draw_indexed(
                self.cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        unsafe { self.device().cmd_dispatch(self.cmd, x, y, z) };
    }

    /// Sets the dynamic viewport and scissor to `area`.
    pub fn set_render_area(&mut self, area: vk::Rect2D) {
        let viewport = vk::Viewport {
            x: area.offset.x as f32,
            y: area.offset.y as f32,
            width: area.extent.width as f32,
            height: area.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            self.device().cmd_set_viewport(self.cmd, 0, &[viewport]);
            self.device().cmd_set_scissor(self.cmd, 0, &[area]);
        }
    }

    /// Scales the whole of `src` onto the whole of `dst` with linear filtering.
    pub fn blit(
        &mut self,
        src: &Image,
        src_layout: vk::ImageLayout,
        dst: &Image,
        dst_layout: vk::ImageLayout,
    ) {
        self.blit_extents(src, src_layout, src.extent(), dst, dst_layout, dst.extent());
    }

    /// Blits the `src_extent` corner of `src` onto the `dst_extent` corner of `dst`.
    pub fn blit_extents(
        &mut self,
        src: &Image,
        src_layout: vk::ImageLayout,
        src_extent: vk::Extent2D,
        dst: &Image,
        dst_layout: vk::ImageLayout,
        dst_extent: vk::Extent2D,
    ) {
        let region = blit_region(src.aspect(), src_extent, dst.aspect(), dst_extent);
        unsafe {
            self.device().cmd_blit_image(
                self.cmd,
                src.raw(),
                src_layout,
                dst.raw(),
                dst_layout,
                &[region],
                vk::Filter::LINEAR,
            )
        };
    }

    pub fn copy_buffer(&mut self, src: &Buffer, dst: &Buffer, size: vk::DeviceSize) {
        let region = vk::BufferCopy::builder()
            .size(size.min(src.size()).min(dst.size()))
            .build();
        unsafe {
            self.device()
                .cmd_copy_buffer(self.cmd, src.raw(), dst.raw(), &[region])
        };
    }

    /// Reads the whole of `src` back into `dst`, tightly packed.
    pub fn copy_image_to_buffer(
        &mut self,
        src: &Image,
        src_layout: vk::ImageLayout,
        dst: &Buffer,
    ) -> Result<()> {
        let aspect = crate::image::upload_aspect(src.format())?;
        let region = buffer_image_region(aspect, src.extent());
        unsafe {
            self.device()
                .cmd_copy_image_to_buffer(self.cmd, src.raw(), src_layout, dst.raw(), &[region])
        };
        Ok(())
    }

    pub fn begin_render_pass(
        &mut self,
        render_pass: &RenderPass,
        framebuffer: vk::Framebuffer,
        area: vk::Rect2D,
        clears: &[vk::ClearValue],
    ) {
        let begin = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass.raw())
            .framebuffer(framebuffer)
            .render_area(area)
            .clear_values(clears);
        unsafe {
            self.device()
                .cmd_begin_render_pass(self.cmd, &begin, vk::SubpassContents::INLINE)
        };
    }

    pub fn end_render_pass(&mut self) {
        unsafe { self.device().cmd_end_render_pass(self.cmd) };
    }

    /// Opens a dynamic-rendering scope over `colors` and an optional depth attachment.
    pub fn begin_rendering(
        &mut self,
        colors: &[RenderingAttachment],
        depth: Option<&RenderingAttachment>,
        area: vk::Rect2D,
    ) -> Result<()> {
        if !self.ctx.dynamic_rendering() {
            return Err(CoreError::DynamicRenderingUnsupported);
        }
        let color_infos: Vec<vk::RenderingAttachmentInfo> =
            colors.iter().map(RenderingAttachment::info).collect();
        let depth_info = depth.map(RenderingAttachment::info);
        let mut info = vk::RenderingInfo::builder()
            .render_area(area)
            .layer_count(1)
            .color_attachments(&color_infos);
        if let Some(depth_info) = depth_info.as_ref() {
            info = info.depth_attachment(depth_info);
        }
        unsafe { self.device().cmd_begin_rendering(self.cmd, &info) };
        Ok(())
    }

    pub fn end_rendering(&mut self) {
        unsafe { self.device().cmd_end_rendering(self.cmd) };
    }
}

impl Drop for CommandRecorder<'_> {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        // Unwinding out of the recording body.
        if let Err(e) = unsafe { self.ctx.raw().end_command_buffer(self.cmd) } {
            warn!("vkEndCommandBuffer failed while unwinding: {:?}", e);
        }
    }
}
