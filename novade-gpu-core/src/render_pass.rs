//! Single-subpass render passes with a permutation-indexed framebuffer cache.
//!
//! When an attachment cycles through several concrete images (a swap chain),
//! one framebuffer is built for every combination of the supplied views and
//! the cache hands them back round-robin. Entries are only ever appended.

use crate::device::{DeviceContext, LogicalDevice};
use crate::error::{CoreError, Result, VkResultExt};
use crate::ring::Ring;
use ash::vk;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentRole {
    Input,
    Color,
    DepthStencil,
}

impl AttachmentRole {
    /// Layout the subpass uses the attachment in.
    pub fn subpass_layout(self) -> vk::ImageLayout {
        match self {
            AttachmentRole::Input => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            AttachmentRole::Color => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            AttachmentRole::DepthStencil => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDesc {
    pub role: AttachmentRole,
    pub format: vk::Format,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

impl AttachmentDesc {
    pub fn input(format: vk::Format, layout: vk::ImageLayout) -> Self {
        Self {
            role: AttachmentRole::Input,
            format,
            initial_layout: layout,
            final_layout: layout,
        }
    }

    pub fn color(format: vk::Format, initial_layout: vk::ImageLayout, final_layout: vk::ImageLayout) -> Self {
        Self {
            role: AttachmentRole::Color,
            format,
            initial_layout,
            final_layout,
        }
    }

    pub fn depth(format: vk::Format, initial_layout: vk::ImageLayout, final_layout: vk::ImageLayout) -> Self {
        Self {
            role: AttachmentRole::DepthStencil,
            format,
            initial_layout,
            final_layout,
        }
    }

    fn description(&self) -> vk::AttachmentDescription {
        let load_op = load_op_for(self.initial_layout);
        vk::AttachmentDescription::builder()
            .format(self.format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(load_op)
            .stencil_store_op(vk::AttachmentStoreOp::STORE)
            .initial_layout(self.initial_layout)
            .final_layout(self.final_layout)
            .build()
    }
}

/// Clear when the previous contents are undefined, load otherwise.
pub fn load_op_for(initial_layout: vk::ImageLayout) -> vk::AttachmentLoadOp {
    if initial_layout == vk::ImageLayout::UNDEFINED {
        vk::AttachmentLoadOp::CLEAR
    } else {
        vk::AttachmentLoadOp::LOAD
    }
}

/// External work before the subpass (vertex uploads, image acquisition) and
/// readers of its color/depth output after it.
pub fn subpass_dependencies() -> [vk::SubpassDependency; 2] {
    let attachment_writes = vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    let fragment_tests = vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    [
        // Uploads and the previous pass's attachment writes, including depth,
        // complete before this subpass reads or writes any attachment.
        vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::TRANSFER
                | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | fragment_tests,
            dst_stage_mask: vk::PipelineStageFlags::VERTEX_INPUT
                | vk::PipelineStageFlags::FRAGMENT_SHADER
                | fragment_tests
                | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags::TRANSFER_WRITE | attachment_writes,
            dst_access_mask: vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                | vk::AccessFlags::INPUT_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::empty(),
        },
        vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | fragment_tests,
            dst_stage_mask: vk::PipelineStageFlags::TRANSFER
                | vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            src_access_mask: attachment_writes,
            dst_access_mask: vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::MEMORY_READ,
            dependency_flags: vk::DependencyFlags::empty(),
        },
    ]
}

/// Every combination picking one item from each list, first list varying
/// fastest. Any empty list yields no combinations.
pub fn permutations<T: Copy>(lists: &[Vec<T>]) -> Vec<Vec<T>> {
    if lists.is_empty() || lists.iter().any(Vec::is_empty) {
        return Vec::new();
    }
    let total: usize = lists.iter().map(Vec::len).product();
    let mut out = Vec::with_capacity(total);
    for mut n in 0..total {
        let mut combination = Vec::with_capacity(lists.len());
        for list in lists {
            combination.push(list[n % list.len()]);
            n /= list.len();
        }
        out.push(combination);
    }
    out
}

struct CachedFramebuffer {
    views: Vec<vk::ImageView>,
    raw: vk::Framebuffer,
}

pub struct RenderPass {
    ctx: Arc<DeviceContext>,
    raw: vk::RenderPass,
    bind_point: vk::PipelineBindPoint,
    attachments: Vec<AttachmentDesc>,
    framebuffers: Ring<CachedFramebuffer>,
}

impl RenderPass {
    /// One subpass over `inputs`, then `colors`, then `depth`, in that
    /// attachment order.
    pub fn new(
        device: &LogicalDevice,
        bind_point: vk::PipelineBindPoint,
        inputs: &[AttachmentDesc],
        colors: &[AttachmentDesc],
        depth: Option<AttachmentDesc>,
    ) -> Result<Self> {
        let ctx = device.context();
        let attachments: Vec<AttachmentDesc> = inputs
            .iter()
            .chain(colors)
            .chain(depth.as_ref())
            .copied()
            .collect();
        let descriptions: Vec<vk::AttachmentDescription> =
            attachments.iter().map(AttachmentDesc::description).collect();

        let reference = |index: usize, desc: &AttachmentDesc| vk::AttachmentReference {
            attachment: index as u32,
            layout: desc.role.subpass_layout(),
        };
        let input_refs: Vec<vk::AttachmentReference> = inputs
            .iter()
            .enumerate()
            .map(|(i, d)| reference(i, d))
            .collect();
        let color_refs: Vec<vk::AttachmentReference> = colors
            .iter()
            .enumerate()
            .map(|(i, d)| reference(inputs.len() + i, d))
            .collect();
        let depth_ref = depth
            .as_ref()
            .map(|d| reference(inputs.len() + colors.len(), d));

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(bind_point)
            .input_attachments(&input_refs)
            .color_attachments(&color_refs);
        if let Some(depth_ref) = depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }
        let subpasses = [subpass.build()];
        let dependencies = subpass_dependencies();

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&descriptions)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let raw = unsafe { ctx.raw().create_render_pass(&create_info, None) }
            .at("vkCreateRenderPass")?;
        info!(
            "Render pass created: {} input, {} color, depth: {}.",
            inputs.len(),
            colors.len(),
            depth.is_some()
        );

        Ok(Self {
            ctx: Arc::clone(ctx),
            raw,
            bind_point,
            attachments,
            framebuffers: Ring::new("framebuffers", Vec::new()),
        })
    }

    pub fn raw(&self) -> vk::RenderPass {
        self.raw
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    pub fn attachments(&self) -> &[AttachmentDesc] {
        &self.attachments
    }

    pub fn color_count(&self) -> usize {
        self.attachments
            .iter()
            .filter(|a| a.role == AttachmentRole::Color)
            .count()
    }

    pub fn has_depth(&self) -> bool {
        self.attachments
            .iter()
            .any(|a| a.role == AttachmentRole::DepthStencil)
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    /// Builds one framebuffer per combination of `view_lists` (one list per
    /// attachment, in attachment order) and appends them to the cache.
    /// Returns the cache indices of the new entries.
    pub fn framebuffers(
        &mut self,
        view_lists: &[Vec<vk::ImageView>],
        extent: vk::Extent2D,
    ) -> Result<Range<usize>> {
        if view_lists.len() != self.attachments.len() {
            return Err(CoreError::AttachmentMismatch {
                expected: self.attachments.len(),
                got: view_lists.len(),
            });
        }
        let combinations = permutations(view_lists);
        let mut built = Vec::with_capacity(combinations.len());
        for views in combinations {
            let create_info = vk::FramebufferCreateInfo::builder()
                .render_pass(self.raw)
                .attachments(&views)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            match unsafe { self.ctx.raw().create_framebuffer(&create_info, None) }
                .at("vkCreateFramebuffer")
            {
                Ok(raw) => built.push(CachedFramebuffer { views, raw }),
                Err(e) => {
                    for fb in built {
                        unsafe { self.ctx.raw().destroy_framebuffer(fb.raw, None) };
                    }
                    return Err(e);
                }
            }
        }
        let range = self.framebuffers.append(built);
        debug!(
            "Cached {} framebuffer(s) at {}x{}; {} total.",
            range.len(),
            extent.width,
            extent.height,
            self.framebuffers.len()
        );
        Ok(range)
    }

    /// Next framebuffer in round-robin order.
    pub fn current(&mut self) -> Option<vk::Framebuffer> {
        self.framebuffers.next().map(|fb| fb.raw)
    }

    /// The cached framebuffer built from exactly `views`.
    pub fn framebuffer_for(&self, views: &[vk::ImageView]) -> Option<vk::Framebuffer> {
        self.framebuffers
            .iter()
            .find(|fb| fb.views == views)
            .map(|fb| fb.raw)
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        let framebuffers = std::mem::replace(&mut self.framebuffers, Ring::new("framebuffers", Vec::new()));
        unsafe {
            for fb in framebuffers.into_items() {
                self.ctx.raw().destroy_framebuffer(fb.raw, None);
            }
            self.ctx.raw().destroy_render_pass(self.raw, None);
        }
    }
}
