//! Graphics and compute pipelines with their descriptor state.

use crate::descriptor::{DescriptorBinding, DescriptorResource, DescriptorState};
use crate::device::{DeviceContext, LogicalDevice};
use crate::error::{CoreError, Result, VkResultExt};
use crate::render_pass::RenderPass;
use crate::shader::ShaderModule;
use ash::vk;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: vk::Format,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexInputBinding {
    pub binding: u32,
    pub stride: u32,
    pub rate: vk::VertexInputRate,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexInputBinding {
    /// Per-vertex binding with attributes at consecutive locations starting
    /// at 0, packed in `formats` order. A format without a known size fails
    /// with [`CoreError::UnsupportedVertexFormat`] instead of overlapping the
    /// next attribute.
    pub fn packed(binding: u32, formats: &[vk::Format]) -> Result<Self> {
        let mut offset = 0;
        let mut attributes = Vec::with_capacity(formats.len());
        for (location, &format) in formats.iter().enumerate() {
            let size = format_size(format).ok_or(CoreError::UnsupportedVertexFormat(format))?;
            attributes.push(VertexAttribute {
                location: location as u32,
                format,
                offset,
            });
            offset += size;
        }
        Ok(Self {
            binding,
            stride: offset,
            rate: vk::VertexInputRate::VERTEX,
            attributes,
        })
    }
}

/// Byte size of the vertex formats this module packs.
pub fn format_size(format: vk::Format) -> Option<u32> {
    let size = match format {
        vk::Format::R32_SFLOAT | vk::Format::R32_UINT | vk::Format::R32_SINT => 4,
        vk::Format::R8G8B8A8_UNORM | vk::Format::B8G8R8A8_UNORM => 4,
        vk::Format::R32G32_SFLOAT | vk::Format::R32G32_UINT => 8,
        vk::Format::R32G32B32_SFLOAT | vk::Format::R32G32B32_UINT => 12,
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => 16,
        _ => return None,
    };
    Some(size)
}

/// What a graphics pipeline renders into.
#[derive(Clone, Copy)]
pub enum RenderTarget<'a> {
    /// Dynamic rendering; `depth_format` is `UNDEFINED` when there is no depth.
    Dynamic {
        color_formats: &'a [vk::Format],
        depth_format: vk::Format,
    },
    Pass {
        render_pass: &'a RenderPass,
        subpass: u32,
    },
}

impl RenderTarget<'_> {
    pub fn has_depth(&self) -> bool {
        match self {
            RenderTarget::Dynamic { depth_format, .. } => *depth_format != vk::Format::UNDEFINED,
            RenderTarget::Pass { render_pass, .. } => render_pass.has_depth(),
        }
    }

    fn color_count(&self) -> usize {
        match self {
            RenderTarget::Dynamic { color_formats, .. } => color_formats.len(),
            RenderTarget::Pass { render_pass, .. } => render_pass.color_count(),
        }
    }
}

pub struct GraphicsPipelineDesc<'a> {
    pub stages: Vec<&'a ShaderModule>,
    pub vertex_bindings: Vec<VertexInputBinding>,
    pub sets: Vec<Vec<DescriptorBinding>>,
    pub push_constants: Vec<vk::PushConstantRange>,
    pub topology: vk::PrimitiveTopology,
    pub target: RenderTarget<'a>,
}

impl<'a> GraphicsPipelineDesc<'a> {
    pub fn new(stages: &[&'a ShaderModule], target: RenderTarget<'a>) -> Self {
        Self {
            stages: stages.to_vec(),
            vertex_bindings: Vec::new(),
            sets: Vec::new(),
            push_constants: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            target,
        }
    }

    pub fn vertex_binding(mut self, binding: VertexInputBinding) -> Self {
        self.vertex_bindings.push(binding);
        self
    }

    /// Declares the next descriptor set.
    pub fn set(mut self, bindings: Vec<DescriptorBinding>) -> Self {
        self.sets.push(bindings);
        self
    }

    pub fn push_constant(mut self, stages: vk::ShaderStageFlags, offset: u32, size: u32) -> Self {
        self.push_constants.push(vk::PushConstantRange {
            stage_flags: stages,
            offset,
            size,
        });
        self
    }

    pub fn topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }
}

/// Straight-alpha source-over blending on all color channels.
pub fn alpha_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::TRUE,
        src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ZERO,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: vk::ColorComponentFlags::RGBA,
    }
}

pub struct Pipeline {
    ctx: Arc<DeviceContext>,
    raw: vk::Pipeline,
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
    push_constants: Vec<vk::PushConstantRange>,
    descriptors: DescriptorState,
}

impl Pipeline {
    fn create_layout(
        ctx: &Arc<DeviceContext>,
        sets: &[Vec<DescriptorBinding>],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<(DescriptorState, vk::PipelineLayout)> {
        let descriptors = DescriptorState::new(ctx, sets, ctx.descriptor_generations())?;
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(descriptors.layouts())
            .push_constant_ranges(push_constants);
        let layout = unsafe { ctx.raw().create_pipeline_layout(&layout_info, None) }
            .at("vkCreatePipelineLayout")?;
        Ok((descriptors, layout))
    }

    pub fn graphics(device: &LogicalDevice, desc: &GraphicsPipelineDesc<'_>) -> Result<Self> {
        let ctx = device.context();
        if matches!(desc.target, RenderTarget::Dynamic { .. }) && !ctx.dynamic_rendering() {
            return Err(CoreError::DynamicRenderingUnsupported);
        }
        let (descriptors, layout) = Self::create_layout(ctx, &desc.sets, &desc.push_constants)?;

        let stages: Vec<vk::PipelineShaderStageCreateInfo> =
            desc.stages.iter().map(|s| s.stage_info()).collect();

        let binding_descriptions: Vec<vk::VertexInputBindingDescription> = desc
            .vertex_bindings
            .iter()
            .map(|b| vk::VertexInputBindingDescription {
                binding: b.binding,
                stride: b.stride,
                input_rate: b.rate,
            })
            .collect();
        let attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = desc
            .vertex_bindings
            .iter()
            .flat_map(|b| {
                b.attributes.iter().map(move |a| vk::VertexInputAttributeDescription {
                    location: a.location,
                    binding: b.binding,
                    format: a.format,
                    offset: a.offset,
                })
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(desc.topology)
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic; only the counts are fixed here.
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::CLOCKWISE);

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_enabled = desc.target.has_depth();
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(depth_enabled)
            .depth_write_enable(depth_enabled)
            .depth_compare_op(vk::CompareOp::LESS);

        let blend_attachments = vec![alpha_blend_attachment(); desc.target.color_count()];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&blend_attachments);

        let mut rendering_info;
        let mut create_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout);

        match desc.target {
            RenderTarget::Dynamic {
                color_formats,
                depth_format,
            } => {
                rendering_info = vk::PipelineRenderingCreateInfo::builder()
                    .color_attachment_formats(color_formats)
                    .depth_attachment_format(depth_format);
                create_info = create_info.push_next(&mut rendering_info);
            }
            RenderTarget::Pass {
                render_pass,
                subpass,
            } => {
                create_info = create_info
                    .render_pass(render_pass.raw())
                    .subpass(subpass);
            }
        }

        let raw = match unsafe {
            ctx.raw().create_graphics_pipelines(
                vk::PipelineCache::null(),
                &[create_info.build()],
                None,
            )
        } {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { ctx.raw().destroy_pipeline_layout(layout, None) };
                return Err(e).at("vkCreateGraphicsPipelines");
            }
        };

        info!(
            "Graphics pipeline created: {} stage(s), {} set(s), depth: {}.",
            stages.len(),
            desc.sets.len(),
            depth_enabled
        );
        Ok(Self {
            ctx: Arc::clone(ctx),
            raw,
            layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            push_constants: desc.push_constants.clone(),
            descriptors,
        })
    }

    pub fn compute(
        device: &LogicalDevice,
        shader: &ShaderModule,
        sets: &[Vec<DescriptorBinding>],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let ctx = device.context();
        let (descriptors, layout) = Self::create_layout(ctx, sets, push_constants)?;
        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(shader.stage_info())
            .layout(layout);
        let raw = match unsafe {
            ctx.raw().create_compute_pipelines(
                vk::PipelineCache::null(),
                &[create_info.build()],
                None,
            )
        } {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { ctx.raw().destroy_pipeline_layout(layout, None) };
                return Err(e).at("vkCreateComputePipelines");
            }
        };
        info!("Compute pipeline created: {} set(s).", sets.len());
        Ok(Self {
            ctx: Arc::clone(ctx),
            raw,
            layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
            push_constants: push_constants.to_vec(),
            descriptors,
        })
    }

    pub fn raw(&self) -> vk::Pipeline {
        self.raw
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    pub fn push_constant_range(&self, index: usize) -> Option<&vk::PushConstantRange> {
        self.push_constants.get(index)
    }

    pub fn descriptors(&self) -> &DescriptorState {
        &self.descriptors
    }

    /// Moves `set` to its next generation. Call once per use, before writing.
    pub fn advance(&mut self, set: usize) -> Result<()> {
        self.descriptors.advance(set)
    }

    /// Writes into the current generation of `set`.
    pub fn write(&self, set: usize, binding: u32, resource: DescriptorResource) -> Result<()> {
        self.descriptors.write(set, binding, resource)
    }

    /// Current generation of every declared set.
    pub fn bound_sets(&self) -> Vec<vk::DescriptorSet> {
        self.descriptors.generations().bound()
    }

    /// Binds this pipeline and its current descriptor generations.
    pub fn bind(&self, recorder: &mut crate::command::CommandRecorder<'_>) {
        recorder.bind_pipeline(self);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.ctx.raw().destroy_pipeline(self.raw, None);
            self.ctx.raw().destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_binding_offsets_and_stride() {
        let binding = VertexInputBinding::packed(
            0,
            &[vk::Format::R32G32B32_SFLOAT, vk::Format::R32G32B32_SFLOAT],
        )
        .unwrap();
        assert_eq!(binding.stride, 24);
        let offsets: Vec<(u32, u32)> = binding
            .attributes
            .iter()
            .map(|a| (a.location, a.offset))
            .collect();
        assert_eq!(offsets, vec![(0, 0), (1, 12)]);
        assert_eq!(binding.rate, vk::VertexInputRate::VERTEX);
    }

    #[test]
    fn unsized_vertex_formats_are_rejected() {
        assert_eq!(format_size(vk::Format::D32_SFLOAT), None);
        let packed = VertexInputBinding::packed(
            0,
            &[vk::Format::R32G32_SFLOAT, vk::Format::D32_SFLOAT, vk::Format::R32_SFLOAT],
        );
        assert!(matches!(
            packed,
            Err(CoreError::UnsupportedVertexFormat(vk::Format::D32_SFLOAT))
        ));
    }

    #[test]
    fn blending_is_source_over() {
        let blend = alpha_blend_attachment();
        assert_eq!(blend.blend_enable, vk::TRUE);
        assert_eq!(blend.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(blend.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
    }

    #[test]
    fn dynamic_target_depth_follows_format() {
        let formats = [vk::Format::B8G8R8A8_SRGB];
        let without = RenderTarget::Dynamic {
            color_formats: &formats,
            depth_format: vk::Format::UNDEFINED,
        };
        let with = RenderTarget::Dynamic {
            color_formats: &formats,
            depth_format: vk::Format::D32_SFLOAT,
        };
        assert!(!without.has_depth());
        assert!(with.has_depth());
        assert_eq!(with.color_count(), 1);
    }
}
