//! Memory-backed 2D images, their views and samplers.
//!
//! Swap-chain images use the same type but own no memory; only the view
//! (and an optional sampler) is destroyed with them.

use crate::buffer::Buffer;
use crate::device::{DeviceContext, LogicalDevice};
use crate::error::{CoreError, Result, VkResultExt};
use crate::memory::{Allocation, Visibility};
use ash::vk;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::debug;

/// Aspect implied by a format: depth and/or stencil for depth formats, color otherwise.
pub fn aspect_for(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Aspect a staged upload writes. Buffer-to-image copies address one aspect
/// per region and depth/stencil texels are packed separately, so formats with
/// both aspects are rejected.
pub fn upload_aspect(format: vk::Format) -> Result<vk::ImageAspectFlags> {
    let aspect = aspect_for(format);
    if aspect == vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL {
        return Err(CoreError::UnsupportedUploadFormat(format));
    }
    Ok(aspect)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub tiling: vk::ImageTiling,
}

impl ImageDesc {
    pub fn new(extent: vk::Extent2D, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            extent,
            format,
            usage,
            tiling: vk::ImageTiling::OPTIMAL,
        }
    }

    /// Linear tiling, required for host-mapped images.
    pub fn linear(mut self) -> Self {
        self.tiling = vk::ImageTiling::LINEAR;
        self
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_for(self.format)
    }
}

pub struct Image {
    ctx: Arc<DeviceContext>,
    raw: vk::Image,
    desc: ImageDesc,
    view: vk::ImageView,
    sampler: Option<vk::Sampler>,
    // None for swap-chain images.
    memory: Option<Allocation>,
}

impl Image {
    pub fn new(device: &LogicalDevice, desc: ImageDesc, visibility: Visibility) -> Result<Self> {
        let ctx = device.context();
        let usage = if visibility.is_host_visible() {
            desc.usage
        } else {
            desc.usage | vk::ImageUsageFlags::TRANSFER_DST
        };
        let desc = ImageDesc { usage, ..desc };

        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(ctx.sharing_mode())
            .queue_family_indices(ctx.families())
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let raw = unsafe { ctx.raw().create_image(&create_info, None) }.at("vkCreateImage")?;

        let requirements = unsafe { ctx.raw().get_image_memory_requirements(raw) };
        let memory = match Allocation::allocate(ctx, requirements, visibility) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { ctx.raw().destroy_image(raw, None) };
                return Err(e);
            }
        };
        if let Err(e) =
            unsafe { ctx.raw().bind_image_memory(raw, memory.memory(), 0) }.at("vkBindImageMemory")
        {
            unsafe { ctx.raw().destroy_image(raw, None) };
            return Err(e);
        }

        let view = match create_view(ctx, raw, &desc) {
            Ok(view) => view,
            Err(e) => {
                unsafe { ctx.raw().destroy_image(raw, None) };
                return Err(e);
            }
        };

        debug!(
            "Image created: {}x{} {:?}, {:?}.",
            desc.extent.width, desc.extent.height, desc.format, visibility
        );
        Ok(Self {
            ctx: Arc::clone(ctx),
            raw,
            desc,
            view,
            sampler: None,
            memory: Some(memory),
        })
    }

    /// Wraps an image owned by a swap chain.
    pub(crate) fn from_swapchain(
        ctx: &Arc<DeviceContext>,
        raw: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        let desc = ImageDesc::new(extent, format, usage);
        let view = create_view(ctx, raw, &desc)?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            raw,
            desc,
            view,
            sampler: None,
            memory: None,
        })
    }

    pub fn raw(&self) -> vk::Image {
        self.raw
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.desc.extent
    }

    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.desc.aspect()
    }

    /// Full-image subresource range (one mip, one layer).
    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect(),
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    /// Linear-filtered, edge-clamped sampler, created on first use.
    pub fn sampler(&mut self) -> Result<vk::Sampler> {
        if let Some(sampler) = self.sampler {
            return Ok(sampler);
        }
        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_lod(1.0)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);
        let sampler = unsafe { self.ctx.raw().create_sampler(&create_info, None) }
            .at("vkCreateSampler")?;
        self.sampler = Some(sampler);
        Ok(sampler)
    }

    pub fn map(&mut self) -> Result<NonNull<u8>> {
        self.memory.as_mut().ok_or(CoreError::NotHostVisible)?.map()
    }

    pub fn unmap(&mut self) {
        if let Some(memory) = self.memory.as_mut() {
            memory.unmap();
        }
    }

    pub fn mapped<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let memory = self.memory.as_mut().ok_or(CoreError::NotHostVisible)?;
        let len = memory.size() as usize;
        memory.mapped(len, f)
    }

    /// Fills mip 0 through a staging buffer and leaves the image in `final_layout`.
    ///
    /// `write` receives tightly packed rows. Blocks until the copy has completed.
    pub fn staged<R>(
        &self,
        final_layout: vk::ImageLayout,
        write: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let aspect = upload_aspect(self.desc.format)?;
        let size = match &self.memory {
            Some(memory) => memory.size(),
            None => return Err(CoreError::NotHostVisible),
        };
        let mut staging = Buffer::create(
            &self.ctx,
            vk::BufferUsageFlags::TRANSFER_SRC,
            Visibility::HostVisible,
            size,
        )?;
        let out = staging.mapped(write)?;
        self.ctx.stager().copy_buffer_to_image(
            self.ctx.raw(),
            staging.raw(),
            self.raw,
            self.desc.extent,
            aspect,
            final_layout,
        )?;
        Ok(out)
    }

    /// Uploads `pixels` with [`Image::staged`].
    pub fn upload(&self, pixels: &[u8], final_layout: vk::ImageLayout) -> Result<()> {
        self.staged(final_layout, |dst| {
            let len = pixels.len().min(dst.len());
            dst[..len].copy_from_slice(&pixels[..len]);
        })
    }
}

fn create_view(ctx: &DeviceContext, image: vk::Image, desc: &ImageDesc) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(desc.format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: desc.aspect(),
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    unsafe { ctx.raw().create_image_view(&create_info, None) }.at("vkCreateImageView")
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            if let Some(sampler) = self.sampler.take() {
                self.ctx.raw().destroy_sampler(sampler, None);
            }
            self.ctx.raw().destroy_image_view(self.view, None);
            if self.memory.is_some() {
                self.ctx.raw().destroy_image(self.raw, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(vk::Format::B8G8R8A8_SRGB, vk::ImageAspectFlags::COLOR)]
    #[case(vk::Format::D32_SFLOAT, vk::ImageAspectFlags::DEPTH)]
    #[case(
        vk::Format::D24_UNORM_S8_UINT,
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    )]
    fn aspect_follows_format(#[case] format: vk::Format, #[case] expected: vk::ImageAspectFlags) {
        assert_eq!(aspect_for(format), expected);
    }

    #[rstest]
    #[case(vk::Format::R8G8B8A8_UNORM, Some(vk::ImageAspectFlags::COLOR))]
    #[case(vk::Format::D32_SFLOAT, Some(vk::ImageAspectFlags::DEPTH))]
    #[case(vk::Format::S8_UINT, Some(vk::ImageAspectFlags::STENCIL))]
    #[case(vk::Format::D24_UNORM_S8_UINT, None)]
    #[case(vk::Format::D32_SFLOAT_S8_UINT, None)]
    fn uploads_write_a_single_aspect(
        #[case] format: vk::Format,
        #[case] expected: Option<vk::ImageAspectFlags>,
    ) {
        match (upload_aspect(format), expected) {
            (Ok(aspect), Some(expected)) => assert_eq!(aspect, expected),
            (Err(CoreError::UnsupportedUploadFormat(rejected)), None) => {
                assert_eq!(rejected, format)
            }
            (other, _) => panic!("unexpected result for {format:?}: {other:?}"),
        }
    }

    #[test]
    fn desc_defaults_to_optimal_tiling() {
        let desc = ImageDesc::new(
            vk::Extent2D {
                width: 4,
                height: 4,
            },
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
        );
        assert_eq!(desc.tiling, vk::ImageTiling::OPTIMAL);
        assert_eq!(desc.linear().tiling, vk::ImageTiling::LINEAR);
    }
}
