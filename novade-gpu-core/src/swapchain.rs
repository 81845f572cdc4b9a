use crate::config::PresentModePreference;
use crate::device::DeviceContext;
use crate::error::{Result, VkResultExt};
use crate::image::Image;
use crate::surface::Surface;
use ash::vk;
use std::sync::Arc;
use tracing::{debug, info};

/// Prefers sRGB BGRA, otherwise the first format the surface reports.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preference: PresentModePreference,
) -> vk::PresentModeKHR {
    let wanted = preference.as_vk();
    if available.contains(&wanted) {
        wanted
    } else {
        vk::PresentModeKHR::FIFO // always supported
    }
}

pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, wanted: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: wanted.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: wanted.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// The swap chain and its images, owned by the logical device.
pub struct Swapchain {
    ctx: Arc<DeviceContext>,
    loader: ash::extensions::khr::Swapchain,
    raw: vk::SwapchainKHR,
    format: vk::Format,
    color_space: vk::ColorSpaceKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    images: Vec<Image>,
}

impl Swapchain {
    pub(crate) fn new(
        ctx: &Arc<DeviceContext>,
        surface: &Surface,
        preference: PresentModePreference,
        old: vk::SwapchainKHR,
    ) -> Result<Self> {
        let physical = ctx.physical_device();
        let capabilities = surface.capabilities(physical)?;
        let formats = surface.formats(physical)?;
        let present_modes = surface.present_modes(physical)?;

        let surface_format = choose_surface_format(&formats)
            .ok_or(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)
            .at("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
        let present_mode = choose_present_mode(&present_modes, preference);
        let extent = choose_extent(&capabilities, surface.extent());
        let image_count = choose_image_count(&capabilities);

        let wanted_usage = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST;
        let usage = wanted_usage & capabilities.supported_usage_flags;
        if usage != wanted_usage {
            debug!(
                "Surface does not support swapchain usage {:?}.",
                wanted_usage & !capabilities.supported_usage_flags
            );
        }

        let loader = ash::extensions::khr::Swapchain::new(ctx.instance().raw(), ctx.raw());
        let families = ctx.families();
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(usage)
            .image_sharing_mode(ctx.sharing_mode())
            .queue_family_indices(families)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        let raw = unsafe { loader.create_swapchain(&create_info, None) }
            .at("vkCreateSwapchainKHR")?;

        let handles = match unsafe { loader.get_swapchain_images(raw) }.at("vkGetSwapchainImagesKHR") {
            Ok(handles) => handles,
            Err(e) => {
                unsafe { loader.destroy_swapchain(raw, None) };
                return Err(e);
            }
        };

        let mut images = Vec::with_capacity(handles.len());
        for handle in handles {
            match Image::from_swapchain(ctx, handle, surface_format.format, extent, usage) {
                Ok(image) => images.push(image),
                Err(e) => {
                    drop(images);
                    unsafe { loader.destroy_swapchain(raw, None) };
                    return Err(e);
                }
            }
        }

        info!(
            "Swapchain created: {} images, {:?}, {:?}, {}x{}.",
            images.len(),
            surface_format.format,
            present_mode,
            extent.width,
            extent.height
        );

        Ok(Self {
            ctx: Arc::clone(ctx),
            loader,
            raw,
            format: surface_format.format,
            color_space: surface_format.color_space,
            extent,
            present_mode,
            images,
        })
    }

    pub fn raw(&self) -> vk::SwapchainKHR {
        self.raw
    }

    pub(crate) fn loader(&self) -> &ash::extensions::khr::Swapchain {
        &self.loader
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.color_space
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn views(&self) -> Vec<vk::ImageView> {
        self.images.iter().map(Image::view).collect()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // Views go before the swapchain that owns their images.
        self.images.clear();
        unsafe { self.loader.destroy_swapchain(self.raw, None) };
        debug!("Swapchain destroyed (device {:?}).", self.ctx.raw().handle());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min_count: u32, max_count: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_count,
            max_image_count: max_count,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn srgb_bgra_is_preferred() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            choose_surface_format(&formats).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
        assert_eq!(
            choose_surface_format(&formats[..1]).map(|f| f.format),
            Some(vk::Format::R8G8B8A8_UNORM)
        );
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&available, PresentModePreference::Mailbox),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&available, PresentModePreference::Immediate),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn extent_follows_surface_or_clamps() {
        let wanted = vk::Extent2D {
            width: 10_000,
            height: 600,
        };
        assert_eq!(choose_extent(&caps((800, 600), 2, 3), wanted).width, 800);
        let clamped = choose_extent(&caps((u32::MAX, u32::MAX), 2, 3), wanted);
        assert_eq!((clamped.width, clamped.height), (4096, 600));
    }

    #[test]
    fn image_count_is_min_plus_one_within_max() {
        assert_eq!(choose_image_count(&caps((1, 1), 2, 0)), 3);
        assert_eq!(choose_image_count(&caps((1, 1), 2, 2)), 2);
    }
}
