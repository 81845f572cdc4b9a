//! Presentable surface supplied by the windowing layer.
//!
//! The core never creates windows. It only needs a `VkSurfaceKHR`, a
//! per-family presentation query and the framebuffer extent, which the
//! windowing layer keeps current through [`Surface::set_extent`].

use crate::error::{Result, VkResultExt};
use crate::instance::Instance;
use ash::vk;
use std::ffi::CStr;
use std::sync::Arc;
use tracing::info;

pub struct Surface {
    instance: Arc<Instance>,
    raw: vk::SurfaceKHR,
    extent: vk::Extent2D,
}

impl Surface {
    /// Takes ownership of a surface created by the windowing layer on `instance`.
    pub fn from_raw(instance: Arc<Instance>, raw: vk::SurfaceKHR, extent: vk::Extent2D) -> Self {
        Self {
            instance,
            raw,
            extent,
        }
    }

    /// Instance extension required by [`Surface::headless`].
    pub fn headless_extension_name() -> &'static CStr {
        vk::ExtHeadlessSurfaceFn::name()
    }

    /// Creates a `VK_EXT_headless_surface` surface. The instance must have been
    /// created with [`Surface::headless_extension_name`] enabled.
    pub fn headless(instance: Arc<Instance>, extent: vk::Extent2D) -> Result<Self> {
        let fp = vk::ExtHeadlessSurfaceFn::load(|name| unsafe {
            std::mem::transmute(
                instance
                    .entry()
                    .get_instance_proc_addr(instance.raw().handle(), name.as_ptr()),
            )
        });
        let create_info = vk::HeadlessSurfaceCreateInfoEXT::builder();
        let mut raw = vk::SurfaceKHR::null();
        unsafe {
            (fp.create_headless_surface_ext)(
                instance.raw().handle(),
                &*create_info,
                std::ptr::null(),
                &mut raw,
            )
        }
        .result()
        .at("vkCreateHeadlessSurfaceEXT")?;
        info!("Headless surface created ({}x{}).", extent.width, extent.height);
        Ok(Self {
            instance,
            raw,
            extent,
        })
    }

    #[cfg(feature = "wayland")]
    pub fn wayland_extension_name() -> &'static CStr {
        ash::extensions::khr::WaylandSurface::name()
    }

    /// Creates a surface from raw `wl_display` / `wl_surface` pointers.
    ///
    /// # Safety
    ///
    /// Both pointers must be valid and outlive the returned surface.
    #[cfg(feature = "wayland")]
    pub unsafe fn wayland(
        instance: Arc<Instance>,
        display: *mut std::ffi::c_void,
        surface: *mut std::ffi::c_void,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let loader = ash::extensions::khr::WaylandSurface::new(instance.entry(), instance.raw());
        let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
            .display(display)
            .surface(surface);
        let raw = loader
            .create_wayland_surface(&create_info, None)
            .at("vkCreateWaylandSurfaceKHR")?;
        info!("Wayland surface created.");
        Ok(Self {
            instance,
            raw,
            extent,
        })
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.raw
    }

    /// Framebuffer extent as last reported by the windowing layer.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn set_extent(&mut self, extent: vk::Extent2D) {
        self.extent = extent;
    }

    pub fn supports_present(&self, physical: vk::PhysicalDevice, family: u32) -> Result<bool> {
        unsafe {
            self.instance
                .surface_loader()
                .get_physical_device_surface_support(physical, family, self.raw)
        }
        .at("vkGetPhysicalDeviceSurfaceSupportKHR")
    }

    pub fn capabilities(&self, physical: vk::PhysicalDevice) -> Result<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.instance
                .surface_loader()
                .get_physical_device_surface_capabilities(physical, self.raw)
        }
        .at("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")
    }

    pub fn formats(&self, physical: vk::PhysicalDevice) -> Result<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.instance
                .surface_loader()
                .get_physical_device_surface_formats(physical, self.raw)
        }
        .at("vkGetPhysicalDeviceSurfaceFormatsKHR")
    }

    pub fn present_modes(&self, physical: vk::PhysicalDevice) -> Result<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.instance
                .surface_loader()
                .get_physical_device_surface_present_modes(physical, self.raw)
        }
        .at("vkGetPhysicalDeviceSurfacePresentModesKHR")
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.instance.surface_loader().destroy_surface(self.raw, None);
        }
        info!("Vulkan surface destroyed.");
    }
}
