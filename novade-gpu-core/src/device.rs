//! Logical device construction.
//!
//! [`DeviceBuilder`] collects queue requests and is consumed by
//! [`DeviceBuilder::finalize`], which builds the `VkDevice` from the distinct
//! families actually requested and then the swap chain. Queue handles only
//! exist on the resulting [`LogicalDevice`], so no queue can be used before
//! the device is finalized.

use crate::adapter::{AdapterContext, QueueRequest};
use crate::config::{CoreConfig, PresentModePreference};
use crate::error::{CoreError, Result, VkResultExt};
use crate::image::Image;
use crate::queue::Queue;
use crate::staging::Stager;
use crate::surface::Surface;
use crate::swapchain::Swapchain;
use crate::sync::{Fence, Semaphore};
use ash::vk;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Distinct families in first-seen order.
pub fn distinct_families(requested: &[u32]) -> Vec<u32> {
    let mut families = Vec::with_capacity(requested.len());
    for &family in requested {
        if !families.contains(&family) {
            families.push(family);
        }
    }
    families
}

/// Dynamic rendering is core from Vulkan 1.3 but still an optional feature bit.
pub fn dynamic_rendering_supported(api_version: u32, feature: vk::Bool32) -> bool {
    let major = vk::api_version_major(api_version);
    let minor = vk::api_version_minor(api_version);
    (major > 1 || (major == 1 && minor >= 3)) && feature == vk::TRUE
}

/// Resources touched by more than one family are shared concurrently.
pub fn sharing_mode(families: &[u32]) -> vk::SharingMode {
    if families.len() > 1 {
        vk::SharingMode::CONCURRENT
    } else {
        vk::SharingMode::EXCLUSIVE
    }
}

/// The `VkDevice` and the state every GPU object needs to destroy itself.
///
/// Held behind an `Arc` by each buffer, image, queue, pipeline and render
/// pass, so the device is destroyed after all of them.
pub struct DeviceContext {
    instance: Arc<crate::instance::Instance>,
    physical: vk::PhysicalDevice,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    raw: ash::Device,
    families: Vec<u32>,
    stager: Mutex<Stager>,
    descriptor_generations: usize,
    command_ring_size: usize,
    dynamic_rendering: bool,
}

impl DeviceContext {
    pub fn raw(&self) -> &ash::Device {
        &self.raw
    }

    pub fn instance(&self) -> &Arc<crate::instance::Instance> {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Every family a queue was created on, in request order.
    pub fn families(&self) -> &[u32] {
        &self.families
    }

    pub fn sharing_mode(&self) -> vk::SharingMode {
        sharing_mode(&self.families)
    }

    pub fn descriptor_generations(&self) -> usize {
        self.descriptor_generations
    }

    pub fn command_ring_size(&self) -> usize {
        self.command_ring_size
    }

    /// Whether `vkCmdBeginRendering` and render-pass-less pipelines are usable.
    pub fn dynamic_rendering(&self) -> bool {
        self.dynamic_rendering
    }

    pub(crate) fn stager(&self) -> MutexGuard<'_, Stager> {
        self.stager
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.raw.device_wait_idle() }.at("vkDeviceWaitIdle")
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.raw.device_wait_idle() {
                warn!("vkDeviceWaitIdle failed during device teardown: {:?}", e);
            }
            self.stager
                .get_mut()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .destroy(&self.raw);
            self.raw.destroy_device(None);
        }
        info!("Logical device destroyed.");
    }
}

/// Handle for a queue requested before finalize; redeemed with
/// [`LogicalDevice::take_queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTicket(usize);

pub struct DeviceBuilder {
    adapter: AdapterContext,
    surface: Option<Surface>,
    present_mode: PresentModePreference,
    descriptor_generations: usize,
    command_ring_size: usize,
    requested: Vec<u32>,
}

impl DeviceBuilder {
    /// Fails with [`CoreError::Config`] when `config` does not validate, so ring
    /// sizes of zero never reach queue or pipeline construction.
    pub fn new(
        adapter: AdapterContext,
        surface: Option<Surface>,
        config: &CoreConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            adapter,
            surface,
            present_mode: config.present_mode,
            descriptor_generations: config.descriptor_generations,
            command_ring_size: config.command_ring_size,
            requested: Vec::new(),
        })
    }

    pub fn adapter(&self) -> &AdapterContext {
        &self.adapter
    }

    /// Binds a queue to the first family satisfying `request`.
    pub fn request_queue(&mut self, request: QueueRequest) -> Result<QueueTicket> {
        if request.present && self.surface.is_none() {
            return Err(CoreError::NoSurface);
        }
        let family = self
            .adapter
            .find_queue_family(request)
            .ok_or(CoreError::QueueFamilyNotFound {
                flags: request.flags,
                present: request.present,
            })?;
        debug!(
            "Queue request {:?} (present: {}) bound to family {}.",
            request.flags, request.present, family
        );
        self.requested.push(family);
        Ok(QueueTicket(self.requested.len() - 1))
    }

    /// Builds the device, its queues and, when a surface was given, the swap chain.
    pub fn finalize(self) -> Result<LogicalDevice> {
        let DeviceBuilder {
            adapter,
            surface,
            present_mode,
            descriptor_generations,
            command_ring_size,
            requested,
        } = self;

        let staging_family = adapter
            .find_queue_family(QueueRequest::transfer())
            .or_else(|| {
                adapter.find_queue_family(QueueRequest::new(
                    vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                ))
            })
            .ok_or(CoreError::QueueFamilyNotFound {
                flags: vk::QueueFlags::TRANSFER,
                present: false,
            })?;

        let mut all = requested.clone();
        all.push(staging_family);
        let families = distinct_families(&all);
        info!("Creating logical device over queue families {:?}.", families);

        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let mut extensions = Vec::new();
        if surface.is_some() {
            extensions.push(ash::extensions::khr::Swapchain::name().as_ptr());
        }

        let instance = Arc::clone(adapter.instance());
        let dynamic_rendering = {
            let mut supported = vk::PhysicalDeviceDynamicRenderingFeatures::default();
            if adapter.properties().api_version >= vk::API_VERSION_1_3 {
                let mut query = vk::PhysicalDeviceFeatures2::builder().push_next(&mut supported);
                unsafe {
                    instance
                        .raw()
                        .get_physical_device_features2(adapter.physical_device(), &mut query)
                };
            }
            dynamic_rendering_supported(
                adapter.properties().api_version,
                supported.dynamic_rendering,
            )
        };
        if !dynamic_rendering {
            warn!("Dynamic rendering unavailable; only render-pass targets can be used.");
        }

        let features = vk::PhysicalDeviceFeatures::builder();
        let mut enabled =
            vk::PhysicalDeviceDynamicRenderingFeatures::builder().dynamic_rendering(true);
        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);
        if dynamic_rendering {
            create_info = create_info.push_next(&mut enabled);
        }

        let raw = unsafe {
            instance
                .raw()
                .create_device(adapter.physical_device(), &create_info, None)
        }
        .at("vkCreateDevice")?;

        let stager = match Stager::new(&raw, staging_family) {
            Ok(stager) => stager,
            Err(e) => {
                unsafe { raw.destroy_device(None) };
                return Err(e);
            }
        };

        let ctx = Arc::new(DeviceContext {
            instance,
            physical: adapter.physical_device(),
            memory_properties: *adapter.memory_properties(),
            raw,
            families,
            stager: Mutex::new(stager),
            descriptor_generations,
            command_ring_size,
            dynamic_rendering,
        });
        info!("Logical device created on {}.", adapter.device_name());

        let mut queues = Vec::with_capacity(requested.len());
        for &family in &requested {
            queues.push(Some(Queue::new(&ctx, family)?));
        }

        let swapchain = match &surface {
            Some(surface) => Some(Swapchain::new(
                &ctx,
                surface,
                present_mode,
                vk::SwapchainKHR::null(),
            )?),
            None => None,
        };

        Ok(LogicalDevice {
            swapchain,
            surface,
            queues,
            present_mode,
            ctx,
            adapter,
        })
    }
}

pub struct LogicalDevice {
    // Destroyed before the surface it was built from.
    swapchain: Option<Swapchain>,
    surface: Option<Surface>,
    queues: Vec<Option<Queue>>,
    present_mode: PresentModePreference,
    ctx: Arc<DeviceContext>,
    adapter: AdapterContext,
}

impl LogicalDevice {
    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    pub fn adapter(&self) -> &AdapterContext {
        &self.adapter
    }

    pub fn surface(&self) -> Option<&Surface> {
        self.surface.as_ref()
    }

    pub fn surface_mut(&mut self) -> Option<&mut Surface> {
        self.surface.as_mut()
    }

    /// Hands the requested queue to the caller. Each ticket redeems once.
    pub fn take_queue(&mut self, ticket: QueueTicket) -> Result<Queue> {
        self.queues
            .get_mut(ticket.0)
            .and_then(Option::take)
            .ok_or(CoreError::QueueUnavailable(ticket.0))
    }

    pub fn semaphore(&self) -> Result<Semaphore> {
        Semaphore::new(&self.ctx)
    }

    pub fn fence(&self, signaled: bool) -> Result<Fence> {
        Fence::new(&self.ctx, signaled)
    }

    /// Blocks until `fence` is signaled, then resets it.
    pub fn wait(&self, fence: &Fence) -> Result<()> {
        fence.wait_and_reset()
    }

    pub fn idle(&self) -> Result<()> {
        self.ctx.wait_idle()
    }

    pub fn swapchain(&self) -> Result<&Swapchain> {
        self.swapchain.as_ref().ok_or(CoreError::NoSurface)
    }

    pub fn swapchain_images(&self) -> &[Image] {
        self.swapchain
            .as_ref()
            .map(|swapchain| swapchain.images())
            .unwrap_or(&[])
    }

    pub fn swapchain_image(&self, index: u32) -> Option<&Image> {
        self.swapchain_images().get(index as usize)
    }

    /// Acquires the next presentable image, signaling `signal` when it is ready.
    pub fn acquire_next_image(&self, signal: &Semaphore) -> Result<u32> {
        let swapchain = self.swapchain()?;
        match unsafe {
            swapchain.loader().acquire_next_image(
                swapchain.raw(),
                u64::MAX,
                signal.raw(),
                vk::Fence::null(),
            )
        } {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    debug!("Acquired image {} from a suboptimal swapchain.", index);
                }
                Ok(index)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(CoreError::SwapchainOutOfDate),
            Err(e) => Err(e).at("vkAcquireNextImageKHR"),
        }
    }

    /// Rebuilds the swap chain against the surface's current extent. Waits
    /// for the device to go idle first.
    pub fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> Result<()> {
        let surface = self.surface.as_mut().ok_or(CoreError::NoSurface)?;
        surface.set_extent(extent);
        self.ctx.wait_idle()?;

        let old = self.swapchain.take();
        let old_raw = old
            .as_ref()
            .map(|swapchain| swapchain.raw())
            .unwrap_or_else(vk::SwapchainKHR::null);
        let rebuilt = Swapchain::new(&self.ctx, surface, self.present_mode, old_raw);
        drop(old);
        self.swapchain = Some(rebuilt?);
        info!(
            "Swapchain recreated at {}x{}.",
            extent.width, extent.height
        );
        Ok(())
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.wait_idle() {
            warn!("Device did not go idle before teardown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&[0, 0, 0], &[0])]
    #[case(&[0, 2, 0, 1], &[0, 2, 1])]
    #[case(&[], &[])]
    fn families_are_deduplicated_in_order(#[case] requested: &[u32], #[case] expected: &[u32]) {
        assert_eq!(distinct_families(requested), expected);
    }

    #[rstest]
    #[case(&[0], vk::SharingMode::EXCLUSIVE)]
    #[case(&[0, 1], vk::SharingMode::CONCURRENT)]
    #[case(&[], vk::SharingMode::EXCLUSIVE)]
    fn sharing_follows_family_count(#[case] families: &[u32], #[case] expected: vk::SharingMode) {
        assert_eq!(sharing_mode(families), expected);
    }

    #[rstest]
    #[case(vk::API_VERSION_1_3, vk::TRUE, true)]
    #[case(vk::make_api_version(0, 1, 3, 250), vk::TRUE, true)]
    #[case(vk::API_VERSION_1_3, vk::FALSE, false)]
    #[case(vk::API_VERSION_1_2, vk::TRUE, false)]
    #[case(vk::API_VERSION_1_0, vk::FALSE, false)]
    fn dynamic_rendering_needs_version_and_feature(
        #[case] api_version: u32,
        #[case] feature: vk::Bool32,
        #[case] expected: bool,
    ) {
        assert_eq!(dynamic_rendering_supported(api_version, feature), expected);
    }
}
