//! Physical device selection and its immutable property tables.

use crate::error::{CoreError, Result, VkResultExt};
use crate::instance::Instance;
use crate::surface::Surface;
use ash::vk;
use std::ffi::CStr;
use std::sync::Arc;
use tracing::{debug, info};

/// One row of the queue-family table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub index: u32,
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    /// Whether the family can present to the surface the adapter was queried with.
    pub present: bool,
}

/// Capabilities a requested queue must have.
///
/// Presentation is not a `vk::QueueFlags` bit; it is a property of the
/// (family, surface) pair, so it is carried separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRequest {
    pub flags: vk::QueueFlags,
    pub present: bool,
}

impl QueueRequest {
    pub fn new(flags: vk::QueueFlags) -> Self {
        Self {
            flags,
            present: false,
        }
    }

    pub fn graphics() -> Self {
        Self::new(vk::QueueFlags::GRAPHICS)
    }

    pub fn compute() -> Self {
        Self::new(vk::QueueFlags::COMPUTE)
    }

    pub fn transfer() -> Self {
        Self::new(vk::QueueFlags::TRANSFER)
    }

    /// Any family that can present, regardless of its other capabilities.
    pub fn presentation() -> Self {
        Self {
            flags: vk::QueueFlags::empty(),
            present: true,
        }
    }

    pub fn with_present(mut self) -> Self {
        self.present = true;
        self
    }
}

/// First family whose flags contain every requested bit and, when asked,
/// that supports presentation. Ties go to the lowest index.
pub fn find_queue_family(families: &[QueueFamilyInfo], request: QueueRequest) -> Option<u32> {
    for family in families {
        if !family.flags.contains(request.flags) {
            continue;
        }
        if request.present && !family.present {
            continue;
        }
        return Some(family.index);
    }
    None
}

pub struct AdapterContext {
    instance: Arc<Instance>,
    physical: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_families: Vec<QueueFamilyInfo>,
}

impl AdapterContext {
    /// Picks the first physical device the instance reports. When a surface
    /// is given, each family's presentation support is recorded against it.
    pub fn enumerate(instance: Arc<Instance>, surface: Option<&Surface>) -> Result<Self> {
        let physical_devices = unsafe { instance.raw().enumerate_physical_devices() }
            .at("vkEnumeratePhysicalDevices")?;
        info!("Found {} physical devices.", physical_devices.len());

        let physical = *physical_devices.first().ok_or(CoreError::NoSuitableAdapter)?;

        let properties = unsafe { instance.raw().get_physical_device_properties(physical) };
        let memory_properties =
            unsafe { instance.raw().get_physical_device_memory_properties(physical) };
        let raw_families =
            unsafe { instance.raw().get_physical_device_queue_family_properties(physical) };

        let mut queue_families = Vec::with_capacity(raw_families.len());
        for (i, family) in raw_families.iter().enumerate() {
            let index = i as u32;
            let present = match surface {
                Some(surface) => surface.supports_present(physical, index)?,
                None => false,
            };
            debug!(
                "Queue family {}: {:?} x{} (present: {})",
                index, family.queue_flags, family.queue_count, present
            );
            queue_families.push(QueueFamilyInfo {
                index,
                flags: family.queue_flags,
                queue_count: family.queue_count,
                present,
            });
        }

        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy();
        info!(
            "Selected physical device: {} ({:?}), {} memory types, {} queue families.",
            name,
            properties.device_type,
            memory_properties.memory_type_count,
            queue_families.len()
        );

        Ok(Self {
            instance,
            physical,
            properties,
            memory_properties,
            queue_families,
        })
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn queue_families(&self) -> &[QueueFamilyInfo] {
        &self.queue_families
    }

    pub fn find_queue_family(&self, request: QueueRequest) -> Option<u32> {
        find_queue_family(&self.queue_families, request)
    }

    pub fn device_name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}
