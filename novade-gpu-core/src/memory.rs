//! Device memory allocation shared by [`Buffer`](crate::buffer::Buffer) and
//! [`Image`](crate::image::Image).
//!
//! Every resource gets its own `VkDeviceMemory`; there is no sub-allocation.

use crate::device::DeviceContext;
use crate::error::{CoreError, Result, VkResultExt};
use ash::vk;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a resource's memory lives and how the CPU may touch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// GPU-only memory. Filled through a staged upload.
    DeviceLocal,
    /// Host-visible and host-coherent; writes need no explicit flush.
    HostVisible,
    /// Host-visible, coherent and cached; suited to readback.
    HostCached,
    Custom(vk::MemoryPropertyFlags),
}

impl Visibility {
    pub fn flags(self) -> vk::MemoryPropertyFlags {
        match self {
            Visibility::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Visibility::HostVisible => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            Visibility::HostCached => {
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT
                    | vk::MemoryPropertyFlags::HOST_CACHED
            }
            Visibility::Custom(flags) => flags,
        }
    }

    pub fn is_host_visible(self) -> bool {
        self.flags().contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }
}

/// Index of the first memory type allowed by `type_bits` whose property
/// flags are a superset of `required`.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32> {
    let count = (properties.memory_type_count as usize).min(properties.memory_types.len());
    for (index, memory_type) in properties.memory_types[..count].iter().enumerate() {
        if type_bits & (1 << index) == 0 {
            continue;
        }
        if memory_type.property_flags.contains(required) {
            return Ok(index as u32);
        }
    }
    Err(CoreError::NoSuitableMemoryType {
        type_bits,
        required,
    })
}

/// One `VkDeviceMemory` block plus its cached mapping.
pub struct Allocation {
    ctx: Arc<DeviceContext>,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    type_index: u32,
    properties: vk::MemoryPropertyFlags,
    mapped: Option<NonNull<c_void>>,
}

impl Allocation {
    pub(crate) fn allocate(
        ctx: &Arc<DeviceContext>,
        requirements: vk::MemoryRequirements,
        visibility: Visibility,
    ) -> Result<Self> {
        let required = visibility.flags();
        let type_index =
            find_memory_type(ctx.memory_properties(), requirements.memory_type_bits, required)?;
        let properties =
            ctx.memory_properties().memory_types[type_index as usize].property_flags;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);
        let memory = unsafe { ctx.raw().allocate_memory(&alloc_info, None) }
            .at("vkAllocateMemory")?;
        debug!(
            "Allocated {} bytes from memory type {} ({:?}).",
            requirements.size, type_index, properties
        );

        Ok(Self {
            ctx: Arc::clone(ctx),
            memory,
            size: requirements.size,
            type_index,
            properties,
            mapped: None,
        })
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn type_index(&self) -> u32 {
        self.type_index
    }

    pub fn properties(&self) -> vk::MemoryPropertyFlags {
        self.properties
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Maps the whole allocation. Returns the cached pointer when already mapped.
    pub fn map(&mut self) -> Result<NonNull<u8>> {
        if let Some(ptr) = self.mapped {
            return Ok(ptr.cast());
        }
        if !self.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(CoreError::NotHostVisible);
        }
        let raw = unsafe {
            self.ctx
                .raw()
                .map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }
        .at("vkMapMemory")?;
        let ptr = NonNull::new(raw).ok_or(CoreError::Vulkan {
            call: "vkMapMemory",
            result: vk::Result::ERROR_MEMORY_MAP_FAILED,
            location: std::panic::Location::caller(),
        })?;
        self.mapped = Some(ptr);
        Ok(ptr.cast())
    }

    /// Unmaps the allocation. Any pointer previously returned by `map` is dangling afterwards.
    pub fn unmap(&mut self) {
        if self.mapped.take().is_some() {
            unsafe { self.ctx.raw().unmap_memory(self.memory) };
        }
    }

    /// Runs `f` over the mapped bytes of `len` and unmaps afterwards.
    pub(crate) fn mapped<R>(&mut self, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let ptr = self.map()?;
        let len = len.min(self.size as usize);
        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) };
        let out = f(bytes);
        self.unmap();
        Ok(out)
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if self.mapped.is_some() {
            warn!(
                "Freeing device memory ({} bytes) that is still mapped; unmapping first.",
                self.size
            );
            self.unmap();
        }
        unsafe { self.ctx.raw().free_memory(self.memory, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const DL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HV: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const HC: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;
    const CACHED: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_CACHED;

    fn table(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            memory_heap_count: 2,
            ..Default::default()
        };
        for (i, flags) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: *flags,
                heap_index: if flags.contains(DL) { 0 } else { 1 },
            };
        }
        props
    }

    /// Typical discrete GPU: device-local VRAM, plus two host-visible types.
    fn discrete() -> vk::PhysicalDeviceMemoryProperties {
        table(&[DL, HV | HC, HV | HC | CACHED])
    }

    #[rstest]
    #[case(0b111, DL, 0)]
    #[case(0b111, HV | HC, 1)]
    #[case(0b111, HV, 1)]
    #[case(0b101, HV | HC, 2)]
    #[case(0b111, HV | HC | CACHED, 2)]
    #[case(0b110, vk::MemoryPropertyFlags::empty(), 1)]
    fn selects_first_matching_type(
        #[case] type_bits: u32,
        #[case] required: vk::MemoryPropertyFlags,
        #[case] expected: u32,
    ) {
        assert_eq!(find_memory_type(&discrete(), type_bits, required).unwrap(), expected);
    }

    #[test]
    fn impossible_combination_fails() {
        let err = find_memory_type(&discrete(), 0b111, DL | HV | HC).unwrap_err();
        assert!(matches!(
            err,
            CoreError::NoSuitableMemoryType { type_bits: 0b111, required } if required == DL | HV | HC
        ));
    }

    #[test]
    fn type_bits_are_respected() {
        // Only the device-local type is allowed, so host-visible cannot be satisfied.
        assert!(find_memory_type(&discrete(), 0b001, HV).is_err());
    }

    #[test]
    fn bits_beyond_type_count_are_ignored() {
        let props = table(&[HV | HC]);
        assert!(find_memory_type(&props, 0b10, HV).is_err());
    }

    #[test]
    fn unified_memory_satisfies_combined_request() {
        let props = table(&[DL | HV | HC]);
        assert_eq!(find_memory_type(&props, 0b1, DL | HV | HC).unwrap(), 0);
    }

    #[test]
    fn visibility_flags() {
        assert!(!Visibility::DeviceLocal.is_host_visible());
        assert!(Visibility::HostVisible.is_host_visible());
        assert_eq!(Visibility::HostCached.flags(), HV | HC | CACHED);
        assert_eq!(Visibility::Custom(DL | HV).flags(), DL | HV);
    }
}
