//! Memory-backed buffers.

use crate::device::{DeviceContext, LogicalDevice};
use crate::error::{Result, VkResultExt};
use crate::memory::{Allocation, Visibility};
use ash::vk;
use bytemuck::Pod;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::debug;

/// Extra usage bits a buffer needs beyond what the caller asked for.
/// Device-local buffers can only be filled by a staged copy.
pub fn effective_usage(usage: vk::BufferUsageFlags, visibility: Visibility) -> vk::BufferUsageFlags {
    if visibility.is_host_visible() {
        usage
    } else {
        usage | vk::BufferUsageFlags::TRANSFER_DST
    }
}

pub struct Buffer {
    ctx: Arc<DeviceContext>,
    raw: vk::Buffer,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    visibility: Visibility,
    memory: Allocation,
}

impl Buffer {
    pub fn new(
        device: &LogicalDevice,
        usage: vk::BufferUsageFlags,
        visibility: Visibility,
        size: vk::DeviceSize,
    ) -> Result<Self> {
        Self::create(device.context(), usage, visibility, size)
    }

    pub(crate) fn create(
        ctx: &Arc<DeviceContext>,
        usage: vk::BufferUsageFlags,
        visibility: Visibility,
        size: vk::DeviceSize,
    ) -> Result<Self> {
        let usage = effective_usage(usage, visibility);
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(ctx.sharing_mode())
            .queue_family_indices(ctx.families());
        let raw = unsafe { ctx.raw().create_buffer(&create_info, None) }
            .at("vkCreateBuffer")?;

        let requirements = unsafe { ctx.raw().get_buffer_memory_requirements(raw) };
        let memory = match Allocation::allocate(ctx, requirements, visibility) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { ctx.raw().destroy_buffer(raw, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe { ctx.raw().bind_buffer_memory(raw, memory.memory(), 0) }
            .at("vkBindBufferMemory")
        {
            unsafe { ctx.raw().destroy_buffer(raw, None) };
            return Err(e);
        }

        debug!("Buffer created: {} bytes, {:?}, {:?}.", size, usage, visibility);
        Ok(Self {
            ctx: Arc::clone(ctx),
            raw,
            size,
            usage,
            visibility,
            memory,
        })
    }

    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn memory(&self) -> &Allocation {
        &self.memory
    }

    /// Maps the buffer. Repeated calls return the same pointer until [`Buffer::unmap`].
    pub fn map(&mut self) -> Result<NonNull<u8>> {
        self.memory.map()
    }

    pub fn unmap(&mut self) {
        self.memory.unmap()
    }

    /// Maps the buffer for the duration of `f`.
    pub fn mapped<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let len = self.size as usize;
        self.memory.mapped(len, f)
    }

    /// Fills the buffer through a temporary host-visible staging buffer.
    ///
    /// `write` receives the staging memory. The copy into `self` has completed
    /// on the GPU by the time this returns.
    pub fn staged<R>(&self, write: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut staging = Buffer::create(
            &self.ctx,
            vk::BufferUsageFlags::TRANSFER_SRC,
            Visibility::HostVisible,
            self.size,
        )?;
        let out = staging.mapped(write)?;
        self.ctx
            .stager()
            .copy_buffer(self.ctx.raw(), staging.raw, self.raw, self.size)?;
        Ok(out)
    }

    /// Copies `data` to the start of the buffer, directly when host-visible
    /// and through [`Buffer::staged`] otherwise.
    pub fn write<T: Pod>(&mut self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let fill = |dst: &mut [u8]| {
            let len = bytes.len().min(dst.len());
            dst[..len].copy_from_slice(&bytes[..len]);
        };
        if self.memory.properties().contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            self.mapped(fill)
        } else {
            self.staged(fill)
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // Memory is freed afterwards when `memory` drops.
        unsafe { self.ctx.raw().destroy_buffer(self.raw, None) };
    }
}
