//! Descriptor-set layouts and generation rotation.
//!
//! Each declared set gets G parallel descriptor sets ("generations"). Writes
//! always land in the current generation of a set; `advance` moves to the
//! next one. Advancing once per use keeps the CPU from rewriting a set that
//! a submission from fewer than G uses ago may still be reading.

use crate::buffer::Buffer;
use crate::device::DeviceContext;
use crate::error::{CoreError, Result, VkResultExt};
use crate::image::Image;
use crate::ring::Ring;
use ash::vk;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub ty: vk::DescriptorType,
    /// Array length. Zero is treated as one.
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

impl DescriptorBinding {
    pub fn new(ty: vk::DescriptorType, count: u32, stages: vk::ShaderStageFlags) -> Self {
        Self { ty, count, stages }
    }

    pub fn uniform_buffer(stages: vk::ShaderStageFlags) -> Self {
        Self::new(vk::DescriptorType::UNIFORM_BUFFER, 1, stages)
    }

    pub fn storage_buffer(stages: vk::ShaderStageFlags) -> Self {
        Self::new(vk::DescriptorType::STORAGE_BUFFER, 1, stages)
    }

    pub fn storage_image(stages: vk::ShaderStageFlags) -> Self {
        Self::new(vk::DescriptorType::STORAGE_IMAGE, 1, stages)
    }

    pub fn combined_image_sampler(stages: vk::ShaderStageFlags) -> Self {
        Self::new(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1, stages)
    }

    pub fn descriptor_count(&self) -> u32 {
        self.count.max(1)
    }
}

/// Layout bindings numbered by position within the set.
pub fn layout_bindings(bindings: &[DescriptorBinding]) -> Vec<vk::DescriptorSetLayoutBinding> {
    bindings
        .iter()
        .enumerate()
        .map(|(i, binding)| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(i as u32)
                .descriptor_type(binding.ty)
                .descriptor_count(binding.descriptor_count())
                .stage_flags(binding.stages)
                .build()
        })
        .collect()
}

/// Pool sizes for `generations` copies of every set, aggregated per type.
pub fn pool_sizes(sets: &[Vec<DescriptorBinding>], generations: usize) -> Vec<vk::DescriptorPoolSize> {
    let mut totals: BTreeMap<i32, u32> = BTreeMap::new();
    for binding in sets.iter().flatten() {
        *totals.entry(binding.ty.as_raw()).or_default() +=
            binding.descriptor_count() * generations as u32;
    }
    totals
        .into_iter()
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
            ty: vk::DescriptorType::from_raw(ty),
            descriptor_count,
        })
        .collect()
}

/// Per-set rotation over G descriptor-set handles.
#[derive(Debug)]
pub struct DescriptorGenerations {
    sets: Vec<Ring<vk::DescriptorSet>>,
}

impl DescriptorGenerations {
    /// `sets[s]` holds the G generations of set `s`.
    pub fn new(sets: Vec<Vec<vk::DescriptorSet>>) -> Self {
        Self {
            sets: sets
                .into_iter()
                .map(|generations| Ring::new("descriptor-generations", generations))
                .collect(),
        }
    }

    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    fn ring(&self, set: usize) -> Result<&Ring<vk::DescriptorSet>> {
        self.sets
            .get(set)
            .ok_or(CoreError::UnknownDescriptorSet { set, binding: 0 })
    }

    pub fn advance(&mut self, set: usize) -> Result<()> {
        let ring = self
            .sets
            .get_mut(set)
            .ok_or(CoreError::UnknownDescriptorSet { set, binding: 0 })?;
        ring.advance();
        trace!("Descriptor set {} now on generation {}.", set, ring.cursor());
        Ok(())
    }

    /// Generation index `set` is currently on.
    pub fn generation(&self, set: usize) -> Result<usize> {
        Ok(self.ring(set)?.cursor())
    }

    /// Handle writes to `set` currently go to.
    pub fn current(&self, set: usize) -> Result<vk::DescriptorSet> {
        self.ring(set)?
            .current()
            .copied()
            .ok_or(CoreError::UnknownDescriptorSet { set, binding: 0 })
    }

    /// Current generation of every set, in set order, as bound at draw time.
    pub fn bound(&self) -> Vec<vk::DescriptorSet> {
        self.sets
            .iter()
            .filter_map(|ring| ring.current().copied())
            .collect()
    }

    pub fn all(&self) -> impl Iterator<Item = vk::DescriptorSet> + '_ {
        self.sets.iter().flat_map(|ring| ring.iter().copied())
    }
}

/// Resource written into one binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    Buffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    Image {
        view: vk::ImageView,
        layout: vk::ImageLayout,
        sampler: vk::Sampler,
    },
}

impl DescriptorResource {
    /// The whole of `buffer`.
    pub fn buffer(buffer: &Buffer) -> Self {
        DescriptorResource::Buffer {
            buffer: buffer.raw(),
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }

    /// Storage image in `GENERAL` layout.
    pub fn storage_image(image: &Image) -> Self {
        DescriptorResource::Image {
            view: image.view(),
            layout: vk::ImageLayout::GENERAL,
            sampler: vk::Sampler::null(),
        }
    }

    pub fn sampled_image(image: &Image, sampler: vk::Sampler, layout: vk::ImageLayout) -> Self {
        DescriptorResource::Image {
            view: image.view(),
            layout,
            sampler,
        }
    }
}

/// Layouts, pool and generations of one pipeline's descriptor sets.
pub struct DescriptorState {
    ctx: Arc<DeviceContext>,
    declared: Vec<Vec<DescriptorBinding>>,
    layouts: Vec<vk::DescriptorSetLayout>,
    pool: Option<vk::DescriptorPool>,
    generations: DescriptorGenerations,
}

impl DescriptorState {
    pub(crate) fn new(
        ctx: &Arc<DeviceContext>,
        sets: &[Vec<DescriptorBinding>],
        generations: usize,
    ) -> Result<Self> {
        let mut state = Self {
            ctx: Arc::clone(ctx),
            declared: sets.to_vec(),
            layouts: Vec::with_capacity(sets.len()),
            pool: None,
            generations: DescriptorGenerations::new(Vec::new()),
        };

        // Partially built state is released by Drop on any early return.
        for bindings in sets {
            let layout_bindings = layout_bindings(bindings);
            let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&layout_bindings);
            let layout = unsafe { ctx.raw().create_descriptor_set_layout(&info, None) }
                .at("vkCreateDescriptorSetLayout")?;
            state.layouts.push(layout);
        }

        if sets.is_empty() {
            return Ok(state);
        }

        let sizes = pool_sizes(sets, generations);
        let max_sets = (sets.len() * generations) as u32;
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(&sizes);
        let pool = unsafe { ctx.raw().create_descriptor_pool(&pool_info, None) }
            .at("vkCreateDescriptorPool")?;
        state.pool = Some(pool);

        let mut per_set = Vec::with_capacity(sets.len());
        for &layout in &state.layouts {
            let layouts = vec![layout; generations];
            let alloc_info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(pool)
                .set_layouts(&layouts);
            let allocated = unsafe { ctx.raw().allocate_descriptor_sets(&alloc_info) }
                .at("vkAllocateDescriptorSets")?;
            per_set.push(allocated);
        }
        state.generations = DescriptorGenerations::new(per_set);

        debug!(
            "Descriptor pool built: {} set(s) x {} generation(s), {} pool size(s).",
            sets.len(),
            generations,
            sizes.len()
        );
        Ok(state)
    }

    pub fn layouts(&self) -> &[vk::DescriptorSetLayout] {
        &self.layouts
    }

    pub fn generations(&self) -> &DescriptorGenerations {
        &self.generations
    }

    pub fn advance(&mut self, set: usize) -> Result<()> {
        self.generations.advance(set)
    }

    pub fn binding(&self, set: usize, binding: u32) -> Result<DescriptorBinding> {
        self.declared
            .get(set)
            .and_then(|bindings| bindings.get(binding as usize))
            .copied()
            .ok_or(CoreError::UnknownDescriptorSet { set, binding })
    }

    /// Writes `resource` into `binding` of the current generation of `set`.
    pub fn write(&self, set: usize, binding: u32, resource: DescriptorResource) -> Result<()> {
        let declared = self.binding(set, binding)?;
        let target = self.generations.current(set)?;

        let buffer_info;
        let image_info;
        let mut write = vk::WriteDescriptorSet::builder()
            .dst_set(target)
            .dst_binding(binding)
            .dst_array_element(0)
            .descriptor_type(declared.ty);
        match resource {
            DescriptorResource::Buffer {
                buffer,
                offset,
                range,
            } => {
                buffer_info = [vk::DescriptorBufferInfo {
                    buffer,
                    offset,
                    range,
                }];
                write = write.buffer_info(&buffer_info);
            }
            DescriptorResource::Image {
                view,
                layout,
                sampler,
            } => {
                image_info = [vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: layout,
                }];
                write = write.image_info(&image_info);
            }
        }
        unsafe { self.ctx.raw().update_descriptor_sets(&[write.build()], &[]) };
        Ok(())
    }
}

impl Drop for DescriptorState {
    fn drop(&mut self) {
        unsafe {
            // Sets are freed with their pool.
            if let Some(pool) = self.pool.take() {
                self.ctx.raw().destroy_descriptor_pool(pool, None);
            }
            for layout in self.layouts.drain(..) {
                self.ctx.raw().destroy_descriptor_set_layout(layout, None);
            }
        }
    }
}
