// SPDX-License-Identifier: CEPL-1.0
//! Bindless texture table: one descriptor set, one large array binding.
use crate::device::DeviceContext;
use crate::error::{VkContext, VkError, VkResult};
use ash::vk;
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use lumen_render::TextureSlot;
use portable_atomic::{AtomicU32, Ordering};
use std::ffi::c_void;
use std::sync::Arc;
use tracing::{debug, info};

/// Binding index of the texture array inside its set.
pub const TEXTURE_BINDING: u32 = 3;

/// Slot bookkeeping without any GPU objects. Slots are handed out
/// monotonically from 1 and never reused; slot 0 belongs to the fallback.
pub struct SlotTable<B> {
    next: AtomicU32,
    capacity: u32,
    bindings: DashMap<u32, B>,
    tx: Sender<u32>,
    rx: Receiver<u32>,
}

impl<B: Copy> SlotTable<B> {
    pub fn new(capacity: u32) -> Self {
        let (tx, rx) = unbounded();
        Self {
            next: AtomicU32::new(TextureSlot::FALLBACK.index() + 1),
            capacity,
            bindings: DashMap::new(),
            tx,
            rx,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Reserves the next slot, records its binding and queues it.
    pub fn allocate(&self, binding: B) -> VkResult<TextureSlot> {
        let cap = self.capacity;
        let slot = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < cap).then_some(n + 1)
            })
            .map_err(|_| VkError::TextureSetFull { capacity: cap })?;
        self.publish(slot, binding);
        Ok(TextureSlot(slot))
    }

    pub fn set_fallback(&self, binding: B) {
        self.publish(TextureSlot::FALLBACK.index(), binding);
    }

    // binding goes in before the slot is queued so a drain always finds it
    fn publish(&self, slot: u32, binding: B) {
        self.bindings.insert(slot, binding);
        // the receiver lives in self, so the channel cannot be disconnected
        let _ = self.tx.send(slot);
    }

    pub fn binding(&self, slot: TextureSlot) -> Option<B> {
        self.bindings.get(&slot.index()).map(|b| *b)
    }

    /// Everything queued so far, in queue order.
    pub fn drain(&self) -> Vec<(u32, B)> {
        self.rx
            .try_iter()
            .filter_map(|slot| self.bindings.get(&slot).map(|b| (slot, *b)))
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Slots handed out by `allocate`, not counting the fallback.
    pub fn allocated(&self) -> u32 {
        self.next.load(Ordering::Acquire) - 1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureBinding {
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
}

/// The descriptor set behind the table. `add_texture` may run on any
/// thread; `ensure_updated` runs on the render thread outside a pass.
pub struct TextureSet {
    device: Arc<DeviceContext>,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
    slots: SlotTable<TextureBinding>,
}

impl TextureSet {
    pub fn new(device: &Arc<DeviceContext>, capacity: u32) -> VkResult<Self> {
        let d = device.raw();
        let mut ts = Self {
            device: Arc::clone(device),
            pool: vk::DescriptorPool::null(),
            layout: vk::DescriptorSetLayout::null(),
            set: vk::DescriptorSet::null(),
            slots: SlotTable::new(capacity),
        };

        let size = vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: capacity,
        };
        let pool_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            flags: vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND,
            max_sets: 1,
            pool_size_count: 1,
            p_pool_sizes: &size,
            ..Default::default()
        };
        ts.pool = unsafe { d.create_descriptor_pool(&pool_ci, None) }
            .vk_op("create_descriptor_pool(textures)")?;

        // unwritten slots are legal as long as no recorded draw samples them,
        // and writes may land while earlier submissions are in flight
        let binding_flags = vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT;
        let flags_ci = vk::DescriptorSetLayoutBindingFlagsCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_BINDING_FLAGS_CREATE_INFO,
            binding_count: 1,
            p_binding_flags: &binding_flags,
            ..Default::default()
        };
        let binding = vk::DescriptorSetLayoutBinding {
            binding: TEXTURE_BINDING,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: capacity,
            stage_flags: vk::ShaderStageFlags::ALL_GRAPHICS,
            ..Default::default()
        };
        let layout_ci = vk::DescriptorSetLayoutCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
            p_next: (&flags_ci) as *const _ as *const c_void,
            flags: vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL,
            binding_count: 1,
            p_bindings: &binding,
            ..Default::default()
        };
        ts.layout = unsafe { d.create_descriptor_set_layout(&layout_ci, None) }
            .vk_op("create_descriptor_set_layout(textures)")?;

        let counts = [capacity];
        let variable = vk::DescriptorSetVariableDescriptorCountAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_VARIABLE_DESCRIPTOR_COUNT_ALLOCATE_INFO,
            descriptor_set_count: 1,
            p_descriptor_counts: counts.as_ptr(),
            ..Default::default()
        };
        let alloc = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            p_next: (&variable) as *const _ as *const c_void,
            descriptor_pool: ts.pool,
            descriptor_set_count: 1,
            p_set_layouts: &ts.layout,
            ..Default::default()
        };
        ts.set = unsafe { d.allocate_descriptor_sets(&alloc) }
            .vk_op("allocate_descriptor_sets(textures)")?[0];

        info!("texture set: {capacity} slots at binding {TEXTURE_BINDING}");
        Ok(ts)
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    pub fn capacity(&self) -> u32 {
        self.slots.capacity()
    }

    pub fn add_texture(&self, view: vk::ImageView, sampler: vk::Sampler) -> VkResult<TextureSlot> {
        self.slots.allocate(TextureBinding { view, sampler })
    }

    /// Points slot 0 at the texture draws fall back to.
    pub fn set_fallback(&self, view: vk::ImageView, sampler: vk::Sampler) {
        self.slots.set_fallback(TextureBinding { view, sampler });
    }

    pub fn pending(&self) -> usize {
        self.slots.pending()
    }

    pub fn allocated(&self) -> u32 {
        self.slots.allocated()
    }

    /// Flushes queued slots into the set in one update call. Must not run
    /// inside a render pass. Returns how many slots were written.
    pub fn ensure_updated(&self) -> usize {
        let queued = self.slots.drain();
        if queued.is_empty() {
            return 0;
        }
        let infos: Vec<vk::DescriptorImageInfo> = queued
            .iter()
            .map(|(_, b)| vk::DescriptorImageInfo {
                sampler: b.sampler,
                image_view: b.view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            })
            .collect();
        let writes: Vec<vk::WriteDescriptorSet> = queued
            .iter()
            .zip(&infos)
            .map(|(&(slot, _), info)| vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: self.set,
                dst_binding: TEXTURE_BINDING,
                dst_array_element: slot,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                p_image_info: info,
                ..Default::default()
            })
            .collect();
        unsafe { self.device.raw().update_descriptor_sets(&writes, &[]) };
        debug!("texture set: wrote {} slots", writes.len());
        writes.len()
    }
}

impl Drop for TextureSet {
    fn drop(&mut self) {
        let d = self.device.raw();
        unsafe {
            d.destroy_descriptor_set_layout(self.layout, None);
            d.destroy_descriptor_pool(self.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn three_textures_then_update() {
        let t = SlotTable::<u32>::new(16);
        let slots: Vec<_> = (0..3).map(|i| t.allocate(100 + i).unwrap()).collect();
        assert_eq!(t.pending(), 3);

        let written = t.drain();
        assert_eq!(written.len(), 3);
        assert_eq!(t.pending(), 0);
        let distinct: HashSet<_> = slots.iter().collect();
        assert_eq!(distinct.len(), 3);
        assert!(slots.iter().all(|s| *s != TextureSlot::FALLBACK));
        assert_eq!(written[0], (slots[0].index(), 100));
    }

    #[test]
    fn slots_are_monotonic_from_one() {
        let t = SlotTable::<()>::new(8);
        let got: Vec<u32> = (0..4).map(|_| t.allocate(()).unwrap().index()).collect();
        assert_eq!(got, vec![1, 2, 3, 4]);
        assert_eq!(t.allocated(), 4);
    }

    #[test]
    fn concurrent_allocation_never_repeats_a_slot() {
        let t = SlotTable::<usize>::new(16384);
        let all: Vec<u32> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|w| {
                    let t = &t;
                    scope.spawn(move || {
                        (0..200)
                            .map(|i| t.allocate(w * 1000 + i).unwrap().index())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });
        let distinct: HashSet<_> = all.iter().copied().collect();
        assert_eq!(distinct.len(), 1600);
        assert!(all.iter().all(|&s| s > 0));
        assert_eq!(t.allocated(), 1600);
        assert_eq!(t.drain().len(), 1600);
    }

    #[test]
    fn drain_races_with_allocation() {
        let t = SlotTable::<u32>::new(4096);
        let drained = std::thread::scope(|scope| {
            let producer = scope.spawn(|| {
                for i in 0..1000 {
                    t.allocate(i).unwrap();
                }
            });
            let mut seen = Vec::new();
            while !producer.is_finished() {
                seen.extend(t.drain());
            }
            producer.join().unwrap();
            seen.extend(t.drain());
            seen
        });
        assert_eq!(drained.len(), 1000);
        assert_eq!(t.pending(), 0);
    }

    #[test]
    fn full_table_is_an_error() {
        let t = SlotTable::<()>::new(3);
        t.allocate(()).unwrap();
        t.allocate(()).unwrap();
        let err = t.allocate(()).unwrap_err();
        assert!(matches!(err, VkError::TextureSetFull { capacity: 3 }));
        assert_eq!(t.allocated(), 2);
    }

    #[test]
    fn fallback_occupies_slot_zero() {
        let t = SlotTable::<u32>::new(4);
        t.set_fallback(7);
        assert_eq!(t.binding(TextureSlot::FALLBACK), Some(7));
        assert_eq!(t.drain(), vec![(0, 7)]);
        assert_eq!(t.allocate(9).unwrap(), TextureSlot(1));
    }
}
