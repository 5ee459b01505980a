// SPDX-License-Identifier: CEPL-1.0
use crate::device::{align_ubo_size, DeviceContext};
use crate::error::{VkContext, VkError, VkResult};
use ash::vk;
use bytemuck::Pod;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::trace;

/// Item stride and count of a typed buffer. Pure arithmetic, no device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferLayout {
    pub item_size: u64,
    pub stride: u64,
    pub count: u64,
}

impl BufferLayout {
    pub fn packed<T>(count: u64) -> Self {
        let item_size = size_of::<T>() as u64;
        Self {
            item_size,
            stride: item_size,
            count,
        }
    }

    /// Stride padded to `min_align` so every item is a legal dynamic UBO offset.
    pub fn ubo_aligned<T>(count: u64, min_align: u64) -> Self {
        let item_size = size_of::<T>() as u64;
        Self {
            item_size,
            stride: align_ubo_size(item_size, min_align, 1),
            count,
        }
    }

    pub fn offset(&self, index: u64) -> u64 {
        self.stride * index
    }

    pub fn size(&self) -> u64 {
        self.stride * self.count
    }

    /// Byte offset of item `index` as a dynamic descriptor offset, which
    /// Vulkan takes as a `u32`.
    pub fn dynamic_offset(&self, index: u64) -> VkResult<u32> {
        self.check(index)?;
        u32::try_from(self.offset(index)).map_err(|_| VkError::OutOfRange {
            index,
            count: self.count,
        })
    }

    fn check(&self, index: u64) -> VkResult<()> {
        if index >= self.count {
            return Err(VkError::OutOfRange {
                index,
                count: self.count,
            });
        }
        Ok(())
    }
}

/// A byte window over one item of a buffer, as bound into a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferSlice {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub length: u64,
}

impl BufferSlice {
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset: self.offset,
            range: self.length,
        }
    }
}

struct Mapped(NonNull<u8>);

// SAFETY: the mapping is only touched through `&mut Buffer`.
unsafe impl Send for Mapped {}
unsafe impl Sync for Mapped {}

pub struct Buffer<T> {
    device: Arc<DeviceContext>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    layout: BufferLayout,
    coherent: bool,
    mapped: Option<Mapped>,
    _marker: PhantomData<T>,
}

impl<T: Pod> Buffer<T> {
    /// Tight array of `count` items; vertex, index, storage and staging use.
    pub fn packed(
        device: &Arc<DeviceContext>,
        count: u64,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
    ) -> VkResult<Self> {
        Self::with_layout(device, BufferLayout::packed::<T>(count), usage, props)
    }

    /// Items padded to the device's dynamic UBO alignment.
    pub fn ubo_aligned(
        device: &Arc<DeviceContext>,
        count: u64,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
    ) -> VkResult<Self> {
        let layout = BufferLayout::ubo_aligned::<T>(count, device.min_ubo_alignment());
        Self::with_layout(device, layout, usage, props)
    }

    /// Host-visible transfer source already holding `data`.
    pub fn staging_with(device: &Arc<DeviceContext>, data: &[T]) -> VkResult<Self> {
        let mut buf = Self::packed(
            device,
            data.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        buf.load_full(data)?;
        Ok(buf)
    }

    fn with_layout(
        device: &Arc<DeviceContext>,
        layout: BufferLayout,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
    ) -> VkResult<Self> {
        let d = device.raw();
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size: layout.size().max(1),
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        unsafe {
            let buffer = d.create_buffer(&bci, None).vk_op("create_buffer")?;
            let req = d.get_buffer_memory_requirements(buffer);
            let memory = match device.allocate_memory(req, props) {
                Ok(m) => m,
                Err(e) => {
                    d.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };
            if let Err(e) = d.bind_buffer_memory(buffer, memory, 0) {
                d.destroy_buffer(buffer, None);
                d.free_memory(memory, None);
                return Err(VkError::Vulkan {
                    op: "bind_buffer_memory",
                    result: e,
                });
            }
            trace!(
                "buffer created: {} x {} bytes (stride {})",
                layout.count,
                layout.item_size,
                layout.stride
            );
            Ok(Self {
                device: Arc::clone(device),
                buffer,
                memory,
                layout,
                coherent: props.contains(vk::MemoryPropertyFlags::HOST_COHERENT),
                mapped: None,
                _marker: PhantomData,
            })
        }
    }

    pub fn raw(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn layout(&self) -> BufferLayout {
        self.layout
    }

    pub fn len(&self) -> u64 {
        self.layout.count
    }

    pub fn is_empty(&self) -> bool {
        self.layout.count == 0
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    pub fn slice(&self, index: u64) -> VkResult<BufferSlice> {
        self.layout.check(index)?;
        Ok(BufferSlice {
            buffer: self.buffer,
            offset: self.layout.offset(index),
            length: self.layout.item_size,
        })
    }

    /// Offset to pass as a dynamic descriptor offset for item `index`.
    pub fn dynamic_offset(&self, index: u64) -> VkResult<u32> {
        self.layout.dynamic_offset(index)
    }

    /// Map, copy every item at its stride, flush if needed, unmap.
    pub fn load_full(&mut self, data: &[T]) -> VkResult<()> {
        if data.len() as u64 > self.layout.count {
            return Err(VkError::OutOfRange {
                index: data.len() as u64,
                count: self.layout.count,
            });
        }
        self.map()?;
        let res = data
            .iter()
            .enumerate()
            .try_for_each(|(i, item)| self.load_mapped(i as u64, item));
        let flushed = res.and_then(|_| self.flush());
        self.unmap();
        flushed
    }

    pub fn map(&mut self) -> VkResult<()> {
        if self.mapped.is_some() {
            return Err(VkError::AlreadyMapped);
        }
        let ptr = unsafe {
            self.device
                .raw()
                .map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }
        .vk_op("map_memory")?;
        let ptr = NonNull::new(ptr as *mut u8).ok_or(VkError::NotMapped)?;
        self.mapped = Some(Mapped(ptr));
        Ok(())
    }

    /// Writes `item` at `index` through the current mapping.
    pub fn load_mapped(&mut self, index: u64, item: &T) -> VkResult<()> {
        self.layout.check(index)?;
        let base = self.mapped.as_ref().ok_or(VkError::NotMapped)?;
        let bytes = bytemuck::bytes_of(item);
        unsafe {
            let dst = base.0.as_ptr().add(self.layout.offset(index) as usize);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
        Ok(())
    }

    /// No-op on coherent memory.
    pub fn flush(&self) -> VkResult<()> {
        if self.mapped.is_none() {
            return Err(VkError::NotMapped);
        }
        if self.coherent {
            return Ok(());
        }
        let range = vk::MappedMemoryRange {
            s_type: vk::StructureType::MAPPED_MEMORY_RANGE,
            memory: self.memory,
            offset: 0,
            size: vk::WHOLE_SIZE,
            ..Default::default()
        };
        unsafe {
            self.device
                .raw()
                .flush_mapped_memory_ranges(std::slice::from_ref(&range))
        }
        .vk_op("flush_mapped_memory_ranges")
    }

    pub fn unmap(&mut self) {
        if self.mapped.take().is_some() {
            unsafe { self.device.raw().unmap_memory(self.memory) };
        }
    }

    /// GPU-side copy of `src` into this buffer through a one-shot command.
    pub fn copy_from(&self, src: &Buffer<T>) -> VkResult<()> {
        let size = src.layout.size().min(self.layout.size());
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        let (src, dst) = (src.buffer, self.buffer);
        self.device.one_shot_command(|d, cmd| unsafe {
            d.cmd_copy_buffer(cmd, src, dst, std::slice::from_ref(&region));
        })
    }
}

impl<T> Drop for Buffer<T> {
    fn drop(&mut self) {
        let d = self.device.raw();
        unsafe {
            if self.mapped.take().is_some() {
                d.unmap_memory(self.memory);
            }
            d.destroy_buffer(self.buffer, None);
            d.free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    struct Item {
        v: [f32; 36],
    }

    #[test]
    fn packed_layout_uses_item_size() {
        let l = BufferLayout::packed::<Item>(10);
        assert_eq!(l.stride, 144);
        assert_eq!(l.offset(3), 432);
        assert_eq!(l.size(), 1440);
    }

    #[test]
    fn ubo_layout_pads_to_alignment() {
        let l = BufferLayout::ubo_aligned::<Item>(4, 256);
        assert_eq!(l.item_size, 144);
        assert_eq!(l.stride, 256);
        assert_eq!(l.offset(2), 512);
        assert_eq!(l.size(), 1024);
    }

    #[test]
    fn dynamic_offsets_follow_the_padded_stride() {
        let l = BufferLayout::ubo_aligned::<Item>(4096, 256);
        assert_eq!(l.dynamic_offset(0).unwrap(), 0);
        assert_eq!(l.dynamic_offset(1).unwrap(), 256);
        assert_eq!(l.dynamic_offset(4095).unwrap(), 4095 * 256);
        assert!(matches!(
            l.dynamic_offset(4096),
            Err(VkError::OutOfRange {
                index: 4096,
                count: 4096
            })
        ));
    }

    #[test]
    fn dynamic_offset_past_u32_is_an_error_not_a_wrap() {
        // 2^24 items at 256 bytes puts the last one at 2^32 - 256
        let l = BufferLayout::ubo_aligned::<Item>((1 << 24) + 1, 256);
        assert_eq!(l.dynamic_offset((1 << 24) - 1).unwrap(), u32::MAX - 255);
        assert!(matches!(
            l.dynamic_offset(1 << 24),
            Err(VkError::OutOfRange { index, .. }) if index == 1 << 24
        ));
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let l = BufferLayout::packed::<u32>(2);
        assert!(l.check(1).is_ok());
        assert!(matches!(
            l.check(2),
            Err(VkError::OutOfRange { index: 2, count: 2 })
        ));
    }
}
