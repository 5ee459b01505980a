// SPDX-License-Identifier: CEPL-1.0
use crate::buffer::Buffer;
use crate::device::DeviceContext;
use crate::error::{VkContext, VkError, VkResult};
use ash::vk;
#[cfg(debug_assertions)]
use portable_atomic::{AtomicI32, Ordering};
use std::ops::Deref;
use std::sync::Arc;
use tracing::trace;

/// `floor(log2(max(w, h))) + 1`.
pub fn mip_levels(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Size of one dimension at mip `level`, never below 1.
pub fn mip_extent(dim: u32, level: u32) -> u32 {
    (dim >> level).max(1)
}

pub fn aspect_for(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D32_SFLOAT | vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Access masks and stages for one layout transition barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

pub fn transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> VkResult<TransitionMasks> {
    use vk::ImageLayout as L;
    let (src_access, dst_access, src_stage, dst_stage) = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
        ),
        (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
            vk::AccessFlags::TRANSFER_READ,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        ),
        _ => return Err(VkError::UnsupportedTransition { old, new }),
    };
    Ok(TransitionMasks {
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub samples: vk::SampleCountFlags,
    pub mipmapped: bool,
}

impl ImageDesc {
    pub fn new(width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            width,
            height,
            format,
            usage,
            samples: vk::SampleCountFlags::TYPE_1,
            mipmapped: false,
        }
    }

    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    pub fn mipmapped(mut self, on: bool) -> Self {
        self.mipmapped = on;
        self
    }

    pub fn mip_levels(&self) -> u32 {
        if self.mipmapped {
            mip_levels(self.width, self.height)
        } else {
            1
        }
    }

    /// Mip chains are built by blitting, so they need both transfer directions.
    pub fn effective_usage(&self) -> vk::ImageUsageFlags {
        if self.mipmapped {
            self.usage | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST
        } else {
            self.usage
        }
    }
}

/// Debug builds remember the layout this image is in and reject transitions
/// whose `old` disagrees. Recorded transitions only become the image's layout
/// once the submit carrying them succeeds. Release builds trust the caller.
struct LayoutTracker {
    #[cfg(debug_assertions)]
    committed: AtomicI32,
    #[cfg(debug_assertions)]
    recorded: AtomicI32,
}

#[cfg(debug_assertions)]
impl LayoutTracker {
    fn new() -> Self {
        let undefined = vk::ImageLayout::UNDEFINED.as_raw();
        Self {
            committed: AtomicI32::new(undefined),
            recorded: AtomicI32::new(undefined),
        }
    }

    fn advance(&self, old: vk::ImageLayout, new: vk::ImageLayout) -> VkResult<()> {
        let expected = vk::ImageLayout::from_raw(self.recorded.load(Ordering::Acquire));
        // UNDEFINED discards contents, so it is legal from any layout
        if old != vk::ImageLayout::UNDEFINED && old != expected {
            return Err(VkError::LayoutMismatch {
                expected,
                actual: old,
            });
        }
        self.recorded.store(new.as_raw(), Ordering::Release);
        Ok(())
    }

    fn commit(&self) {
        self.committed
            .store(self.recorded.load(Ordering::Acquire), Ordering::Release);
    }

    fn rollback(&self) {
        self.recorded
            .store(self.committed.load(Ordering::Acquire), Ordering::Release);
    }

    fn settle<T>(&self, outcome: &VkResult<T>) {
        match outcome {
            Ok(_) => self.commit(),
            Err(_) => self.rollback(),
        }
    }

    #[cfg(test)]
    fn current(&self) -> vk::ImageLayout {
        vk::ImageLayout::from_raw(self.committed.load(Ordering::Acquire))
    }
}

#[cfg(not(debug_assertions))]
impl LayoutTracker {
    fn new() -> Self {
        Self {}
    }

    fn advance(&self, _old: vk::ImageLayout, _new: vk::ImageLayout) -> VkResult<()> {
        Ok(())
    }

    fn settle<T>(&self, _outcome: &VkResult<T>) {}
}

/// Device-local image with its memory and (once created) a view.
pub struct Image {
    device: Arc<DeviceContext>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    desc: ImageDesc,
    mips: u32,
    layers: u32,
    tracker: LayoutTracker,
}

impl Image {
    pub fn new(device: &Arc<DeviceContext>, desc: ImageDesc) -> VkResult<Self> {
        Self::with_layers(device, desc, 1)
    }

    fn with_layers(device: &Arc<DeviceContext>, desc: ImageDesc, layers: u32) -> VkResult<Self> {
        let d = device.raw();
        let mips = desc.mip_levels();
        let ci = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format: desc.format,
            extent: vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            },
            mip_levels: mips,
            array_layers: layers,
            samples: desc.samples,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: desc.effective_usage(),
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        unsafe {
            let image = d.create_image(&ci, None).vk_op("create_image")?;
            let req = d.get_image_memory_requirements(image);
            let memory = match device.allocate_memory(req, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
                Ok(m) => m,
                Err(e) => {
                    d.destroy_image(image, None);
                    return Err(e);
                }
            };
            if let Err(e) = d.bind_image_memory(image, memory, 0) {
                d.destroy_image(image, None);
                d.free_memory(memory, None);
                return Err(VkError::Vulkan {
                    op: "bind_image_memory",
                    result: e,
                });
            }
            trace!(
                "image created: {}x{} {:?} mips={mips} layers={layers} samples={:?}",
                desc.width,
                desc.height,
                desc.format,
                desc.samples
            );
            Ok(Self {
                device: Arc::clone(device),
                image,
                memory,
                view: vk::ImageView::null(),
                desc,
                mips,
                layers,
                tracker: LayoutTracker::new(),
            })
        }
    }

    pub fn raw(&self) -> vk::Image {
        self.image
    }

    /// Null until `create_view` has run.
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.desc.width,
            height: self.desc.height,
        }
    }

    pub fn mip_levels(&self) -> u32 {
        self.mips
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }

    fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: aspect_for(self.desc.format),
            base_mip_level: 0,
            level_count: self.mips,
            base_array_layer: 0,
            layer_count: self.layers,
        }
    }

    /// (Re)creates the image's view. Replaces any earlier view.
    pub fn create_view(&mut self, swizzle: vk::ComponentMapping) -> VkResult<vk::ImageView> {
        let view_type = if self.layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        self.replace_view(view_type, swizzle)
    }

    fn replace_view(
        &mut self,
        view_type: vk::ImageViewType,
        swizzle: vk::ComponentMapping,
    ) -> VkResult<vk::ImageView> {
        let ci = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image: self.image,
            view_type,
            format: self.desc.format,
            components: swizzle,
            subresource_range: self.full_range(),
            ..Default::default()
        };
        let d = self.device.raw();
        let view = unsafe { d.create_image_view(&ci, None) }.vk_op("create_image_view")?;
        if self.view != vk::ImageView::null() {
            unsafe { d.destroy_image_view(self.view, None) };
        }
        self.view = view;
        Ok(view)
    }

    /// Records a barrier moving every mip and layer from `old` to `new`.
    /// Outside `transition_layout`/`upload`/`blit_from` the caller owns the
    /// submit, and the debug tracker treats the transition as done.
    pub fn record_transition(
        &self,
        cmd: vk::CommandBuffer,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> VkResult<()> {
        let masks = transition_masks(old, new)?;
        self.tracker.advance(old, new)?;
        let barrier = vk::ImageMemoryBarrier {
            s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
            src_access_mask: masks.src_access,
            dst_access_mask: masks.dst_access,
            old_layout: old,
            new_layout: new,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image: self.image,
            subresource_range: self.full_range(),
            ..Default::default()
        };
        unsafe {
            self.device.raw().cmd_pipeline_barrier(
                cmd,
                masks.src_stage,
                masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(&barrier),
            );
        }
        Ok(())
    }

    /// Standalone transition through a one-shot command. Setup-time only.
    pub fn transition_layout(&self, old: vk::ImageLayout, new: vk::ImageLayout) -> VkResult<()> {
        self.submit(|_, cmd| self.record_transition(cmd, old, new))
    }

    /// One-shot submit whose recorded transitions stick only if it succeeds.
    fn submit(
        &self,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer) -> VkResult<()>,
    ) -> VkResult<()> {
        let outcome = self.device.one_shot_command(record).and_then(|r| r);
        self.tracker.settle(&outcome);
        outcome
    }

    fn copy_region(&self) -> vk::BufferImageCopy {
        vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: aspect_for(self.desc.format),
                mip_level: 0,
                base_array_layer: 0,
                layer_count: self.layers,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: self.desc.width,
                height: self.desc.height,
                depth: 1,
            },
        }
    }

    /// Copies `staging` into mip 0 of every layer, then builds the mip chain
    /// or moves straight to shader-read.
    pub fn upload(&self, staging: &Buffer<u8>) -> VkResult<()> {
        if self.mips > 1 && !self.device.supports_linear_blit(self.desc.format) {
            return Err(VkError::LinearBlitUnsupported(self.desc.format));
        }
        let region = self.copy_region();
        let src = staging.raw();
        self.submit(|d, cmd| {
            self.record_transition(
                cmd,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )?;
            unsafe {
                d.cmd_copy_buffer_to_image(
                    cmd,
                    src,
                    self.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    std::slice::from_ref(&region),
                );
            }
            if self.mips > 1 {
                self.generate_mipmaps(cmd)
            } else {
                self.record_transition(
                    cmd,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )
            }
        })
    }

    /// Copies `staging` into mip 0 and leaves the image in
    /// TRANSFER_SRC_OPTIMAL, ready to be the source of `blit_from`.
    pub fn upload_for_blit(&self, staging: &Buffer<u8>) -> VkResult<()> {
        let region = self.copy_region();
        let src = staging.raw();
        self.submit(|d, cmd| {
            self.record_transition(
                cmd,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )?;
            unsafe {
                d.cmd_copy_buffer_to_image(
                    cmd,
                    src,
                    self.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    std::slice::from_ref(&region),
                );
            }
            self.record_transition(
                cmd,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            )
        })
    }

    /// Blits mip 0 of `source` (in TRANSFER_SRC_OPTIMAL) into mip 0 of this
    /// image, converting formats on the way, then builds the mip chain or
    /// moves straight to shader-read. Block-compressed sources decode here.
    pub fn blit_from(&self, source: &Image) -> VkResult<()> {
        if !self
            .device
            .format_supports(source.format(), vk::FormatFeatureFlags::BLIT_SRC)
        {
            return Err(VkError::BlitUnsupported(source.format()));
        }
        if !self
            .device
            .format_supports(self.desc.format, vk::FormatFeatureFlags::BLIT_DST)
        {
            return Err(VkError::BlitUnsupported(self.desc.format));
        }
        if self.mips > 1 && !self.device.supports_linear_blit(self.desc.format) {
            return Err(VkError::LinearBlitUnsupported(self.desc.format));
        }
        let blit = vk::ImageBlit {
            src_subresource: vk::ImageSubresourceLayers {
                aspect_mask: aspect_for(source.format()),
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            src_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: source.desc.width as i32,
                    y: source.desc.height as i32,
                    z: 1,
                },
            ],
            dst_subresource: vk::ImageSubresourceLayers {
                aspect_mask: aspect_for(self.desc.format),
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            dst_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: self.desc.width as i32,
                    y: self.desc.height as i32,
                    z: 1,
                },
            ],
        };
        self.submit(|d, cmd| {
            self.record_transition(
                cmd,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )?;
            unsafe {
                d.cmd_blit_image(
                    cmd,
                    source.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    self.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    std::slice::from_ref(&blit),
                    vk::Filter::NEAREST,
                );
            }
            if self.mips > 1 {
                self.generate_mipmaps(cmd)
            } else {
                self.record_transition(
                    cmd,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )
            }
        })
    }

    /// Blits each level from the previous one. Expects every level in
    /// TRANSFER_DST_OPTIMAL; leaves every level in SHADER_READ_ONLY_OPTIMAL.
    pub fn generate_mipmaps(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        if !self.device.supports_linear_blit(self.desc.format) {
            return Err(VkError::LinearBlitUnsupported(self.desc.format));
        }
        self.tracker.advance(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;
        let d = self.device.raw();
        let aspect = aspect_for(self.desc.format);
        let level_barrier = |level: u32, old, new| -> VkResult<()> {
            let masks = transition_masks(old, new)?;
            let barrier = vk::ImageMemoryBarrier {
                s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
                src_access_mask: masks.src_access,
                dst_access_mask: masks.dst_access,
                old_layout: old,
                new_layout: new,
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                image: self.image,
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: aspect,
                    base_mip_level: level,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: self.layers,
                },
                ..Default::default()
            };
            unsafe {
                d.cmd_pipeline_barrier(
                    cmd,
                    masks.src_stage,
                    masks.dst_stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    std::slice::from_ref(&barrier),
                );
            }
            Ok(())
        };

        let (w, h) = (self.desc.width, self.desc.height);
        for level in 1..self.mips {
            let src = level - 1;
            level_barrier(
                src,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            )?;
            let blit = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: aspect,
                    mip_level: src,
                    base_array_layer: 0,
                    layer_count: self.layers,
                },
                src_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: mip_extent(w, src) as i32,
                        y: mip_extent(h, src) as i32,
                        z: 1,
                    },
                ],
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: aspect,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: self.layers,
                },
                dst_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: mip_extent(w, level) as i32,
                        y: mip_extent(h, level) as i32,
                        z: 1,
                    },
                ],
            };
            unsafe {
                d.cmd_blit_image(
                    cmd,
                    self.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    self.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    std::slice::from_ref(&blit),
                    vk::Filter::LINEAR,
                );
            }
            level_barrier(
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )?;
        }
        level_barrier(
            self.mips - 1,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let d = self.device.raw();
        unsafe {
            if self.view != vk::ImageView::null() {
                d.destroy_image_view(self.view, None);
            }
            d.destroy_image(self.image, None);
            d.free_memory(self.memory, None);
        }
    }
}

/// Layered image, one layer per cascade. Its view is always a 2D array.
pub struct ImageArray {
    inner: Image,
}

impl ImageArray {
    pub fn new(device: &Arc<DeviceContext>, desc: ImageDesc, layers: u32) -> VkResult<Self> {
        let mut inner = Image::with_layers(device, desc, layers.max(1))?;
        // array view even for one layer; shaders sample it as sampler2DArray
        inner.replace_view(vk::ImageViewType::TYPE_2D_ARRAY, vk::ComponentMapping::default())?;
        Ok(Self { inner })
    }
}

impl Deref for ImageArray {
    type Target = Image;

    fn deref(&self) -> &Image {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_count_follows_largest_side() {
        assert_eq!(mip_levels(1, 1), 1);
        assert_eq!(mip_levels(2, 1), 2);
        assert_eq!(mip_levels(256, 256), 9);
        assert_eq!(mip_levels(300, 17), 9);
        assert_eq!(mip_levels(1024, 4096), 13);
        assert_eq!(mip_levels(0, 0), 1);
    }

    #[test]
    fn mip_extent_never_hits_zero() {
        assert_eq!(mip_extent(256, 3), 32);
        assert_eq!(mip_extent(300, 8), 1);
        assert_eq!(mip_extent(5, 20), 1);
    }

    #[test]
    fn depth_formats_get_depth_aspect() {
        assert_eq!(aspect_for(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert!(aspect_for(vk::Format::D24_UNORM_S8_UINT).contains(vk::ImageAspectFlags::STENCIL));
        assert_eq!(aspect_for(vk::Format::B8G8R8A8_SRGB), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn upload_transitions_are_supported() {
        let m = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(m.src_access, vk::AccessFlags::empty());
        assert_eq!(m.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(m.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);

        let m = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(m.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);

        let m = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )
        .unwrap();
        assert_eq!(m.dst_stage, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS);
    }

    #[test]
    fn unknown_transition_is_rejected() {
        let err = transition_masks(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
        .unwrap_err();
        assert!(matches!(err, VkError::UnsupportedTransition { .. }));
    }

    #[test]
    fn mipmapped_desc_adds_transfer_usage() {
        let desc = ImageDesc::new(
            64,
            32,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
        )
        .mipmapped(true);
        assert_eq!(desc.mip_levels(), 7);
        assert!(desc
            .effective_usage()
            .contains(vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST));
        assert_eq!(desc.mipmapped(false).mip_levels(), 1);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn failed_submit_leaves_layout_where_it_was() {
        let t = LayoutTracker::new();
        t.advance(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        t.settle::<()>(&Err(VkError::NotMapped));
        assert_eq!(t.current(), vk::ImageLayout::UNDEFINED);
        // the rolled-back layout is what the next transition must start from
        assert!(t
            .advance(
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
            .is_err());

        t.advance(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        t.advance(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )
        .unwrap();
        t.settle(&Ok(()));
        assert_eq!(t.current(), vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn tracker_rejects_out_of_order_transition() {
        let t = LayoutTracker::new();
        t.advance(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        let err = t
            .advance(
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            VkError::LayoutMismatch {
                expected: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                actual: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            }
        ));
        t.advance(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
    }
}
