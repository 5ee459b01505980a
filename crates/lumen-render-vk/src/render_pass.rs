// SPDX-License-Identifier: CEPL-1.0
//! The two fixed pass topologies. Attachments are written out by hand so
//! framebuffer compatibility stays visible in one place.
use crate::device::DeviceContext;
use crate::error::{VkContext, VkError, VkResult};
use crate::image::{ImageArray, ImageDesc};
use crate::sampler::Sampler;
use ash::vk;
use std::sync::Arc;
use tracing::info;

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// `[msaa color, msaa depth, single-sample resolve]`.
pub fn main_attachments(
    color_format: vk::Format,
    samples: vk::SampleCountFlags,
) -> [vk::AttachmentDescription; 3] {
    [
        vk::AttachmentDescription {
            format: color_format,
            samples,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ..Default::default()
        },
        vk::AttachmentDescription {
            format: DEPTH_FORMAT,
            samples,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..Default::default()
        },
        vk::AttachmentDescription {
            format: color_format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            ..Default::default()
        },
    ]
}

/// A resolve attachment is only valid against a multisampled color source.
pub fn check_main_samples(samples: vk::SampleCountFlags) -> VkResult<()> {
    if samples == vk::SampleCountFlags::TYPE_1 || samples.is_empty() {
        return Err(VkError::SingleSampleMainPass(samples));
    }
    Ok(())
}

pub fn main_dependency() -> vk::SubpassDependency {
    vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        dependency_flags: vk::DependencyFlags::empty(),
    }
}

pub fn shadow_attachment() -> vk::AttachmentDescription {
    vk::AttachmentDescription {
        format: DEPTH_FORMAT,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ..Default::default()
    }
}

/// Last frame's sampling finishes before the write, and the write finishes
/// before this frame's sampling.
pub fn shadow_dependencies() -> [vk::SubpassDependency; 2] {
    [
        vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            dst_stage_mask: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            src_access_mask: vk::AccessFlags::SHADER_READ,
            dst_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        },
        vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            src_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::SHADER_READ,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        },
    ]
}

unsafe fn create_render_pass(
    device: &ash::Device,
    attachments: &[vk::AttachmentDescription],
    subpass: &vk::SubpassDescription,
    dependencies: &[vk::SubpassDependency],
) -> VkResult<vk::RenderPass> {
    let ci = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: attachments.len() as u32,
        p_attachments: attachments.as_ptr(),
        subpass_count: 1,
        p_subpasses: subpass,
        dependency_count: dependencies.len() as u32,
        p_dependencies: dependencies.as_ptr(),
        ..Default::default()
    };
    unsafe { device.create_render_pass(&ci, None) }.vk_op("create_render_pass")
}

/// Multisampled color + depth, resolved into the swapchain image.
pub struct MainRenderPass {
    device: Arc<DeviceContext>,
    raw: vk::RenderPass,
    color_format: vk::Format,
    samples: vk::SampleCountFlags,
}

impl MainRenderPass {
    pub fn new(device: &Arc<DeviceContext>) -> VkResult<Self> {
        let color_format = device.choice().surface_format.format;
        let samples = device.samples();
        check_main_samples(samples)?;
        let attachments = main_attachments(color_format, samples);
        let color_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let resolve_ref = vk::AttachmentReference {
            attachment: 2,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let subpass = vk::SubpassDescription {
            pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
            color_attachment_count: 1,
            p_color_attachments: &color_ref,
            p_resolve_attachments: &resolve_ref,
            p_depth_stencil_attachment: &depth_ref,
            ..Default::default()
        };
        let dependency = main_dependency();
        let raw = unsafe {
            create_render_pass(
                device.raw(),
                &attachments,
                &subpass,
                std::slice::from_ref(&dependency),
            )?
        };
        info!("main render pass: {color_format:?} samples={samples:?}");
        Ok(Self {
            device: Arc::clone(device),
            raw,
            color_format,
            samples,
        })
    }

    pub fn raw(&self) -> vk::RenderPass {
        self.raw
    }

    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    pub fn begin(
        &self,
        cmd: vk::CommandBuffer,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    ) {
        let clears = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let bi = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: self.raw,
            framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            clear_value_count: clears.len() as u32,
            p_clear_values: clears.as_ptr(),
            ..Default::default()
        };
        unsafe {
            self.device
                .raw()
                .cmd_begin_render_pass(cmd, &bi, vk::SubpassContents::INLINE)
        };
    }

    pub fn end(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.raw().cmd_end_render_pass(cmd) };
    }
}

impl Drop for MainRenderPass {
    fn drop(&mut self) {
        unsafe { self.device.raw().destroy_render_pass(self.raw, None) };
    }
}

/// Depth-only pass into a layered map, one layer per cascade. Owns the map,
/// its framebuffer and the sampler the main pass reads it with.
pub struct ShadowPass {
    device: Arc<DeviceContext>,
    raw: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    map: ImageArray,
    sampler: Sampler,
    size: u32,
}

impl ShadowPass {
    pub fn new(device: &Arc<DeviceContext>, size: u32, cascades: u32) -> VkResult<Self> {
        let d = device.raw();
        let attachment = shadow_attachment();
        let depth_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let subpass = vk::SubpassDescription {
            pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
            p_depth_stencil_attachment: &depth_ref,
            ..Default::default()
        };
        let deps = shadow_dependencies();
        let raw = unsafe {
            create_render_pass(d, std::slice::from_ref(&attachment), &subpass, &deps)?
        };

        let desc = ImageDesc::new(
            size,
            size,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
        );
        let built = ImageArray::new(device, desc, cascades).and_then(|map| {
            let view = map.view();
            let fci = vk::FramebufferCreateInfo {
                s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                render_pass: raw,
                attachment_count: 1,
                p_attachments: &view,
                width: size,
                height: size,
                layers: map.layers(),
                ..Default::default()
            };
            let framebuffer =
                unsafe { d.create_framebuffer(&fci, None) }.vk_op("create_framebuffer(shadow)")?;
            match Sampler::new(device, vk::SamplerAddressMode::CLAMP_TO_EDGE, 1) {
                Ok(sampler) => Ok((map, framebuffer, sampler)),
                Err(e) => {
                    unsafe { d.destroy_framebuffer(framebuffer, None) };
                    Err(e)
                }
            }
        });
        let (map, framebuffer, sampler) = match built {
            Ok(parts) => parts,
            Err(e) => {
                unsafe { d.destroy_render_pass(raw, None) };
                return Err(e);
            }
        };

        info!("shadow pass: {size}x{size} x {} cascades", map.layers());
        Ok(Self {
            device: Arc::clone(device),
            raw,
            framebuffer,
            map,
            sampler,
            size,
        })
    }

    pub fn raw(&self) -> vk::RenderPass {
        self.raw
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.size,
            height: self.size,
        }
    }

    pub fn cascades(&self) -> u32 {
        self.map.layers()
    }

    pub fn map_view(&self) -> vk::ImageView {
        self.map.view()
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler.raw()
    }

    /// Descriptor for binding the shadow map as a combined image sampler.
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler.raw(),
            image_view: self.map.view(),
            image_layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        }
    }

    pub fn begin(&self, cmd: vk::CommandBuffer) {
        let clear = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        };
        let bi = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: self.raw,
            framebuffer: self.framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.extent(),
            },
            clear_value_count: 1,
            p_clear_values: &clear,
            ..Default::default()
        };
        unsafe {
            self.device
                .raw()
                .cmd_begin_render_pass(cmd, &bi, vk::SubpassContents::INLINE)
        };
    }

    pub fn end(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.raw().cmd_end_render_pass(cmd) };
    }
}

// STRICT TEARDOWN ORDER: framebuffer, pass; map and sampler drop afterwards.
impl Drop for ShadowPass {
    fn drop(&mut self) {
        let d = self.device.raw();
        unsafe {
            d.destroy_framebuffer(self.framebuffer, None);
            d.destroy_render_pass(self.raw, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_pass_clears_and_resolves_to_present() {
        let [color, depth, resolve] =
            main_attachments(vk::Format::B8G8R8A8_SRGB, vk::SampleCountFlags::TYPE_8);
        assert_eq!(color.samples, vk::SampleCountFlags::TYPE_8);
        assert_eq!(color.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(color.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(color.final_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        assert_eq!(depth.format, DEPTH_FORMAT);
        assert_eq!(depth.samples, vk::SampleCountFlags::TYPE_8);
        assert_eq!(depth.store_op, vk::AttachmentStoreOp::DONT_CARE);

        assert_eq!(resolve.samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(resolve.load_op, vk::AttachmentLoadOp::DONT_CARE);
        assert_eq!(resolve.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(resolve.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn resolve_needs_a_multisampled_source() {
        assert!(matches!(
            check_main_samples(vk::SampleCountFlags::TYPE_1),
            Err(VkError::SingleSampleMainPass(_))
        ));
        assert!(check_main_samples(vk::SampleCountFlags::TYPE_2).is_ok());
        assert!(check_main_samples(vk::SampleCountFlags::TYPE_8).is_ok());
    }

    #[test]
    fn main_dependency_guards_attachment_writes() {
        let dep = main_dependency();
        assert_eq!(dep.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dep.dst_subpass, 0);
        assert!(dep
            .dst_access_mask
            .contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));
        assert!(dep
            .dst_access_mask
            .contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
    }

    #[test]
    fn shadow_map_ends_readable() {
        let a = shadow_attachment();
        assert_eq!(a.samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(a.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(a.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(
            a.final_layout,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn shadow_dependencies_form_a_barrier_pair() {
        let [before, after] = shadow_dependencies();
        assert_eq!(before.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(before.dst_subpass, 0);
        assert_eq!(before.src_access_mask, vk::AccessFlags::SHADER_READ);
        assert_eq!(
            before.dst_access_mask,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        );

        assert_eq!(after.src_subpass, 0);
        assert_eq!(after.dst_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(
            after.src_access_mask,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        );
        assert_eq!(after.dst_access_mask, vk::AccessFlags::SHADER_READ);
    }
}
