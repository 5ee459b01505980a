// SPDX-License-Identifier: CEPL-1.0
use crate::device::DeviceContext;
use crate::error::{VkContext, VkError, VkResult};
use crate::image::{Image, ImageDesc};
use crate::render_pass::{MainRenderPass, DEPTH_FORMAT};
use ash::vk;
use lumen_render::{FrameStatus, RenderSize};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapchainState {
    Uninitialized,
    Ready,
    Destroyed,
}

/// Outcome of acquiring a swapchain image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquired {
    Image(u32),
    NeedsResize,
}

/// One more than the minimum for overlap, capped by the maximum (0 = no max).
pub fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        want
    } else {
        want.min(caps.max_image_count).max(caps.min_image_count)
    }
}

pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// Everything the swapchain create call depends on, derived from the
/// surface capabilities alone. Equal inputs give an equal plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainPlan {
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainPlan {
    pub fn new(
        caps: &vk::SurfaceCapabilitiesKHR,
        surface_format: vk::SurfaceFormatKHR,
        present_mode: vk::PresentModeKHR,
        hint: RenderSize,
    ) -> Self {
        Self {
            extent: extent_from_caps(caps, hint),
            image_count: image_count(caps),
            format: surface_format.format,
            color_space: surface_format.color_space,
            present_mode,
            // anything else leaves a rotated display permanently suboptimal
            pre_transform: caps.current_transform,
        }
    }

    /// A minimised window reports a 0x0 current extent.
    pub fn has_area(&self) -> bool {
        self.extent.width > 0 && self.extent.height > 0
    }
}

/// Presentable images plus the owned MSAA targets and per-image framebuffers.
/// Resizing always tears everything down and rebuilds it.
pub struct Swapchain {
    device: Arc<DeviceContext>,
    state: SwapchainState,
    raw: vk::SwapchainKHR,
    plan: Option<SwapchainPlan>,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    color: Option<Image>,
    depth: Option<Image>,
}

impl Swapchain {
    pub fn new(device: &Arc<DeviceContext>) -> Self {
        Self {
            device: Arc::clone(device),
            state: SwapchainState::Uninitialized,
            raw: vk::SwapchainKHR::null(),
            plan: None,
            images: Vec::new(),
            views: Vec::new(),
            framebuffers: Vec::new(),
            color: None,
            depth: None,
        }
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    pub fn plan(&self) -> Option<&SwapchainPlan> {
        self.plan.as_ref()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.plan.map(|p| p.extent).unwrap_or_default()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn framebuffer(&self, index: u32) -> vk::Framebuffer {
        self.framebuffers[index as usize]
    }

    /// Builds the swapchain for the current surface size. Any failure leaves
    /// the swapchain destroyed rather than half-built.
    ///
    /// Precondition: nothing in flight references the old resources.
    pub fn create_resources(
        &mut self,
        render_pass: &MainRenderPass,
        hint: RenderSize,
    ) -> VkResult<()> {
        if self.state == SwapchainState::Ready {
            self.destroy_resources();
        }
        match self.build(render_pass, hint) {
            Ok(()) => {
                self.state = SwapchainState::Ready;
                Ok(())
            }
            Err(e) => {
                self.destroy_resources();
                Err(e)
            }
        }
    }

    fn build(&mut self, render_pass: &MainRenderPass, hint: RenderSize) -> VkResult<()> {
        // STRICT ORDER:
        // 1) fresh capabilities -> plan
        // 2) swapchain, images, views
        // 3) MSAA color + depth targets
        // 4) framebuffers [color, depth, resolve view] against the main pass
        let caps = self.device.surface_capabilities()?;
        let choice = *self.device.choice();
        let plan = SwapchainPlan::new(&caps, choice.surface_format, choice.present_mode, hint);
        if !plan.has_area() {
            return Err(VkError::EmptySurface);
        }
        self.plan = Some(plan);

        let families = choice.families;
        let family_indices = [families.graphics, families.present];
        let (sharing_mode, index_count, p_indices) = if families.is_shared() {
            (vk::SharingMode::EXCLUSIVE, 0, std::ptr::null())
        } else {
            (vk::SharingMode::CONCURRENT, 2, family_indices.as_ptr())
        };

        let info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: self.device.instance().surface(),
            min_image_count: plan.image_count,
            image_format: plan.format,
            image_color_space: plan.color_space,
            image_extent: plan.extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: sharing_mode,
            queue_family_index_count: index_count,
            p_queue_family_indices: p_indices,
            pre_transform: plan.pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: plan.present_mode,
            clipped: vk::TRUE,
            old_swapchain: vk::SwapchainKHR::null(),
            ..Default::default()
        };
        let loader = self.device.swapchain_loader();
        let d = self.device.raw();
        unsafe {
            self.raw = loader
                .create_swapchain(&info, None)
                .vk_op("create_swapchain")?;
            self.images = loader
                .get_swapchain_images(self.raw)
                .vk_op("get_swapchain_images")?;
        }

        for &image in &self.images {
            let ci = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: plan.format,
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ..Default::default()
            };
            let view = unsafe { d.create_image_view(&ci, None) }.vk_op("create_image_view")?;
            self.views.push(view);
        }

        let samples = render_pass.samples();
        let mut color = Image::new(
            &self.device,
            ImageDesc::new(
                plan.extent.width,
                plan.extent.height,
                plan.format,
                vk::ImageUsageFlags::TRANSIENT_ATTACHMENT | vk::ImageUsageFlags::COLOR_ATTACHMENT,
            )
            .samples(samples),
        )?;
        color.create_view(vk::ComponentMapping::default())?;
        let mut depth = Image::new(
            &self.device,
            ImageDesc::new(
                plan.extent.width,
                plan.extent.height,
                DEPTH_FORMAT,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            )
            .samples(samples),
        )?;
        depth.create_view(vk::ComponentMapping::default())?;

        for &view in &self.views {
            let attachments = [color.view(), depth.view(), view];
            let fci = vk::FramebufferCreateInfo {
                s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                render_pass: render_pass.raw(),
                attachment_count: attachments.len() as u32,
                p_attachments: attachments.as_ptr(),
                width: plan.extent.width,
                height: plan.extent.height,
                layers: 1,
                ..Default::default()
            };
            let fb = unsafe { d.create_framebuffer(&fci, None) }.vk_op("create_framebuffer")?;
            self.framebuffers.push(fb);
        }
        self.color = Some(color);
        self.depth = Some(depth);

        info!(
            "swapchain ready: {}x{} {:?} images={} (requested {}) present_mode={:?}",
            plan.extent.width,
            plan.extent.height,
            plan.format,
            self.images.len(),
            plan.image_count,
            plan.present_mode
        );
        Ok(())
    }

    // STRICT TEARDOWN ORDER: framebuffers, MSAA targets, views, swapchain.
    pub fn destroy_resources(&mut self) {
        let d = self.device.raw();
        unsafe {
            for fb in self.framebuffers.drain(..) {
                d.destroy_framebuffer(fb, None);
            }
            self.depth = None;
            self.color = None;
            for view in self.views.drain(..) {
                d.destroy_image_view(view, None);
            }
            self.images.clear();
            if self.raw != vk::SwapchainKHR::null() {
                self.device
                    .swapchain_loader()
                    .destroy_swapchain(self.raw, None);
                self.raw = vk::SwapchainKHR::null();
            }
        }
        if self.state != SwapchainState::Uninitialized {
            self.state = SwapchainState::Destroyed;
        }
        debug!("swapchain resources destroyed");
    }

    /// Full teardown then create. There is no partial resize.
    pub fn recreate(&mut self, render_pass: &MainRenderPass, hint: RenderSize) -> VkResult<()> {
        self.destroy_resources();
        self.create_resources(render_pass, hint)
    }

    pub fn acquire_next_image(&self, signal: vk::Semaphore) -> VkResult<Acquired> {
        let res = unsafe {
            self.device.swapchain_loader().acquire_next_image(
                self.raw,
                u64::MAX,
                signal,
                vk::Fence::null(),
            )
        };
        match res {
            // suboptimal still hands out an image and signals; present reports it
            Ok((index, _suboptimal)) => Ok(Acquired::Image(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::NeedsResize),
            Err(result) => Err(VkError::Vulkan {
                op: "acquire_next_image",
                result,
            }),
        }
    }

    pub fn present(&self, index: u32, wait: vk::Semaphore) -> VkResult<FrameStatus> {
        let info = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &self.raw,
            p_image_indices: &index,
            ..Default::default()
        };
        let loader = self.device.swapchain_loader();
        let present = |queue| unsafe { loader.queue_present(queue, &info) };
        // a shared family means the present queue is the graphics queue
        let res = if self.device.families().is_shared() {
            self.device.with_graphics_queue(present)
        } else {
            present(self.device.present_queue())
        };
        present_status(res)
    }
}

fn present_status(res: Result<bool, vk::Result>) -> VkResult<FrameStatus> {
    match res {
        Ok(false) => Ok(FrameStatus::Ok),
        Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(FrameStatus::NeedsResize),
        Err(e) => Err(e).vk_op("queue_present"),
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_resources();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32, current: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: current,
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        }
    }

    fn srgb() -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    const XGA: vk::Extent2D = vk::Extent2D {
        width: 1024,
        height: 768,
    };

    #[test]
    fn image_count_within_surface_limits() {
        for (min, max) in [(2, 8), (2, 3), (3, 3), (1, 2), (2, 0)] {
            let c = caps(min, max, XGA);
            let plan = SwapchainPlan::new(
                &c,
                srgb(),
                vk::PresentModeKHR::FIFO,
                RenderSize {
                    width: 1024,
                    height: 768,
                },
            );
            assert!(plan.image_count >= min, "min={min} max={max}");
            if max != 0 {
                assert!(plan.image_count <= max, "min={min} max={max}");
            }
            assert_eq!(plan.extent, XGA);
        }
        assert_eq!(image_count(&caps(2, 0, XGA)), 3);
        assert_eq!(image_count(&caps(3, 3, XGA)), 3);
    }

    #[test]
    fn free_size_surface_clamps_the_hint() {
        let c = caps(
            2,
            3,
            vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
        );
        let e = extent_from_caps(
            &c,
            RenderSize {
                width: 8000,
                height: 600,
            },
        );
        assert_eq!(
            e,
            vk::Extent2D {
                width: 4096,
                height: 600
            }
        );
    }

    #[test]
    fn unchanged_capabilities_recreate_identically() {
        let c = caps(2, 3, XGA);
        let hint = RenderSize {
            width: 1024,
            height: 768,
        };
        let first = SwapchainPlan::new(&c, srgb(), vk::PresentModeKHR::MAILBOX, hint);
        let again = SwapchainPlan::new(&c, srgb(), vk::PresentModeKHR::MAILBOX, hint);
        assert_eq!(first, again);
        assert_eq!(first.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn minimised_surface_has_no_area() {
        let c = caps(2, 3, vk::Extent2D::default());
        let plan = SwapchainPlan::new(
            &c,
            srgb(),
            vk::PresentModeKHR::FIFO,
            RenderSize {
                width: 1024,
                height: 768,
            },
        );
        assert!(!plan.has_area());
        let hint = RenderSize {
            width: 1,
            height: 1,
        };
        let restored = SwapchainPlan::new(&caps(2, 3, XGA), srgb(), vk::PresentModeKHR::FIFO, hint);
        assert!(restored.has_area());
    }

    #[test]
    fn rotated_display_keeps_its_transform() {
        let mut c = caps(2, 3, XGA);
        c.supported_transforms =
            vk::SurfaceTransformFlagsKHR::IDENTITY | vk::SurfaceTransformFlagsKHR::ROTATE_90;
        c.current_transform = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        let plan = SwapchainPlan::new(
            &c,
            srgb(),
            vk::PresentModeKHR::FIFO,
            RenderSize {
                width: 1024,
                height: 768,
            },
        );
        assert_eq!(plan.pre_transform, vk::SurfaceTransformFlagsKHR::ROTATE_90);
    }

    #[test]
    fn out_of_date_and_suboptimal_need_resize() {
        assert_eq!(present_status(Ok(false)).unwrap(), FrameStatus::Ok);
        assert_eq!(present_status(Ok(true)).unwrap(), FrameStatus::NeedsResize);
        assert_eq!(
            present_status(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            FrameStatus::NeedsResize
        );
        assert!(matches!(
            present_status(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(VkError::Vulkan {
                op: "queue_present",
                ..
            })
        ));
    }
}
