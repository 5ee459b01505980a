// SPDX-License-Identifier: CEPL-1.0
use crate::error::{VkContext, VkError, VkResult};
use crate::instance::InstanceContext;
use ash::khr::swapchain;
use ash::vk;
use lumen_core::{PresentModePref, RenderConfig};
use parking_lot::Mutex;
use std::ffi::c_void;
use std::sync::Arc;
use tracing::{debug, info, trace};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// One entry per distinct family, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Everything decided when the physical device was picked. Immutable afterwards;
/// surface capabilities are re-queried on every resize.
#[derive(Clone, Copy)]
pub struct PhysicalDeviceChoice {
    pub physical: vk::PhysicalDevice,
    pub families: QueueFamilies,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory: vk::PhysicalDeviceMemoryProperties,
    pub samples: vk::SampleCountFlags,
}

pub struct DeviceContext {
    instance: Arc<InstanceContext>,
    choice: PhysicalDeviceChoice,
    device: ash::Device,
    swapchain_loader: swapchain::Device,
    graphics_queue: Mutex<vk::Queue>,
    present_queue: vk::Queue,
    // one-shot pool and graphics queue are externally synchronized
    transfer_pool: Mutex<vk::CommandPool>,
}

/// Prefers one family that can do both; otherwise the first of each.
pub fn find_queue_families(
    props: &[vk::QueueFamilyProperties],
    present_support: impl Fn(u32) -> bool,
) -> Option<QueueFamilies> {
    let mut graphics = None;
    let mut present = None;
    for (i, q) in props.iter().enumerate() {
        let i = i as u32;
        let is_graphics = q.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let can_present = present_support(i);
        if is_graphics && can_present {
            return Some(QueueFamilies {
                graphics: i,
                present: i,
            });
        }
        if is_graphics && graphics.is_none() {
            graphics = Some(i);
        }
        if can_present && present.is_none() {
            present = Some(i);
        }
    }
    Some(QueueFamilies {
        graphics: graphics?,
        present: present?,
    })
}

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    vsync: bool,
    pref: PresentModePref,
) -> vk::PresentModeKHR {
    let order: &[vk::PresentModeKHR] = match (vsync, pref) {
        (false, _) => &[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX],
        (true, PresentModePref::Mailbox) => &[vk::PresentModeKHR::MAILBOX],
        (true, PresentModePref::Fifo) => &[],
    };
    order
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Highest multisampled count the device supports that does not exceed
/// `requested`. `None` when the device cannot multisample at all.
pub fn clamp_sample_count(
    requested: u32,
    supported: vk::SampleCountFlags,
) -> Option<vk::SampleCountFlags> {
    [
        (64, vk::SampleCountFlags::TYPE_64),
        (32, vk::SampleCountFlags::TYPE_32),
        (16, vk::SampleCountFlags::TYPE_16),
        (8, vk::SampleCountFlags::TYPE_8),
        (4, vk::SampleCountFlags::TYPE_4),
        (2, vk::SampleCountFlags::TYPE_2),
    ]
    .into_iter()
    .find(|&(n, flag)| n <= requested && supported.contains(flag))
    .map(|(_, flag)| flag)
}

pub fn find_memory_type_index(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        (type_bits & (1 << i)) != 0 && props.memory_types[i as usize].property_flags.contains(flags)
    })
}

/// Byte offset of item `index` when every item is padded to `align`.
pub fn align_ubo_size(item_size: u64, align: u64, index: u64) -> u64 {
    let align = align.max(1);
    item_size.div_ceil(align) * align * index
}

unsafe fn supports_descriptor_indexing(
    instance: &ash::Instance,
    phys: vk::PhysicalDevice,
) -> bool {
    let mut indexing = vk::PhysicalDeviceDescriptorIndexingFeatures {
        s_type: vk::StructureType::PHYSICAL_DEVICE_DESCRIPTOR_INDEXING_FEATURES,
        ..Default::default()
    };
    let mut feats2 = vk::PhysicalDeviceFeatures2 {
        s_type: vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
        p_next: (&mut indexing) as *mut _ as *mut c_void,
        ..Default::default()
    };
    unsafe { instance.get_physical_device_features2(phys, &mut feats2) };
    indexing.descriptor_binding_partially_bound == vk::TRUE
        && indexing.runtime_descriptor_array == vk::TRUE
        && indexing.descriptor_binding_variable_descriptor_count == vk::TRUE
        && indexing.descriptor_binding_sampled_image_update_after_bind == vk::TRUE
}

unsafe fn pick_physical_device(
    ctx: &InstanceContext,
    cfg: &RenderConfig,
) -> VkResult<PhysicalDeviceChoice> {
    let instance = ctx.instance();
    let surf = ctx.surface_loader();
    let surface = ctx.surface();

    let devices = unsafe { instance.enumerate_physical_devices() }
        .vk_op("enumerate_physical_devices")?;

    for phys in devices {
        let (props, feats) = unsafe {
            (
                instance.get_physical_device_properties(phys),
                instance.get_physical_device_features(phys),
            )
        };
        let name = props
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!("candidate device: {name}");

        if feats.geometry_shader != vk::TRUE || feats.sampler_anisotropy != vk::TRUE {
            debug!("\tskipped: missing geometryShader/samplerAnisotropy");
            continue;
        }

        let exts = unsafe { instance.enumerate_device_extension_properties(phys) }
            .vk_op("enumerate_device_extension_properties")?;
        let has_swapchain = exts.iter().any(|e| {
            e.extension_name_as_c_str()
                .map(|n| n == swapchain::NAME)
                .unwrap_or(false)
        });
        if !has_swapchain {
            debug!("\tskipped: no VK_KHR_swapchain");
            continue;
        }

        if !unsafe { supports_descriptor_indexing(instance, phys) } {
            debug!("\tskipped: descriptor indexing features missing");
            continue;
        }

        let qprops = unsafe { instance.get_physical_device_queue_family_properties(phys) };
        let Some(families) = find_queue_families(&qprops, |i| unsafe {
            surf.get_physical_device_surface_support(phys, i, surface)
                .unwrap_or(false)
        }) else {
            debug!("\tskipped: no graphics/present queue family");
            continue;
        };

        let (caps, formats, modes) = unsafe {
            (
                surf.get_physical_device_surface_capabilities(phys, surface)
                    .vk_op("get_physical_device_surface_capabilities")?,
                surf.get_physical_device_surface_formats(phys, surface)
                    .vk_op("get_physical_device_surface_formats")?,
                surf.get_physical_device_surface_present_modes(phys, surface)
                    .vk_op("get_physical_device_surface_present_modes")?,
            )
        };
        let Some(surface_format) = choose_surface_format(&formats) else {
            debug!("\tskipped: no surface formats");
            continue;
        };
        if modes.is_empty() {
            debug!("\tskipped: no present modes");
            continue;
        }

        let supported_samples = props.limits.framebuffer_color_sample_counts
            & props.limits.framebuffer_depth_sample_counts;
        let Some(samples) = clamp_sample_count(cfg.msaa_samples, supported_samples) else {
            debug!("\tskipped: no multisampled color+depth");
            continue;
        };
        let present_mode = choose_present_mode(&modes, cfg.vsync, cfg.present_mode);
        let memory = unsafe { instance.get_physical_device_memory_properties(phys) };

        info!(
            "picked {name}: graphics={} present={} format={:?} present_mode={:?} samples={:?}",
            families.graphics, families.present, surface_format.format, present_mode, samples
        );

        return Ok(PhysicalDeviceChoice {
            physical: phys,
            families,
            surface_format,
            present_mode,
            capabilities: caps,
            properties: props,
            memory,
            samples,
        });
    }
    Err(VkError::NoSuitableDevice)
}

impl DeviceContext {
    pub fn new(instance: Arc<InstanceContext>, cfg: &RenderConfig) -> VkResult<Arc<Self>> {
        unsafe {
            let choice = pick_physical_device(&instance, cfg)?;
            let priorities = [1.0_f32];
            let queue_infos: Vec<vk::DeviceQueueCreateInfo> = choice
                .families
                .unique()
                .into_iter()
                .map(|family| vk::DeviceQueueCreateInfo {
                    s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
                    queue_family_index: family,
                    queue_count: 1,
                    p_queue_priorities: priorities.as_ptr(),
                    ..Default::default()
                })
                .collect();

            let features = vk::PhysicalDeviceFeatures {
                sampler_anisotropy: vk::TRUE,
                fill_mode_non_solid: vk::TRUE,
                geometry_shader: vk::TRUE,
                ..Default::default()
            };
            // bindless texture table needs these; support was checked during selection
            let indexing = vk::PhysicalDeviceDescriptorIndexingFeatures {
                s_type: vk::StructureType::PHYSICAL_DEVICE_DESCRIPTOR_INDEXING_FEATURES,
                descriptor_binding_partially_bound: vk::TRUE,
                runtime_descriptor_array: vk::TRUE,
                descriptor_binding_variable_descriptor_count: vk::TRUE,
                descriptor_binding_sampled_image_update_after_bind: vk::TRUE,
                ..Default::default()
            };
            let device_exts = [swapchain::NAME.as_ptr()];

            let dinfo = vk::DeviceCreateInfo {
                s_type: vk::StructureType::DEVICE_CREATE_INFO,
                p_next: (&indexing) as *const _ as *const c_void,
                queue_create_info_count: queue_infos.len() as u32,
                p_queue_create_infos: queue_infos.as_ptr(),
                enabled_extension_count: device_exts.len() as u32,
                pp_enabled_extension_names: device_exts.as_ptr(),
                p_enabled_features: &features,
                ..Default::default()
            };
            let device = instance
                .instance()
                .create_device(choice.physical, &dinfo, None)
                .vk_op("create_device")?;

            let graphics_queue = device.get_device_queue(choice.families.graphics, 0);
            let present_queue = device.get_device_queue(choice.families.present, 0);

            let pool_info = vk::CommandPoolCreateInfo {
                s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
                queue_family_index: choice.families.graphics,
                flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                    | vk::CommandPoolCreateFlags::TRANSIENT,
                ..Default::default()
            };
            let transfer_pool = match device.create_command_pool(&pool_info, None) {
                Ok(p) => p,
                Err(e) => {
                    device.destroy_device(None);
                    return Err(VkError::Vulkan {
                        op: "create_command_pool",
                        result: e,
                    });
                }
            };

            let swapchain_loader = swapchain::Device::new(instance.instance(), &device);
            info!("vk device created");

            Ok(Arc::new(Self {
                instance,
                choice,
                device,
                swapchain_loader,
                graphics_queue: Mutex::new(graphics_queue),
                present_queue,
                transfer_pool: Mutex::new(transfer_pool),
            }))
        }
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &InstanceContext {
        &self.instance
    }

    pub fn choice(&self) -> &PhysicalDeviceChoice {
        &self.choice
    }

    pub fn physical(&self) -> vk::PhysicalDevice {
        self.choice.physical
    }

    pub fn families(&self) -> QueueFamilies {
        self.choice.families
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.choice.samples
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.choice.properties.limits
    }

    pub fn swapchain_loader(&self) -> &swapchain::Device {
        &self.swapchain_loader
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Runs `f` with exclusive access to the graphics queue.
    pub fn with_graphics_queue<R>(&self, f: impl FnOnce(vk::Queue) -> R) -> R {
        let q = self.graphics_queue.lock();
        f(*q)
    }

    /// Fresh capabilities for the current surface size.
    pub fn surface_capabilities(&self) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.instance
                .surface_loader()
                .get_physical_device_surface_capabilities(self.choice.physical, self.instance.surface())
                .vk_op("get_physical_device_surface_capabilities")
        }
    }

    pub fn find_memory_type(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> VkResult<u32> {
        find_memory_type_index(&self.choice.memory, type_bits, flags)
            .ok_or(VkError::NoMemoryType { type_bits, flags })
    }

    pub fn min_ubo_alignment(&self) -> u64 {
        self.limits().min_uniform_buffer_offset_alignment
    }

    pub fn align_ubo_item<T>(&self, index: u64) -> u64 {
        self.align_ubo_size(std::mem::size_of::<T>() as u64, index)
    }

    pub fn align_ubo_size(&self, item_size: u64, index: u64) -> u64 {
        align_ubo_size(item_size, self.min_ubo_alignment(), index)
    }

    pub fn max_anisotropy(&self) -> f32 {
        self.limits().max_sampler_anisotropy
    }

    /// Optimal-tiling feature check for `format`.
    pub fn format_supports(&self, format: vk::Format, features: vk::FormatFeatureFlags) -> bool {
        let props = unsafe {
            self.instance
                .instance()
                .get_physical_device_format_properties(self.choice.physical, format)
        };
        props.optimal_tiling_features.contains(features)
    }

    pub fn supports_linear_blit(&self, format: vk::Format) -> bool {
        self.format_supports(format, vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
    }

    pub(crate) fn allocate_memory(
        &self,
        req: vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> VkResult<vk::DeviceMemory> {
        let memory_type_index = self.find_memory_type(req.memory_type_bits, flags)?;
        let info = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index,
            ..Default::default()
        };
        unsafe { self.device.allocate_memory(&info, None) }.vk_op("allocate_memory")
    }

    /// Records `record` into a throwaway command buffer, submits it to the
    /// graphics queue and waits for the queue to go idle. Setup-time only:
    /// it stalls the queue.
    pub fn one_shot_command<R>(
        &self,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer) -> R,
    ) -> VkResult<R> {
        let pool = self.transfer_pool.lock();
        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: *pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let cmd = unsafe { self.device.allocate_command_buffers(&ai) }
            .vk_op("allocate_command_buffers(one-shot)")?[0];
        trace!("one-shot command begin");

        let result: VkResult<R> = (|| unsafe {
            let bi = vk::CommandBufferBeginInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            self.device
                .begin_command_buffer(cmd, &bi)
                .vk_op("begin_command_buffer(one-shot)")?;
            let out = record(&self.device, cmd);
            self.device
                .end_command_buffer(cmd)
                .vk_op("end_command_buffer(one-shot)")?;

            let si = vk::SubmitInfo {
                s_type: vk::StructureType::SUBMIT_INFO,
                command_buffer_count: 1,
                p_command_buffers: &cmd,
                ..Default::default()
            };
            self.with_graphics_queue(|q| {
                self.device
                    .queue_submit(q, std::slice::from_ref(&si), vk::Fence::null())
                    .vk_op("queue_submit(one-shot)")?;
                self.device
                    .queue_wait_idle(q)
                    .vk_op("queue_wait_idle(one-shot)")
            })?;
            Ok(out)
        })();

        unsafe { self.device.free_command_buffers(*pool, std::slice::from_ref(&cmd)) };
        trace!("one-shot command end");
        result
    }

    pub fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }.vk_op("device_wait_idle")
    }
}

// STRICT TEARDOWN ORDER: idle, pool, device. Every resource created from this
// device holds an Arc to it, so this runs last.
impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device
                .destroy_command_pool(*self.transfer_pool.get_mut(), None);
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn shared_family_preferred() {
        let props = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let f = find_queue_families(&props, |i| i != 0).unwrap();
        assert_eq!(f, QueueFamilies { graphics: 2, present: 2 });
        assert!(f.is_shared());
        assert_eq!(f.unique(), vec![2]);
    }

    #[test]
    fn split_families_when_needed() {
        let props = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        let f = find_queue_families(&props, |i| i == 1).unwrap();
        assert_eq!(f, QueueFamilies { graphics: 0, present: 1 });
        assert_eq!(f.unique(), vec![0, 1]);
    }

    #[test]
    fn no_present_no_device() {
        let props = [family(vk::QueueFlags::GRAPHICS)];
        assert!(find_queue_families(&props, |_| false).is_none());
    }

    #[test]
    fn surface_format_prefers_bgra_srgb() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::B8G8R8A8_SRGB
        );
        assert_eq!(
            choose_surface_format(&formats[..1]).unwrap().format,
            vk::Format::R8G8B8A8_UNORM
        );
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let all = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&all, true, PresentModePref::Mailbox),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&all, true, PresentModePref::Fifo),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], true, PresentModePref::Mailbox),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&all, false, PresentModePref::Fifo),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn sample_count_clamped_to_support() {
        let supported = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_2
            | vk::SampleCountFlags::TYPE_4;
        assert_eq!(clamp_sample_count(8, supported), Some(vk::SampleCountFlags::TYPE_4));
        assert_eq!(clamp_sample_count(2, supported), Some(vk::SampleCountFlags::TYPE_2));
        assert_eq!(clamp_sample_count(1, supported), None);
    }

    #[test]
    fn single_sample_device_has_no_main_pass_count() {
        assert_eq!(clamp_sample_count(8, vk::SampleCountFlags::TYPE_1), None);
    }

    #[test]
    fn memory_type_scan_respects_bits_and_flags() {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            ..Default::default()
        };
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        props.memory_types[2].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE;
        assert_eq!(find_memory_type_index(&props, 0b111, host), Some(1));
        assert_eq!(find_memory_type_index(&props, 0b100, host), Some(2));
        assert_eq!(
            find_memory_type_index(&props, 0b001, vk::MemoryPropertyFlags::HOST_COHERENT),
            None
        );
    }

    #[test]
    fn ubo_offsets_are_aligned_and_non_overlapping() {
        for align in [1u64, 4, 16, 64, 256] {
            for size in [1u64, 12, 16, 64, 100, 144, 257] {
                for i in 0..8u64 {
                    let a = align_ubo_size(size, align, i);
                    let b = align_ubo_size(size, align, i + 1);
                    assert_eq!(a % align, 0, "size={size} align={align} i={i}");
                    assert!(b - a >= size, "size={size} align={align} i={i}");
                }
            }
        }
    }

    #[test]
    fn ubo_alignment_matches_known_values() {
        assert_eq!(align_ubo_size(144, 256, 1), 256);
        assert_eq!(align_ubo_size(144, 256, 3), 768);
        assert_eq!(align_ubo_size(128, 64, 2), 256);
        assert_eq!(align_ubo_size(64, 0, 2), 128);
    }
}
