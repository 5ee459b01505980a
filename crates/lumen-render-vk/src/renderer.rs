// SPDX-License-Identifier: CEPL-1.0
//! Frame loop on top of the core objects: acquire, record, submit, present.
use crate::buffer::Buffer;
use crate::device::DeviceContext;
use crate::error::{VkContext, VkError, VkResult};
use crate::instance::InstanceContext;
use crate::pipeline::{
    DescriptorWrite, GraphicsPipeline, PassInfo, PassTarget, PipelineKey, VkPipelineFactory,
    VkPipelineStore,
};
use crate::render_pass::{MainRenderPass, ShadowPass};
use crate::shader::ShaderCatalog;
use crate::swapchain::{Acquired, Swapchain};
use crate::texture::{checker_texture, checker_upload, GpuTexture};
use crate::texture_set::TextureSet;
use anyhow::{bail, Context, Result};
use ash::vk;
use lumen_core::RenderConfig;
use lumen_math::{GenericUniform, GlobalUniform, ShadowUniform, TransformUniform, VertexFormat};
use lumen_render::{
    DrawCommand, FrameStatus, MeshHandle, RenderSize, Renderer, TextureSlot, TextureUpload,
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const FRAMES_IN_FLIGHT: usize = 2;

/// Per-frame capacity of the transform and material buffers.
pub const MAX_DRAWS_PER_FRAME: u64 = 4096;

struct Mesh {
    vertices: Buffer<VertexFormat>,
    indices: Buffer<u32>,
    index_count: u32,
}

struct FrameSync {
    image_available: vk::Semaphore,
    in_flight: vk::Fence,
    cmd: vk::CommandBuffer,
}

/// Uniform storage written by the host while this frame's slot is free.
struct FrameUniforms {
    globals: Buffer<GlobalUniform>,
    shadow: Buffer<ShadowUniform>,
    transforms: Buffer<TransformUniform>,
    materials: Buffer<GenericUniform>,
}

impl FrameUniforms {
    fn new(device: &Arc<DeviceContext>) -> VkResult<Self> {
        let usage = vk::BufferUsageFlags::UNIFORM_BUFFER;
        let props = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let mut u = Self {
            globals: Buffer::ubo_aligned(device, 1, usage, props)?,
            shadow: Buffer::ubo_aligned(device, 1, usage, props)?,
            transforms: Buffer::ubo_aligned(device, MAX_DRAWS_PER_FRAME, usage, props)?,
            materials: Buffer::ubo_aligned(device, MAX_DRAWS_PER_FRAME, usage, props)?,
        };
        // persistently mapped for the renderer's lifetime; Drop unmaps
        u.globals.map()?;
        u.shadow.map()?;
        u.transforms.map()?;
        u.materials.map()?;
        Ok(u)
    }
}

struct QueuedDraw {
    pipeline: Arc<GraphicsPipeline>,
    mesh: usize,
    slot: u64,
}

pub struct VkRenderer {
    // STRICT FIELD ORDER: fields drop top to bottom after `Drop::drop` has
    // idled the device, so dependents come before what they were built from.
    queued: Vec<QueuedDraw>,
    descriptor_sets: HashMap<(PipelineKey, usize), vk::DescriptorSet>,
    meshes: Vec<Mesh>,
    textures: Vec<GpuTexture>,
    fallback: GpuTexture,
    uniforms: Vec<FrameUniforms>,
    store: VkPipelineStore,
    texture_set: TextureSet,
    shaders: Arc<ShaderCatalog>,
    swapchain: Swapchain,
    shadow_pass: ShadowPass,
    main_pass: MainRenderPass,
    device: Arc<DeviceContext>,
    instance: Arc<InstanceContext>,

    cmd_pool: vk::CommandPool,
    frames: Vec<FrameSync>,
    /// One per swapchain image; present waits on the image's own semaphore.
    render_finished: Vec<vk::Semaphore>,
    frame: usize,
    image_index: Option<u32>,
    size: RenderSize,
    paused: bool,
    clear: [f32; 4],
    shadow_uniform: ShadowUniform,
}

fn create_frame_sync(
    device: &ash::Device,
    pool: vk::CommandPool,
) -> VkResult<Vec<FrameSync>> {
    let ai = vk::CommandBufferAllocateInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
        command_pool: pool,
        level: vk::CommandBufferLevel::PRIMARY,
        command_buffer_count: FRAMES_IN_FLIGHT as u32,
        ..Default::default()
    };
    let cmds = unsafe { device.allocate_command_buffers(&ai) }.vk_op("allocate_command_buffers")?;
    let sem_ci = vk::SemaphoreCreateInfo {
        s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
        ..Default::default()
    };
    // signaled so the first wait on each slot returns immediately
    let fence_ci = vk::FenceCreateInfo {
        s_type: vk::StructureType::FENCE_CREATE_INFO,
        flags: vk::FenceCreateFlags::SIGNALED,
        ..Default::default()
    };
    let mut frames = Vec::with_capacity(FRAMES_IN_FLIGHT);
    for cmd in cmds {
        unsafe {
            let image_available = device
                .create_semaphore(&sem_ci, None)
                .vk_op("create_semaphore(image_available)")?;
            let in_flight = match device.create_fence(&fence_ci, None) {
                Ok(f) => f,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    return Err(e).vk_op("create_fence(in_flight)");
                }
            };
            frames.push(FrameSync {
                image_available,
                in_flight,
                cmd,
            });
        }
    }
    Ok(frames)
}

fn create_semaphores(device: &ash::Device, count: usize) -> VkResult<Vec<vk::Semaphore>> {
    let ci = vk::SemaphoreCreateInfo {
        s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
        ..Default::default()
    };
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        match unsafe { device.create_semaphore(&ci, None) } {
            Ok(s) => out.push(s),
            Err(e) => {
                for s in out {
                    unsafe { device.destroy_semaphore(s, None) };
                }
                return Err(e).vk_op("create_semaphore(render_finished)");
            }
        }
    }
    Ok(out)
}

/// `Ok(false)` when the surface has no area yet and the swapchain waits for a
/// later resize.
fn swapchain_built(res: VkResult<()>) -> VkResult<bool> {
    match res {
        Ok(()) => Ok(true),
        Err(VkError::EmptySurface) => Ok(false),
        Err(e) => Err(e),
    }
}

impl VkRenderer {
    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    pub fn instance(&self) -> &Arc<InstanceContext> {
        &self.instance
    }

    pub fn pipelines(&self) -> &VkPipelineStore {
        &self.store
    }

    pub fn texture_set(&self) -> &TextureSet {
        &self.texture_set
    }

    pub fn shaders(&self) -> &Arc<ShaderCatalog> {
        &self.shaders
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    /// Checker texture bound at slot 0.
    pub fn fallback_texture(&self) -> &GpuTexture {
        &self.fallback
    }

    /// Cascade matrices used by the next `begin_frame`.
    pub fn set_shadow_uniform(&mut self, shadow: ShadowUniform) {
        self.shadow_uniform = shadow;
    }

    fn descriptor_set(&mut self, pipeline: &GraphicsPipeline) -> Result<vk::DescriptorSet> {
        let key = (pipeline.key(), self.frame);
        if let Some(&set) = self.descriptor_sets.get(&key) {
            return Ok(set);
        }
        let set = pipeline
            .allocate_descriptor_set()
            .with_context(|| format!("descriptor set for {}", pipeline.key().shader))?;
        let u = &self.uniforms[self.frame];
        let writes = match pipeline.config().target {
            PassTarget::Swapchain => vec![
                DescriptorWrite::Buffer {
                    binding: 0,
                    info: u.globals.slice(0)?.descriptor_info(),
                },
                DescriptorWrite::Buffer {
                    binding: 1,
                    info: u.transforms.slice(0)?.descriptor_info(),
                },
                DescriptorWrite::Buffer {
                    binding: 2,
                    info: u.materials.slice(0)?.descriptor_info(),
                },
                DescriptorWrite::Image {
                    binding: 16,
                    info: self.shadow_pass.descriptor_info(),
                },
            ],
            PassTarget::Shadow => vec![
                DescriptorWrite::Buffer {
                    binding: 0,
                    info: u.shadow.slice(0)?.descriptor_info(),
                },
                DescriptorWrite::Buffer {
                    binding: 1,
                    info: u.transforms.slice(0)?.descriptor_info(),
                },
            ],
        };
        pipeline.write_descriptor_set(set, &writes);
        self.descriptor_sets.insert(key, set);
        Ok(set)
    }

    fn record_draws(&mut self, cmd: vk::CommandBuffer, target: PassTarget) -> Result<usize> {
        let queued: Vec<(Arc<GraphicsPipeline>, usize, u64)> = self
            .queued
            .iter()
            .filter(|q| q.pipeline.config().target == target)
            .map(|q| (Arc::clone(&q.pipeline), q.mesh, q.slot))
            .collect();
        for (pipeline, mesh, slot) in &queued {
            let set = self.descriptor_set(pipeline)?;
            let u = &self.uniforms[self.frame];
            let transform = u.transforms.dynamic_offset(*slot)?;
            pipeline.bind(cmd);
            match target {
                PassTarget::Swapchain => {
                    let material = u.materials.dynamic_offset(*slot)?;
                    pipeline.bind_descriptors(
                        cmd,
                        &[set, self.texture_set.set()],
                        &[transform, material],
                    );
                }
                PassTarget::Shadow => pipeline.bind_descriptors(cmd, &[set], &[transform]),
            }
            let m = &self.meshes[*mesh];
            let d = self.device.raw();
            unsafe {
                d.cmd_bind_vertex_buffers(cmd, 0, &[m.vertices.raw()], &[0]);
                d.cmd_bind_index_buffer(cmd, m.indices.raw(), 0, vk::IndexType::UINT32);
                d.cmd_draw_indexed(cmd, m.index_count, 1, 0, 0, 0);
            }
        }
        Ok(queued.len())
    }

    fn record_frame(&mut self, image_index: u32) -> Result<vk::CommandBuffer> {
        let cmd = self.frames[self.frame].cmd;
        let d = self.device.raw().clone();
        unsafe {
            d.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("reset_command_buffer")?;
            let bi = vk::CommandBufferBeginInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            d.begin_command_buffer(cmd, &bi)
                .context("begin_command_buffer")?;
        }

        // the shadow map is sampled by the main pass, so it is always rendered first
        self.shadow_pass.begin(cmd);
        let shadow_draws = self.record_draws(cmd, PassTarget::Shadow)?;
        self.shadow_pass.end(cmd);

        let framebuffer = self.swapchain.framebuffer(image_index);
        let extent = self.swapchain.extent();
        self.main_pass.begin(cmd, framebuffer, extent, self.clear);
        let main_draws = self.record_draws(cmd, PassTarget::Swapchain)?;
        self.main_pass.end(cmd);

        unsafe { d.end_command_buffer(cmd) }.context("end_command_buffer")?;
        debug!("recorded frame: {shadow_draws} shadow draws, {main_draws} main draws");
        Ok(cmd)
    }

    fn recreate_render_finished(&mut self) -> Result<()> {
        let d = self.device.raw();
        for s in self.render_finished.drain(..) {
            unsafe { d.destroy_semaphore(s, None) };
        }
        self.render_finished = create_semaphores(d, self.swapchain.image_count())?;
        Ok(())
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        config: &RenderConfig,
    ) -> Result<Self> {
        // STRICT ORDER:
        // 1) instance + surface, then device against that surface
        // 2) passes, then swapchain targets built for the main pass
        // 3) texture set layout before any pipeline layout that includes it
        // 4) fallback texture in slot 0 before the first frame
        let instance = Arc::new(InstanceContext::new(window, display, config.validation)?);
        let device = DeviceContext::new(Arc::clone(&instance), config).context("create device")?;

        let main_pass = MainRenderPass::new(&device).context("main render pass")?;
        let shadow_pass = ShadowPass::new(&device, config.shadow_map_size, config.cascade_count)
            .context("shadow pass")?;
        let mut swapchain = Swapchain::new(&device);
        let presentable = !size.is_empty()
            && swapchain_built(swapchain.create_resources(&main_pass, size))
                .context("create swapchain")?;
        if !presentable {
            info!("surface has no area yet, swapchain deferred to the first resize");
        }

        let texture_set =
            TextureSet::new(&device, config.texture_capacity).context("texture set")?;
        let shaders = Arc::new(ShaderCatalog::new(&device, &config.shader_root));
        let factory = VkPipelineFactory::new(
            &device,
            Arc::clone(&shaders),
            PassInfo {
                render_pass: main_pass.raw(),
                samples: main_pass.samples(),
            },
            PassInfo {
                render_pass: shadow_pass.raw(),
                samples: vk::SampleCountFlags::TYPE_1,
            },
            shadow_pass.extent(),
            texture_set.layout(),
        );
        let store = VkPipelineStore::new(factory, swapchain.extent());

        let checker = checker_texture();
        let fallback =
            GpuTexture::upload(&device, &checker_upload(&checker)).context("fallback texture")?;
        texture_set.set_fallback(fallback.view(), fallback.sampler());

        let uniforms = (0..FRAMES_IN_FLIGHT)
            .map(|_| FrameUniforms::new(&device))
            .collect::<VkResult<Vec<_>>>()
            .context("frame uniforms")?;

        let d = device.raw();
        let pool_ci = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            queue_family_index: device.families().graphics,
            ..Default::default()
        };
        let cmd_pool = unsafe { d.create_command_pool(&pool_ci, None) }.context("create_command_pool")?;
        let frames = match create_frame_sync(d, cmd_pool) {
            Ok(f) => f,
            Err(e) => {
                unsafe { d.destroy_command_pool(cmd_pool, None) };
                return Err(e).context("frame sync objects");
            }
        };
        let render_finished = create_semaphores(d, swapchain.image_count());

        let mut r = Self {
            queued: Vec::new(),
            descriptor_sets: HashMap::new(),
            meshes: Vec::new(),
            textures: Vec::new(),
            fallback,
            uniforms,
            store,
            texture_set,
            shaders,
            swapchain,
            shadow_pass,
            main_pass,
            device,
            instance,
            cmd_pool,
            frames,
            render_finished: Vec::new(),
            frame: 0,
            image_index: None,
            size,
            paused: !presentable,
            clear: config.clear_color,
            shadow_uniform: ShadowUniform::default(),
        };
        // assigned after construction so Drop cleans up the pool on failure
        r.render_finished = render_finished.context("render-finished semaphores")?;

        let extent = r.swapchain.extent();
        info!(
            "Vulkan renderer ready ({}x{}, {} swapchain images, {} texture slots)",
            extent.width,
            extent.height,
            r.swapchain.image_count(),
            r.texture_set.capacity()
        );
        Ok(r)
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        self.size = size;
        if size.is_empty() {
            if !self.paused {
                info!("window minimised, rendering paused");
            }
            self.paused = true;
            return Ok(());
        }
        self.paused = false;
        self.image_index = None;
        self.queued.clear();

        // STRICT ORDER: idle, swapchain pipelines, swapchain, pipelines again.
        self.device.wait_idle().context("wait_idle(resize)")?;
        self.store.destroy_swapchain_resources();
        let built = swapchain_built(self.swapchain.recreate(&self.main_pass, size))
            .context("recreate swapchain")?;
        if !built {
            info!("surface has no area, rendering paused");
            self.paused = true;
            return Ok(());
        }
        let extent = self.swapchain.extent();
        self.store
            .create_swapchain_resources(extent)
            .context("rebuild swapchain pipelines")?;
        self.recreate_render_finished()?;
        info!("resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    fn begin_frame(&mut self, globals: &GlobalUniform) -> Result<FrameStatus> {
        if self.paused {
            return Ok(FrameStatus::NeedsResize);
        }
        if self.image_index.is_some() {
            bail!("begin_frame called twice without end_frame");
        }
        let (in_flight, image_available) = {
            let sync = &self.frames[self.frame];
            (sync.in_flight, sync.image_available)
        };
        unsafe { self.device.raw().wait_for_fences(&[in_flight], true, u64::MAX) }
            .context("wait_for_fences(in_flight)")?;

        let image = match self.swapchain.acquire_next_image(image_available)? {
            Acquired::Image(i) => i,
            Acquired::NeedsResize => {
                debug!("acquire reported an out-of-date swapchain");
                let size = self.size;
                self.resize(size)?;
                return Ok(FrameStatus::NeedsResize);
            }
        };
        // reset only once an image is guaranteed to be submitted against it
        unsafe { self.device.raw().reset_fences(&[in_flight]) }.context("reset_fences")?;

        let u = &mut self.uniforms[self.frame];
        u.globals.load_mapped(0, globals)?;
        u.shadow.load_mapped(0, &self.shadow_uniform)?;
        self.queued.clear();
        self.image_index = Some(image);
        Ok(FrameStatus::Ok)
    }

    fn draw(&mut self, cmd: &DrawCommand) -> Result<()> {
        if self.image_index.is_none() {
            bail!("draw called outside begin_frame/end_frame");
        }
        let slot = self.queued.len() as u64;
        if slot >= MAX_DRAWS_PER_FRAME {
            bail!("more than {MAX_DRAWS_PER_FRAME} draws in one frame");
        }
        let mesh = cmd.mesh.0 as usize;
        if mesh >= self.meshes.len() {
            bail!("unknown mesh handle {}", cmd.mesh.0);
        }
        let pipeline = self
            .store
            .get_or_create(cmd.shader, cmd.topology)
            .with_context(|| format!("pipeline for {} / {:?}", cmd.shader, cmd.topology))?;
        let u = &mut self.uniforms[self.frame];
        u.transforms.load_mapped(slot, &cmd.transform)?;
        u.materials.load_mapped(slot, &cmd.material)?;
        self.queued.push(QueuedDraw {
            pipeline,
            mesh,
            slot,
        });
        Ok(())
    }

    fn end_frame(&mut self) -> Result<FrameStatus> {
        let Some(image_index) = self.image_index.take() else {
            // nothing was acquired, so there is nothing to present
            return Ok(FrameStatus::NeedsResize);
        };
        // must happen outside any render pass
        self.texture_set.ensure_updated();
        let cmd = self.record_frame(image_index)?;
        self.queued.clear();

        let sync = &self.frames[self.frame];
        let render_finished = self.render_finished[image_index as usize];
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &sync.image_available,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &render_finished,
            ..Default::default()
        };
        let d = self.device.raw();
        self.device
            .with_graphics_queue(|q| unsafe {
                d.queue_submit(q, std::slice::from_ref(&submit), sync.in_flight)
            })
            .context("queue_submit")?;

        let status = self
            .swapchain
            .present(image_index, render_finished)
            .context("present")?;
        self.frame = (self.frame + 1) % FRAMES_IN_FLIGHT;
        if status == FrameStatus::NeedsResize {
            debug!("present reported a stale swapchain");
            let size = self.size;
            self.resize(size)?;
        }
        Ok(status)
    }

    fn upload_mesh(&mut self, vertices: &[VertexFormat], indices: &[u32]) -> Result<MeshHandle> {
        if vertices.is_empty() || indices.is_empty() {
            bail!("mesh needs at least one vertex and one index");
        }
        let dev = &self.device;
        let staged_v = Buffer::staging_with(dev, vertices).context("vertex staging")?;
        let vbuf = Buffer::<VertexFormat>::packed(
            dev,
            vertices.len() as u64,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        vbuf.copy_from(&staged_v).context("vertex upload")?;

        let staged_i = Buffer::staging_with(dev, indices).context("index staging")?;
        let ibuf = Buffer::<u32>::packed(
            dev,
            indices.len() as u64,
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        ibuf.copy_from(&staged_i).context("index upload")?;

        let handle = MeshHandle(self.meshes.len() as u32);
        self.meshes.push(Mesh {
            vertices: vbuf,
            indices: ibuf,
            index_count: indices.len() as u32,
        });
        debug!(
            "mesh {} uploaded: {} vertices, {} indices",
            handle.0,
            vertices.len(),
            indices.len()
        );
        Ok(handle)
    }

    fn register_texture(&mut self, upload: &TextureUpload<'_>) -> Result<TextureSlot> {
        let tex = GpuTexture::upload(&self.device, upload).with_context(|| {
            format!(
                "upload {}x{} {:?} texture",
                upload.width, upload.height, upload.format
            )
        })?;
        let slot = self.texture_set.add_texture(tex.view(), tex.sampler())?;
        self.textures.push(tex);
        Ok(slot)
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear = rgba;
    }
}

// STRICT TEARDOWN ORDER: idle, then sync objects and the frame pool, then
// fields in declaration order (draw state, resources, pipelines, texture
// set, swapchain, passes, device, instance).
impl Drop for VkRenderer {
    fn drop(&mut self) {
        let d = self.device.raw();
        if let Err(e) = self.device.wait_idle() {
            warn!("wait_idle during teardown: {e}");
        }
        unsafe {
            for s in self.render_finished.drain(..) {
                d.destroy_semaphore(s, None);
            }
            for f in self.frames.drain(..) {
                d.destroy_fence(f.in_flight, None);
                d.destroy_semaphore(f.image_available, None);
            }
            d.destroy_command_pool(self.cmd_pool, None);
        }
        self.queued.clear();
        self.store.destroy_all();
        debug!(
            "renderer torn down ({} meshes, {} textures)",
            self.meshes.len(),
            self.textures.len() + 1
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_surface_defers_instead_of_failing() {
        assert!(swapchain_built(Ok(())).unwrap());
        assert!(!swapchain_built(Err(VkError::EmptySurface)).unwrap());
        assert!(matches!(
            swapchain_built(Err(VkError::NoSuitableDevice)),
            Err(VkError::NoSuitableDevice)
        ));
    }
}
