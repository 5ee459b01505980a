// SPDX-License-Identifier: CEPL-1.0
use super::config::{vk_topology, PassTarget, PipelineConfig};
use super::store::{PipelineFactory, PipelineKey};
use crate::device::{clamp_sample_count, DeviceContext};
use crate::error::{VkContext, VkResult};
use crate::shader::{ShaderCatalog, ShaderStages};
use ash::vk::{self, Handle};
use lumen_math::VertexFormat;
use portable_atomic::{AtomicU64, Ordering};
use std::mem::size_of;
use std::sync::Arc;
use tracing::{trace, warn};

/// Render pass a pipeline is compiled against.
#[derive(Clone, Copy, Debug)]
pub struct PassInfo {
    pub render_pass: vk::RenderPass,
    pub samples: vk::SampleCountFlags,
}

/// One resource to write into a pipeline's descriptor set.
#[derive(Clone, Copy, Debug)]
pub enum DescriptorWrite {
    Buffer {
        binding: u32,
        info: vk::DescriptorBufferInfo,
    },
    Image {
        binding: u32,
        info: vk::DescriptorImageInfo,
    },
}

pub fn vertex_bindings() -> vk::VertexInputBindingDescription {
    vk::VertexInputBindingDescription {
        binding: 0,
        stride: size_of::<VertexFormat>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    }
}

/// position, uv, normal, tangent, bitangent at locations 0..=4.
pub fn vertex_attributes() -> [vk::VertexInputAttributeDescription; 5] {
    let attr = |location, format, offset: usize| vk::VertexInputAttributeDescription {
        location,
        binding: 0,
        format,
        offset: offset as u32,
    };
    [
        attr(0, vk::Format::R32G32B32_SFLOAT, VertexFormat::POSITION_OFFSET),
        attr(1, vk::Format::R32G32_SFLOAT, VertexFormat::TEX_COORDS_OFFSET),
        attr(2, vk::Format::R32G32B32_SFLOAT, VertexFormat::NORMAL_OFFSET),
        attr(3, vk::Format::R32G32B32_SFLOAT, VertexFormat::TANGENT_OFFSET),
        attr(4, vk::Format::R32G32B32_SFLOAT, VertexFormat::BITANGENT_OFFSET),
    ]
}

/// Y-flipped viewports keep the engine's up-is-positive convention.
pub fn viewport(extent: vk::Extent2D, invert_y: bool) -> vk::Viewport {
    let (w, h) = (extent.width as f32, extent.height as f32);
    if invert_y {
        vk::Viewport {
            x: 0.0,
            y: h,
            width: w,
            height: -h,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    } else {
        vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: w,
            height: h,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// A compiled pipeline plus its layout and descriptor pool. The pipeline
/// object itself is swapped out on resize; everything else lives as long
/// as the cache entry.
pub struct GraphicsPipeline {
    device: Arc<DeviceContext>,
    key: PipelineKey,
    config: &'static PipelineConfig,
    stages: Arc<ShaderStages>,
    pass: PassInfo,
    descriptor_pool: vk::DescriptorPool,
    set_layout: vk::DescriptorSetLayout,
    layout: vk::PipelineLayout,
    raw: AtomicU64,
}

impl GraphicsPipeline {
    fn new(
        device: &Arc<DeviceContext>,
        key: PipelineKey,
        config: &'static PipelineConfig,
        stages: Arc<ShaderStages>,
        pass: PassInfo,
        texture_layout: Option<vk::DescriptorSetLayout>,
        extent: vk::Extent2D,
    ) -> VkResult<Self> {
        // null handles are skipped by Drop, so a failure part way leaks nothing
        let mut p = Self {
            device: Arc::clone(device),
            key,
            config,
            stages,
            pass,
            descriptor_pool: vk::DescriptorPool::null(),
            set_layout: vk::DescriptorSetLayout::null(),
            layout: vk::PipelineLayout::null(),
            raw: AtomicU64::new(0),
        };
        let d = device.raw();

        let sizes = config.pool_sizes();
        let pool_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: config.max_sets,
            pool_size_count: sizes.len() as u32,
            p_pool_sizes: sizes.as_ptr(),
            ..Default::default()
        };
        p.descriptor_pool =
            unsafe { d.create_descriptor_pool(&pool_ci, None) }.vk_op("create_descriptor_pool")?;

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = config
            .bindings
            .iter()
            .map(|b| vk::DescriptorSetLayoutBinding {
                binding: b.binding,
                descriptor_type: b.ty,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::ALL_GRAPHICS,
                ..Default::default()
            })
            .collect();
        let set_ci = vk::DescriptorSetLayoutCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
            binding_count: bindings.len() as u32,
            p_bindings: bindings.as_ptr(),
            ..Default::default()
        };
        p.set_layout = unsafe { d.create_descriptor_set_layout(&set_ci, None) }
            .vk_op("create_descriptor_set_layout")?;

        // set 0: this pipeline's uniforms; set 1: the shared texture table
        let mut set_layouts = vec![p.set_layout];
        set_layouts.extend(texture_layout);
        let layout_ci = vk::PipelineLayoutCreateInfo {
            s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
            set_layout_count: set_layouts.len() as u32,
            p_set_layouts: set_layouts.as_ptr(),
            ..Default::default()
        };
        p.layout = unsafe { d.create_pipeline_layout(&layout_ci, None) }
            .vk_op("create_pipeline_layout")?;

        let raw = p.build_raw(extent)?;
        p.raw.store(raw.as_raw(), Ordering::Release);
        Ok(p)
    }

    fn build_raw(&self, extent: vk::Extent2D) -> VkResult<vk::Pipeline> {
        let cfg = self.config;
        let binding = vertex_bindings();
        let attrs = vertex_attributes();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
            vertex_binding_description_count: 1,
            p_vertex_binding_descriptions: &binding,
            vertex_attribute_description_count: attrs.len() as u32,
            p_vertex_attribute_descriptions: attrs.as_ptr(),
            ..Default::default()
        };
        let (topology, restart) = vk_topology(self.key.topology);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
            topology,
            primitive_restart_enable: restart.into(),
            ..Default::default()
        };
        let vp = viewport(extent, cfg.invert_y);
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let viewport_state = vk::PipelineViewportStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
            viewport_count: 1,
            p_viewports: &vp,
            scissor_count: 1,
            p_scissors: &scissor,
            ..Default::default()
        };
        let raster = vk::PipelineRasterizationStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
            polygon_mode: cfg.polygon_mode,
            cull_mode: cfg.cull_mode,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            ..Default::default()
        };
        let msaa = vk::PipelineMultisampleStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
            rasterization_samples: clamp_sample_count(cfg.samples, self.pass.samples)
                .unwrap_or(vk::SampleCountFlags::TYPE_1),
            min_sample_shading: 1.0,
            ..Default::default()
        };
        let blend = vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::TRUE,
            src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ZERO,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        };
        // the shadow pass has no color attachment
        let color_attachments = match cfg.target {
            PassTarget::Swapchain => 1,
            PassTarget::Shadow => 0,
        };
        let color_blend = vk::PipelineColorBlendStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
            logic_op: vk::LogicOp::COPY,
            attachment_count: color_attachments,
            p_attachments: &blend,
            ..Default::default()
        };
        let depth = vk::PipelineDepthStencilStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_DEPTH_STENCIL_STATE_CREATE_INFO,
            depth_test_enable: cfg.depth_test.into(),
            depth_write_enable: vk::TRUE,
            depth_compare_op: vk::CompareOp::LESS,
            ..Default::default()
        };
        let stages = self.stages.stage_infos();

        let ci = vk::GraphicsPipelineCreateInfo {
            s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
            stage_count: stages.len() as u32,
            p_stages: stages.as_ptr(),
            p_vertex_input_state: &vertex_input,
            p_input_assembly_state: &input_assembly,
            p_viewport_state: &viewport_state,
            p_rasterization_state: &raster,
            p_multisample_state: &msaa,
            p_depth_stencil_state: &depth,
            p_color_blend_state: &color_blend,
            layout: self.layout,
            render_pass: self.pass.render_pass,
            subpass: 0,
            base_pipeline_index: -1,
            ..Default::default()
        };
        let pipelines = unsafe {
            self.device.raw().create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(&ci),
                None,
            )
        }
        .map_err(|(_, e)| e)
        .vk_op("create_graphics_pipelines")?;
        trace!(
            "pipeline built: {} / {:?} at {}x{}",
            self.key.shader,
            self.key.topology,
            extent.width,
            extent.height
        );
        Ok(pipelines[0])
    }

    pub fn key(&self) -> PipelineKey {
        self.key
    }

    pub fn config(&self) -> &'static PipelineConfig {
        self.config
    }

    pub fn raw(&self) -> vk::Pipeline {
        vk::Pipeline::from_raw(self.raw.load(Ordering::Acquire))
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn bind(&self, cmd: vk::CommandBuffer) {
        unsafe {
            self.device
                .raw()
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.raw())
        };
    }

    /// Binds `sets` starting at set 0. One dynamic offset per dynamic
    /// binding, in binding order.
    pub fn bind_descriptors(
        &self,
        cmd: vk::CommandBuffer,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        unsafe {
            self.device.raw().cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.layout,
                0,
                sets,
                dynamic_offsets,
            )
        };
    }

    pub fn allocate_descriptor_set(&self) -> VkResult<vk::DescriptorSet> {
        let ai = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: self.descriptor_pool,
            descriptor_set_count: 1,
            p_set_layouts: &self.set_layout,
            ..Default::default()
        };
        let sets = unsafe { self.device.raw().allocate_descriptor_sets(&ai) }
            .vk_op("allocate_descriptor_sets")?;
        Ok(sets[0])
    }

    /// Writes each resource using the descriptor type configured for its
    /// binding. Bindings this pipeline does not declare are skipped.
    pub fn write_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .filter_map(|w| {
                let binding = match w {
                    DescriptorWrite::Buffer { binding, .. } | DescriptorWrite::Image { binding, .. } => {
                        *binding
                    }
                };
                let Some(ty) = self.config.descriptor_type(binding) else {
                    warn!("{}: no binding {binding} in pipeline layout", self.key.shader);
                    return None;
                };
                let mut out = vk::WriteDescriptorSet {
                    s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                    dst_set: set,
                    dst_binding: binding,
                    dst_array_element: 0,
                    descriptor_count: 1,
                    descriptor_type: ty,
                    ..Default::default()
                };
                match w {
                    DescriptorWrite::Buffer { info, .. } => out.p_buffer_info = info,
                    DescriptorWrite::Image { info, .. } => out.p_image_info = info,
                }
                Some(out)
            })
            .collect();
        unsafe { self.device.raw().update_descriptor_sets(&vk_writes, &[]) };
    }

    fn destroy_raw(&self) {
        let old = self.raw.swap(0, Ordering::AcqRel);
        if old != 0 {
            unsafe {
                self.device
                    .raw()
                    .destroy_pipeline(vk::Pipeline::from_raw(old), None)
            };
        }
    }

    fn rebuild(&self, extent: vk::Extent2D) -> VkResult<()> {
        let new = self.build_raw(extent)?;
        let old = self.raw.swap(new.as_raw(), Ordering::AcqRel);
        if old != 0 {
            unsafe {
                self.device
                    .raw()
                    .destroy_pipeline(vk::Pipeline::from_raw(old), None)
            };
        }
        Ok(())
    }
}

// STRICT TEARDOWN ORDER: pipeline, layout, set layout, pool (frees its sets).
impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        self.destroy_raw();
        let d = self.device.raw();
        unsafe {
            d.destroy_pipeline_layout(self.layout, None);
            d.destroy_descriptor_set_layout(self.set_layout, None);
            d.destroy_descriptor_pool(self.descriptor_pool, None);
        }
    }
}

/// Builds real pipelines against the main and shadow passes. The passes
/// and the texture set layout are owned by the renderer and must outlive
/// every pipeline this factory creates.
pub struct VkPipelineFactory {
    device: Arc<DeviceContext>,
    shaders: Arc<ShaderCatalog>,
    main: PassInfo,
    shadow: PassInfo,
    shadow_extent: vk::Extent2D,
    texture_layout: vk::DescriptorSetLayout,
}

impl VkPipelineFactory {
    pub fn new(
        device: &Arc<DeviceContext>,
        shaders: Arc<ShaderCatalog>,
        main: PassInfo,
        shadow: PassInfo,
        shadow_extent: vk::Extent2D,
        texture_layout: vk::DescriptorSetLayout,
    ) -> Self {
        Self {
            device: Arc::clone(device),
            shaders,
            main,
            shadow,
            shadow_extent,
            texture_layout,
        }
    }
}

impl PipelineFactory for VkPipelineFactory {
    type Pipeline = GraphicsPipeline;

    fn create(
        &self,
        key: PipelineKey,
        config: &'static PipelineConfig,
        extent: vk::Extent2D,
    ) -> VkResult<GraphicsPipeline> {
        let (pass, extent, texture_layout) = match config.target {
            PassTarget::Swapchain => (self.main, extent, Some(self.texture_layout)),
            PassTarget::Shadow => (self.shadow, self.shadow_extent, None),
        };
        let stages = self.shaders.stages(key.shader)?;
        GraphicsPipeline::new(
            &self.device,
            key,
            config,
            stages,
            pass,
            texture_layout,
            extent,
        )
    }

    fn destroy_swapchain_resources(&self, pipeline: &GraphicsPipeline) {
        pipeline.destroy_raw();
    }

    fn create_swapchain_resources(
        &self,
        pipeline: &GraphicsPipeline,
        extent: vk::Extent2D,
    ) -> VkResult<()> {
        pipeline.rebuild(extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_vertex_format() {
        let b = vertex_bindings();
        assert_eq!(b.stride, 56);
        let attrs = vertex_attributes();
        let offsets: Vec<u32> = attrs.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 20, 32, 44]);
        assert_eq!(attrs[1].format, vk::Format::R32G32_SFLOAT);
        assert!(attrs.iter().enumerate().all(|(i, a)| a.location == i as u32));
    }

    #[test]
    fn inverted_viewport_starts_at_the_bottom() {
        let e = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let v = viewport(e, true);
        assert_eq!(v.y, 600.0);
        assert_eq!(v.height, -600.0);
        let v = viewport(e, false);
        assert_eq!(v.y, 0.0);
        assert_eq!(v.height, 600.0);
    }
}
