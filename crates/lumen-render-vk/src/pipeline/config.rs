// SPDX-License-Identifier: CEPL-1.0
//! Hand-authored per-shader pipeline settings. A shader that is not listed
//! here cannot be drawn on this backend.
use ash::vk;
use lumen_render::{ShaderId, Topology};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
}

const fn bind(binding: u32, ty: vk::DescriptorType) -> PipelineBinding {
    PipelineBinding { binding, ty }
}

/// Globals, per-draw transform and material (dynamic offsets), shadow map.
pub const DEFAULT_BINDINGS: &[PipelineBinding] = &[
    bind(0, vk::DescriptorType::UNIFORM_BUFFER),
    bind(1, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC),
    bind(2, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC),
    bind(16, vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
];

/// Cascade matrices and per-draw transform.
pub const SHADOW_BINDINGS: &[PipelineBinding] = &[
    bind(0, vk::DescriptorType::UNIFORM_BUFFER),
    bind(1, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassTarget {
    /// Main pass; sized by the swapchain and rebuilt on resize.
    Swapchain,
    /// Fixed-size shadow pass.
    Shadow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    pub bindings: &'static [PipelineBinding],
    pub max_sets: u32,
    /// Requested count; the pass's own sample count caps it.
    pub samples: u32,
    pub invert_y: bool,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub depth_test: bool,
    pub target: PassTarget,
}

impl PipelineConfig {
    pub fn targets_swapchain(&self) -> bool {
        self.target == PassTarget::Swapchain
    }

    pub fn descriptor_type(&self, binding: u32) -> Option<vk::DescriptorType> {
        self.bindings
            .iter()
            .find(|b| b.binding == binding)
            .map(|b| b.ty)
    }

    /// One pool size per descriptor type, scaled by `max_sets`.
    pub fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for b in self.bindings {
            match sizes.iter_mut().find(|s| s.ty == b.ty) {
                Some(s) => s.descriptor_count += self.max_sets,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty: b.ty,
                    descriptor_count: self.max_sets,
                }),
            }
        }
        sizes
    }

    pub fn dynamic_binding_count(&self) -> usize {
        self.bindings
            .iter()
            .filter(|b| b.ty == vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
            .count()
    }
}

const BASE: PipelineConfig = PipelineConfig {
    bindings: DEFAULT_BINDINGS,
    max_sets: 16384,
    samples: 8,
    invert_y: true,
    polygon_mode: vk::PolygonMode::FILL,
    cull_mode: vk::CullModeFlags::BACK,
    depth_test: true,
    target: PassTarget::Swapchain,
};

static SKYBOX: PipelineConfig = PipelineConfig {
    max_sets: 64,
    depth_test: false,
    ..BASE
};

static GENERIC: PipelineConfig = BASE;

static WIREFRAME: PipelineConfig = PipelineConfig {
    max_sets: 4096,
    polygon_mode: vk::PolygonMode::LINE,
    ..BASE
};

static SHADOW_MAPPING: PipelineConfig = PipelineConfig {
    bindings: SHADOW_BINDINGS,
    samples: 1,
    invert_y: false,
    target: PassTarget::Shadow,
    ..BASE
};

pub fn pipeline_config(shader: ShaderId) -> Option<&'static PipelineConfig> {
    match shader {
        ShaderId::Skybox => Some(&SKYBOX),
        ShaderId::Generic => Some(&GENERIC),
        ShaderId::Wireframe => Some(&WIREFRAME),
        ShaderId::ShadowMapping => Some(&SHADOW_MAPPING),
        ShaderId::TextureViewer | ShaderId::Pointviz | ShaderId::Voxelize | ShaderId::Depth => {
            None
        }
    }
}

/// Vulkan topology and whether primitive restart is on. Polygon lists are
/// pre-triangulated upstream and drawn as plain triangle lists.
pub fn vk_topology(topology: Topology) -> (vk::PrimitiveTopology, bool) {
    match topology {
        Topology::TriangleList | Topology::PolygonList => {
            (vk::PrimitiveTopology::TRIANGLE_LIST, false)
        }
        Topology::TriangleStrip | Topology::TriangleStripDecal => {
            (vk::PrimitiveTopology::TRIANGLE_STRIP, true)
        }
        Topology::Point => (vk::PrimitiveTopology::POINT_LIST, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_shaders() {
        for s in [
            ShaderId::Skybox,
            ShaderId::Generic,
            ShaderId::Wireframe,
            ShaderId::ShadowMapping,
        ] {
            assert!(pipeline_config(s).is_some(), "{s}");
        }
        for s in [
            ShaderId::TextureViewer,
            ShaderId::Pointviz,
            ShaderId::Voxelize,
            ShaderId::Depth,
        ] {
            assert!(pipeline_config(s).is_none(), "{s}");
        }
    }

    #[test]
    fn only_shadow_mapping_targets_the_shadow_pass() {
        let shadow = pipeline_config(ShaderId::ShadowMapping).unwrap();
        assert!(!shadow.targets_swapchain());
        assert_eq!(shadow.samples, 1);
        assert!(!shadow.invert_y);
        assert!(pipeline_config(ShaderId::Generic).unwrap().targets_swapchain());
    }

    #[test]
    fn per_shader_overrides() {
        let sky = pipeline_config(ShaderId::Skybox).unwrap();
        assert!(!sky.depth_test);
        assert_eq!(sky.max_sets, 64);
        let wire = pipeline_config(ShaderId::Wireframe).unwrap();
        assert_eq!(wire.polygon_mode, vk::PolygonMode::LINE);
        assert_eq!(wire.max_sets, 4096);
    }

    #[test]
    fn pool_sizes_group_by_type() {
        let cfg = pipeline_config(ShaderId::Generic).unwrap();
        let sizes = cfg.pool_sizes();
        assert_eq!(sizes.len(), 3);
        let dynamic = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
            .unwrap();
        assert_eq!(dynamic.descriptor_count, 2 * 16384);
        assert_eq!(cfg.dynamic_binding_count(), 2);
        assert_eq!(
            cfg.descriptor_type(16),
            Some(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        );
        assert_eq!(cfg.descriptor_type(5), None);
    }

    #[test]
    fn strips_enable_primitive_restart() {
        assert_eq!(
            vk_topology(Topology::TriangleStrip),
            (vk::PrimitiveTopology::TRIANGLE_STRIP, true)
        );
        assert_eq!(
            vk_topology(Topology::TriangleStripDecal),
            (vk::PrimitiveTopology::TRIANGLE_STRIP, true)
        );
        assert_eq!(
            vk_topology(Topology::PolygonList),
            (vk::PrimitiveTopology::TRIANGLE_LIST, false)
        );
        assert_eq!(
            vk_topology(Topology::Point),
            (vk::PrimitiveTopology::POINT_LIST, false)
        );
    }
}
