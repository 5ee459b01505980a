// SPDX-License-Identifier: CEPL-1.0
use crate::device::DeviceContext;
use crate::error::{VkContext, VkError, VkResult};
use ash::util::read_spv;
use ash::vk;
use dashmap::DashMap;
use lumen_render::ShaderId;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// `{root}/{name}/{name}.vk.{ext}.spv`
pub fn stage_path(root: &Path, shader: ShaderId, ext: &str) -> PathBuf {
    let name = shader.name();
    root.join(name).join(format!("{name}.vk.{ext}.spv"))
}

/// Depth-only shaders have no color output and may omit the fragment stage.
pub fn fragment_required(shader: ShaderId) -> bool {
    !matches!(shader, ShaderId::ShadowMapping)
}

/// SPIR-V words for each stage of one shader.
#[derive(Debug)]
pub struct StageCode {
    pub vertex: Vec<u32>,
    pub geometry: Option<Vec<u32>>,
    pub fragment: Option<Vec<u32>>,
}

fn read_stage(path: &Path) -> VkResult<Option<Vec<u32>>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(VkError::ShaderRead {
                path: path.display().to_string(),
                source,
            })
        }
    };
    read_spv(&mut file)
        .map(Some)
        .map_err(|source| VkError::ShaderRead {
            path: path.display().to_string(),
            source,
        })
}

pub fn load_stage_code(root: &Path, shader: ShaderId) -> VkResult<StageCode> {
    let vert_path = stage_path(root, shader, "vert");
    let vertex = read_stage(&vert_path)?.ok_or_else(|| VkError::MissingShaderStage {
        shader,
        stage: "vertex",
        path: vert_path.display().to_string(),
    })?;
    let geometry = read_stage(&stage_path(root, shader, "geom"))?;
    let frag_path = stage_path(root, shader, "frag");
    let fragment = read_stage(&frag_path)?;
    if fragment.is_none() && fragment_required(shader) {
        return Err(VkError::MissingShaderStage {
            shader,
            stage: "fragment",
            path: frag_path.display().to_string(),
        });
    }
    Ok(StageCode {
        vertex,
        geometry,
        fragment,
    })
}

/// Compiled shader modules for one program.
pub struct ShaderStages {
    device: Arc<DeviceContext>,
    modules: Vec<(vk::ShaderStageFlags, vk::ShaderModule)>,
}

impl ShaderStages {
    fn new(device: &Arc<DeviceContext>, code: &StageCode) -> VkResult<Self> {
        let mut stages = Self {
            device: Arc::clone(device),
            modules: Vec::with_capacity(3),
        };
        let all = [
            (vk::ShaderStageFlags::VERTEX, Some(&code.vertex)),
            (vk::ShaderStageFlags::GEOMETRY, code.geometry.as_ref()),
            (vk::ShaderStageFlags::FRAGMENT, code.fragment.as_ref()),
        ];
        for (stage, words) in all {
            let Some(words) = words else { continue };
            let ci = vk::ShaderModuleCreateInfo {
                s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
                code_size: words.len() * 4,
                p_code: words.as_ptr(),
                ..Default::default()
            };
            // earlier modules are released by Drop if this fails
            let module = unsafe { device.raw().create_shader_module(&ci, None) }
                .vk_op("create_shader_module")?;
            stages.modules.push((stage, module));
        }
        Ok(stages)
    }

    pub fn has_geometry(&self) -> bool {
        self.modules
            .iter()
            .any(|(s, _)| *s == vk::ShaderStageFlags::GEOMETRY)
    }

    /// Stage infos with entry point `main`, in vertex/geometry/fragment order.
    pub fn stage_infos(&self) -> Vec<vk::PipelineShaderStageCreateInfo<'static>> {
        self.modules
            .iter()
            .map(|&(stage, module)| vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage,
                module,
                p_name: c"main".as_ptr(),
                ..Default::default()
            })
            .collect()
    }
}

impl Drop for ShaderStages {
    fn drop(&mut self) {
        for (_, module) in self.modules.drain(..) {
            unsafe { self.device.raw().destroy_shader_module(module, None) };
        }
    }
}

/// Loads each program's SPIR-V once from disk and keeps the modules around.
pub struct ShaderCatalog {
    device: Arc<DeviceContext>,
    root: PathBuf,
    cache: DashMap<ShaderId, Arc<ShaderStages>>,
}

impl ShaderCatalog {
    pub fn new(device: &Arc<DeviceContext>, root: impl Into<PathBuf>) -> Self {
        Self {
            device: Arc::clone(device),
            root: root.into(),
            cache: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stages(&self, shader: ShaderId) -> VkResult<Arc<ShaderStages>> {
        if let Some(s) = self.cache.get(&shader) {
            return Ok(Arc::clone(s.value()));
        }
        let code = load_stage_code(&self.root, shader)?;
        let stages = Arc::new(ShaderStages::new(&self.device, &code)?);
        debug!(
            "shader {shader} loaded ({} stages) from {}",
            stages.modules.len(),
            self.root.display()
        );
        Ok(Arc::clone(self.cache.entry(shader).or_insert(stages).value()))
    }

    /// Drops cached modules; pipelines built from them keep working.
    pub fn clear(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lumen-shaders-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn write_stage(root: &Path, shader: ShaderId, ext: &str) {
        let path = stage_path(root, shader, ext);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let words = [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn stage_paths_follow_the_naming_scheme() {
        let p = stage_path(Path::new("shaders"), ShaderId::Generic, "frag");
        assert_eq!(p, Path::new("shaders/Generic/Generic.vk.frag.spv"));
    }

    #[test]
    fn only_depth_only_shaders_skip_fragment() {
        assert!(!fragment_required(ShaderId::ShadowMapping));
        assert!(fragment_required(ShaderId::Generic));
        assert!(fragment_required(ShaderId::Skybox));
    }

    #[test]
    fn missing_vertex_stage_is_fatal() {
        let root = scratch("novert");
        let err = load_stage_code(&root, ShaderId::Generic).unwrap_err();
        assert!(matches!(
            err,
            VkError::MissingShaderStage {
                stage: "vertex",
                ..
            }
        ));
    }

    #[test]
    fn missing_fragment_depends_on_shader() {
        let root = scratch("nofrag");
        write_stage(&root, ShaderId::Generic, "vert");
        write_stage(&root, ShaderId::ShadowMapping, "vert");
        write_stage(&root, ShaderId::ShadowMapping, "geom");

        let err = load_stage_code(&root, ShaderId::Generic).unwrap_err();
        assert!(matches!(
            err,
            VkError::MissingShaderStage {
                stage: "fragment",
                ..
            }
        ));

        let code = load_stage_code(&root, ShaderId::ShadowMapping).unwrap();
        assert_eq!(code.vertex[0], SPIRV_MAGIC);
        assert!(code.geometry.is_some());
        assert!(code.fragment.is_none());
        fs::remove_dir_all(&root).unwrap();
    }
}
