// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use lumen_render::ShaderId;
use thiserror::Error;

/// Failures inside the Vulkan core. Everything here except a swapchain that
/// needs recreating (reported as `FrameStatus::NeedsResize`, not an error) is
/// fatal for the owning object.
#[derive(Debug, Error)]
pub enum VkError {
    #[error("failed to load the Vulkan library: {0}")]
    Loader(#[from] ash::LoadingError),

    #[error("no physical device meets the requirements")]
    NoSuitableDevice,

    #[error("required instance layer {0} is not available")]
    MissingLayer(String),

    #[error("no memory type matches bits {type_bits:#b} with {flags:?}")]
    NoMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    #[error("shader {0} has no pipeline configuration")]
    UnconfiguredShader(ShaderId),

    #[error("shader {shader} is missing its {stage} stage ({path})")]
    MissingShaderStage {
        shader: ShaderId,
        stage: &'static str,
        path: String,
    },

    #[error("failed to read shader {path}: {source}")]
    ShaderRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("surface has no area (window minimised)")]
    EmptySurface,

    #[error("buffer is not mapped")]
    NotMapped,

    #[error("buffer is already mapped")]
    AlreadyMapped,

    #[error("index {index} out of range for buffer of {count} items")]
    OutOfRange { index: u64, count: u64 },

    #[error("unsupported layout transition {old:?} -> {new:?}")]
    UnsupportedTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("image layout mismatch: expected {expected:?}, caller passed {actual:?}")]
    LayoutMismatch {
        expected: vk::ImageLayout,
        actual: vk::ImageLayout,
    },

    #[error("the main pass resolves into the swapchain and needs at least 2 samples, got {0:?}")]
    SingleSampleMainPass(vk::SampleCountFlags),

    #[error("format {0:?} cannot take part in an image blit")]
    BlitUnsupported(vk::Format),

    #[error("format {0:?} does not support linear blits")]
    LinearBlitUnsupported(vk::Format),

    #[error("texture data is {actual} bytes, {format:?} at that size needs {expected}")]
    TextureSize {
        format: lumen_render::TextureFormat,
        expected: usize,
        actual: usize,
    },

    #[error("texture table is full ({capacity} slots)")]
    TextureSetFull { capacity: u32 },

    #[error("{op} failed: {result}")]
    Vulkan {
        op: &'static str,
        result: vk::Result,
    },
}

pub type VkResult<T> = Result<T, VkError>;

/// Tags a raw `vk::Result` with the call that produced it.
pub(crate) trait VkContext<T> {
    fn vk_op(self, op: &'static str) -> VkResult<T>;
}

impl<T> VkContext<T> for Result<T, vk::Result> {
    fn vk_op(self, op: &'static str) -> VkResult<T> {
        self.map_err(|result| VkError::Vulkan { op, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_op_keeps_the_call_name() {
        let r: Result<(), vk::Result> = Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        match r.vk_op("allocate_memory") {
            Err(VkError::Vulkan { op, result }) => {
                assert_eq!(op, "allocate_memory");
                assert_eq!(result, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unconfigured_shader_names_the_shader() {
        let e = VkError::UnconfiguredShader(ShaderId::Pointviz);
        assert_eq!(e.to_string(), "shader Pointviz has no pipeline configuration");
    }
}
