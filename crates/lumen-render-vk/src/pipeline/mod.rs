// SPDX-License-Identifier: CEPL-1.0
mod config;
mod graphics;
mod store;

pub use config::{
    pipeline_config, vk_topology, PassTarget, PipelineBinding, PipelineConfig, DEFAULT_BINDINGS,
    SHADOW_BINDINGS,
};
pub use graphics::{DescriptorWrite, GraphicsPipeline, PassInfo, VkPipelineFactory};
pub use store::{PipelineFactory, PipelineKey, PipelineStore};

/// The store as the renderer uses it.
pub type VkPipelineStore = PipelineStore<VkPipelineFactory>;
