// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend: device bootstrap, swapchain lifecycle, render passes,
//! cached pipelines, a bindless texture table and the buffer/image
//! primitives underneath them.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod device;
pub mod error;
pub mod image;
pub mod instance;
pub mod pipeline;
pub mod render_pass;
pub mod renderer;
pub mod sampler;
pub mod shader;
pub mod swapchain;
pub mod texture;
pub mod texture_set;

pub use buffer::{Buffer, BufferLayout, BufferSlice};
pub use device::{DeviceContext, PhysicalDeviceChoice, QueueFamilies};
pub use error::{VkError, VkResult};
pub use image::{Image, ImageArray, ImageDesc};
pub use instance::InstanceContext;
pub use pipeline::{GraphicsPipeline, PipelineKey, PipelineStore, VkPipelineStore};
pub use render_pass::{MainRenderPass, ShadowPass};
pub use renderer::VkRenderer;
pub use sampler::Sampler;
pub use shader::ShaderCatalog;
pub use swapchain::{Swapchain, SwapchainState};
pub use texture::GpuTexture;
pub use texture_set::{SlotTable, TextureSet};
