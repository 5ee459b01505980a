// SPDX-License-Identifier: CEPL-1.0
use crate::device::DeviceContext;
use crate::error::{VkContext, VkResult};
use ash::vk;
use std::sync::Arc;

pub fn sampler_info(
    address: vk::SamplerAddressMode,
    max_anisotropy: f32,
    mip_levels: u32,
) -> vk::SamplerCreateInfo<'static> {
    vk::SamplerCreateInfo {
        s_type: vk::StructureType::SAMPLER_CREATE_INFO,
        mag_filter: vk::Filter::LINEAR,
        min_filter: vk::Filter::LINEAR,
        address_mode_u: address,
        address_mode_v: address,
        address_mode_w: address,
        anisotropy_enable: vk::TRUE,
        max_anisotropy,
        border_color: vk::BorderColor::INT_OPAQUE_WHITE,
        unnormalized_coordinates: vk::FALSE,
        compare_enable: vk::FALSE,
        compare_op: vk::CompareOp::ALWAYS,
        mipmap_mode: vk::SamplerMipmapMode::LINEAR,
        mip_lod_bias: 0.0,
        min_lod: 0.0,
        max_lod: mip_levels as f32,
        ..Default::default()
    }
}

pub struct Sampler {
    device: Arc<DeviceContext>,
    raw: vk::Sampler,
}

impl Sampler {
    /// Linear, anisotropic at the device maximum, LOD clamped to `mip_levels`.
    pub fn new(
        device: &Arc<DeviceContext>,
        address: vk::SamplerAddressMode,
        mip_levels: u32,
    ) -> VkResult<Self> {
        let info = sampler_info(address, device.max_anisotropy(), mip_levels);
        let raw = unsafe { device.raw().create_sampler(&info, None) }.vk_op("create_sampler")?;
        Ok(Self {
            device: Arc::clone(device),
            raw,
        })
    }

    pub fn raw(&self) -> vk::Sampler {
        self.raw
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe { self.device.raw().destroy_sampler(self.raw, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_uses_address_mode_on_every_axis() {
        let info = sampler_info(vk::SamplerAddressMode::CLAMP_TO_EDGE, 16.0, 9);
        assert_eq!(info.address_mode_u, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(info.address_mode_w, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(info.max_anisotropy, 16.0);
        assert_eq!(info.max_lod, 9.0);
        assert_eq!(info.mipmap_mode, vk::SamplerMipmapMode::LINEAR);
    }
}
