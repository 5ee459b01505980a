// SPDX-License-Identifier: CEPL-1.0
//! Decoded texture formats and their Vulkan counterparts.
use crate::buffer::Buffer;
use crate::device::DeviceContext;
use crate::error::{VkError, VkResult};
use crate::image::{Image, ImageDesc};
use crate::sampler::Sampler;
use ash::vk;
use lumen_render::{TextureAddress, TextureFormat, TextureUpload};
use std::sync::Arc;
use tracing::{debug, warn};

pub fn vk_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::A8 | TextureFormat::L8 => vk::Format::R8_UNORM,
        TextureFormat::A8L8 | TextureFormat::U8V8 => vk::Format::R8G8_UNORM,
        TextureFormat::R5G6B5 => vk::Format::B5G6R5_UNORM_PACK16,
        TextureFormat::A4R4G4B4 => vk::Format::B4G4R4A4_UNORM_PACK16,
        TextureFormat::R8G8B8 | TextureFormat::A8R8G8B8 => vk::Format::B8G8R8A8_SRGB,
        TextureFormat::Dxt1 => vk::Format::BC1_RGB_SRGB_BLOCK,
        TextureFormat::Dxt23 => vk::Format::BC2_SRGB_BLOCK,
        TextureFormat::Dxt45 => vk::Format::BC3_SRGB_BLOCK,
    }
}

/// Routes single- and dual-channel data to the channels shaders read.
pub fn swizzle(format: TextureFormat) -> vk::ComponentMapping {
    use ash::vk::ComponentSwizzle as S;
    let map = |r, g, b, a| vk::ComponentMapping { r, g, b, a };
    match format {
        TextureFormat::A8 => map(S::ONE, S::ONE, S::ONE, S::R),
        TextureFormat::L8 => map(S::R, S::R, S::R, S::ONE),
        TextureFormat::A8L8 => map(S::R, S::R, S::R, S::G),
        _ => map(S::IDENTITY, S::IDENTITY, S::IDENTITY, S::IDENTITY),
    }
}

pub fn is_block_compressed(format: TextureFormat) -> bool {
    matches!(
        format,
        TextureFormat::Dxt1 | TextureFormat::Dxt23 | TextureFormat::Dxt45
    )
}

/// Format the shaders sample. Block-compressed data is decoded to 8-bit sRGB
/// so it can carry a blitted mip chain.
pub fn sampled_format(format: TextureFormat) -> vk::Format {
    if is_block_compressed(format) {
        vk::Format::B8G8R8A8_SRGB
    } else {
        vk_format(format)
    }
}

/// How texel data reaches the sampled image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadPath {
    /// Copied straight into an image of the data's own format.
    Direct,
    /// Copied into a scratch image of the data's format, then blitted into a
    /// `sampled_format` image.
    Decode,
}

impl UploadPath {
    /// `can_blit`: the device blits from the data's format into its
    /// `sampled_format`.
    pub fn choose(format: TextureFormat, can_blit: bool) -> Self {
        if is_block_compressed(format) && can_blit {
            UploadPath::Decode
        } else {
            UploadPath::Direct
        }
    }
}

/// Bytes in mip 0. 24-bit color arrives padded to 32 bits per texel.
pub fn data_size(format: TextureFormat, width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    let blocks = w.div_ceil(4) * h.div_ceil(4);
    match format {
        TextureFormat::A8 | TextureFormat::L8 => w * h,
        TextureFormat::A8L8
        | TextureFormat::U8V8
        | TextureFormat::R5G6B5
        | TextureFormat::A4R4G4B4 => w * h * 2,
        TextureFormat::R8G8B8 | TextureFormat::A8R8G8B8 => w * h * 4,
        TextureFormat::Dxt1 => blocks * 8,
        TextureFormat::Dxt23 | TextureFormat::Dxt45 => blocks * 16,
    }
}

pub fn address_mode(address: TextureAddress) -> vk::SamplerAddressMode {
    match address {
        TextureAddress::Repeat => vk::SamplerAddressMode::REPEAT,
        TextureAddress::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
    }
}

const CHECKER_SIZE: u32 = 4;

/// 4×4 magenta/black checker in A8R8G8B8 (BGRA byte order).
pub fn checker_texture() -> Vec<u8> {
    const MAGENTA: [u8; 4] = [0xFF, 0x00, 0xFF, 0xFF];
    const BLACK: [u8; 4] = [0x00, 0x00, 0x00, 0xFF];
    (0..CHECKER_SIZE * CHECKER_SIZE)
        .flat_map(|i| {
            let (x, y) = (i % CHECKER_SIZE, i / CHECKER_SIZE);
            if (x + y) % 2 == 0 {
                MAGENTA
            } else {
                BLACK
            }
        })
        .collect()
}

pub fn checker_upload(data: &[u8]) -> TextureUpload<'_> {
    TextureUpload {
        width: CHECKER_SIZE,
        height: CHECKER_SIZE,
        format: TextureFormat::A8R8G8B8,
        data,
        generate_mips: false,
        address: TextureAddress::Repeat,
    }
}

/// A sampled image plus the sampler it is registered with.
pub struct GpuTexture {
    image: Image,
    sampler: Sampler,
}

impl GpuTexture {
    /// Stages `upload.data`, copies it into a device-local image and builds
    /// mips when asked and possible.
    pub fn upload(device: &Arc<DeviceContext>, upload: &TextureUpload<'_>) -> VkResult<Self> {
        let source = vk_format(upload.format);
        let target = sampled_format(upload.format);
        let expected = data_size(upload.format, upload.width, upload.height);
        if upload.data.len() < expected {
            return Err(VkError::TextureSize {
                format: upload.format,
                expected,
                actual: upload.data.len(),
            });
        }
        let can_blit = device.format_supports(source, vk::FormatFeatureFlags::BLIT_SRC)
            && device.format_supports(target, vk::FormatFeatureFlags::BLIT_DST);
        let path = UploadPath::choose(upload.format, can_blit);
        let compressed_direct = path == UploadPath::Direct && is_block_compressed(upload.format);
        if compressed_direct {
            warn!("{source:?} cannot be blitted to {target:?}; sampling it compressed without mips");
        }
        let mut mipmapped = upload.generate_mips && !compressed_direct;
        if mipmapped && !device.supports_linear_blit(target) {
            warn!("{target:?} cannot be blitted linearly; uploading without mips");
            mipmapped = false;
        }

        let staging = Buffer::<u8>::staging_with(device, &upload.data[..expected])?;
        let usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST;
        let mut image = match path {
            UploadPath::Direct => {
                let desc = ImageDesc::new(upload.width, upload.height, source, usage)
                    .mipmapped(mipmapped);
                let image = Image::new(device, desc)?;
                image.upload(&staging)?;
                image
            }
            UploadPath::Decode => {
                let scratch = Image::new(
                    device,
                    ImageDesc::new(
                        upload.width,
                        upload.height,
                        source,
                        vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST,
                    ),
                )?;
                scratch.upload_for_blit(&staging)?;
                let desc = ImageDesc::new(upload.width, upload.height, target, usage)
                    .mipmapped(mipmapped);
                let image = Image::new(device, desc)?;
                image.blit_from(&scratch)?;
                image
            }
        };
        image.create_view(swizzle(upload.format))?;
        let sampler = Sampler::new(device, address_mode(upload.address), image.mip_levels())?;
        debug!(
            "texture uploaded: {}x{} {:?} via {path:?} as {:?} mips={}",
            upload.width,
            upload.height,
            upload.format,
            image.format(),
            image.mip_levels()
        );
        Ok(Self { image, sampler })
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.image.view()
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_table() {
        assert_eq!(vk_format(TextureFormat::L8), vk::Format::R8_UNORM);
        assert_eq!(vk_format(TextureFormat::U8V8), vk::Format::R8G8_UNORM);
        assert_eq!(
            vk_format(TextureFormat::A4R4G4B4),
            vk::Format::B4G4R4A4_UNORM_PACK16
        );
        assert_eq!(vk_format(TextureFormat::R8G8B8), vk::Format::B8G8R8A8_SRGB);
        assert_eq!(vk_format(TextureFormat::Dxt45), vk::Format::BC3_SRGB_BLOCK);
    }

    #[test]
    fn single_channel_swizzles() {
        let a8 = swizzle(TextureFormat::A8);
        assert_eq!(a8.a, vk::ComponentSwizzle::R);
        assert_eq!(a8.r, vk::ComponentSwizzle::ONE);
        let l8 = swizzle(TextureFormat::L8);
        assert_eq!((l8.r, l8.g, l8.b), (vk::ComponentSwizzle::R, vk::ComponentSwizzle::R, vk::ComponentSwizzle::R));
        assert_eq!(swizzle(TextureFormat::A8L8).a, vk::ComponentSwizzle::G);
        assert_eq!(swizzle(TextureFormat::Dxt1).r, vk::ComponentSwizzle::IDENTITY);
    }

    #[test]
    fn compressed_sizes_round_up_to_blocks() {
        assert_eq!(data_size(TextureFormat::Dxt1, 4, 4), 8);
        assert_eq!(data_size(TextureFormat::Dxt1, 5, 5), 4 * 8);
        assert_eq!(data_size(TextureFormat::Dxt45, 1, 1), 16);
        assert_eq!(data_size(TextureFormat::A8L8, 3, 2), 12);
        assert_eq!(data_size(TextureFormat::R8G8B8, 2, 2), 16);
    }

    #[test]
    fn compressed_data_decodes_to_srgb_when_blittable() {
        assert_eq!(sampled_format(TextureFormat::Dxt1), vk::Format::B8G8R8A8_SRGB);
        assert_eq!(sampled_format(TextureFormat::Dxt45), vk::Format::B8G8R8A8_SRGB);
        assert_eq!(sampled_format(TextureFormat::L8), vk::Format::R8_UNORM);

        assert_eq!(UploadPath::choose(TextureFormat::Dxt23, true), UploadPath::Decode);
        assert_eq!(UploadPath::choose(TextureFormat::Dxt23, false), UploadPath::Direct);
        assert_eq!(UploadPath::choose(TextureFormat::A8R8G8B8, true), UploadPath::Direct);
    }

    #[test]
    fn checker_alternates_magenta_and_black() {
        let px = checker_texture();
        assert_eq!(px.len(), data_size(TextureFormat::A8R8G8B8, 4, 4));
        assert_eq!(&px[0..4], &[0xFF, 0x00, 0xFF, 0xFF]);
        assert_eq!(&px[4..8], &[0x00, 0x00, 0x00, 0xFF]);
        // row 1 starts black
        assert_eq!(&px[16..20], &[0x00, 0x00, 0x00, 0xFF]);
        let up = checker_upload(&px);
        assert_eq!((up.width, up.height), (4, 4));
    }
}
