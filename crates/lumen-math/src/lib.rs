// SPDX-License-Identifier: CEPL-1.0
//! GPU-shaped data handed to the renderer by the scene layer.
//!
//! Every struct here is `#[repr(C)]` and laid out to match std140 on the
//! shader side, so field order matters.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
pub use glam::{Mat4, Vec2, Vec3, Vec4};

/// Highest cascade count the shadow uniform can describe.
pub const MAX_CASCADES: usize = 4;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct VertexFormat {
    pub position: Vec3,
    pub tex_coords: Vec2,
    pub normal: Vec3,
    pub tangent: Vec3,
    pub bitangent: Vec3,
}

impl VertexFormat {
    pub const POSITION_OFFSET: usize = std::mem::offset_of!(VertexFormat, position);
    pub const TEX_COORDS_OFFSET: usize = std::mem::offset_of!(VertexFormat, tex_coords);
    pub const NORMAL_OFFSET: usize = std::mem::offset_of!(VertexFormat, normal);
    pub const TANGENT_OFFSET: usize = std::mem::offset_of!(VertexFormat, tangent);
    pub const BITANGENT_OFFSET: usize = std::mem::offset_of!(VertexFormat, bitangent);

    /// Tangent space defaults to ones when the source mesh has none.
    pub fn new(position: Vec3, tex_coords: Vec2, normal: Vec3) -> Self {
        Self {
            position,
            tex_coords,
            normal,
            tangent: Vec3::ONE,
            bitangent: Vec3::ONE,
        }
    }
}

/// Per-frame data bound at set 0, binding 0.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GlobalUniform {
    pub projection: Mat4,
    pub view: Mat4,
    pub view_position: Vec3,
    pub time: f32,
    pub sun_direction: Vec3,
    pub point_light_count: u32,
}

impl Default for GlobalUniform {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            view_position: Vec3::ZERO,
            time: 0.0,
            sun_direction: Vec3::new(0.0, 0.0, -1.0),
            point_light_count: 0,
        }
    }
}

/// Per-draw data, bound through the dynamic uniform at binding 1.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TransformUniform {
    pub model: Mat4,
    pub normal_matrix: Mat4,
}

impl TransformUniform {
    pub fn new(model: Mat4) -> Self {
        Self {
            model,
            normal_matrix: model.inverse().transpose(),
        }
    }
}

impl Default for TransformUniform {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ShadowUniform {
    pub cascade_view_proj: [Mat4; MAX_CASCADES],
    pub cascade_splits: Vec4,
}

impl Default for ShadowUniform {
    fn default() -> Self {
        Self {
            cascade_view_proj: [Mat4::IDENTITY; MAX_CASCADES],
            cascade_splits: Vec4::ZERO,
        }
    }
}

bitflags! {
    /// Which texture slots of a [`GenericUniform`] the shader should sample.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MaterialFlags: u32 {
        const DIFFUSE      = 1 << 0;
        const ALPHA        = 1 << 1;
        const SPECULAR     = 1 << 2;
        const NORMAL_MAP   = 1 << 3;
        const EMISSIVE     = 1 << 4;
        const DETAIL_1     = 1 << 5;
        const DETAIL_2     = 1 << 6;
        const COLOR_CHANGE = 1 << 7;
    }
}

/// Texture table slots for a material. `None` leaves the feature off.
#[derive(Clone, Copy, Debug, Default)]
pub struct MaterialBindings {
    pub diffuse: Option<u32>,
    pub alpha: Option<u32>,
    pub normal: Option<u32>,
    pub emissive: Option<u32>,
    pub detail_1: Option<u32>,
    pub detail_2: Option<u32>,
    pub color_change: Option<u32>,
}

/// Material data for the generic shader, bound at binding 2.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GenericUniform {
    pub diffuse_color: Vec4,
    pub alpha_channel: Vec4,
    pub normal_map_scale: Vec4,
    pub emissive_arguments: Vec4,
    pub detail_1_scale: Vec4,
    pub detail_2_scale: Vec4,
    pub color_change_color: Vec4,
    pub flags: u32,
    pub diffuse_slot: u32,
    pub alpha_slot: u32,
    pub normal_slot: u32,
    pub emissive_slot: u32,
    pub detail_1_slot: u32,
    pub detail_2_slot: u32,
    pub color_change_slot: u32,
}

impl GenericUniform {
    pub fn new(diffuse_color: Vec4, bindings: &MaterialBindings) -> Self {
        let mut flags = MaterialFlags::empty();
        let mut slot = |s: Option<u32>, f: MaterialFlags| match s {
            Some(idx) => {
                flags |= f;
                idx
            }
            None => 0,
        };

        let diffuse_slot = slot(bindings.diffuse, MaterialFlags::DIFFUSE);
        let alpha_slot = slot(bindings.alpha, MaterialFlags::ALPHA);
        let normal_slot = slot(bindings.normal, MaterialFlags::NORMAL_MAP);
        let emissive_slot = slot(bindings.emissive, MaterialFlags::EMISSIVE);
        let detail_1_slot = slot(bindings.detail_1, MaterialFlags::DETAIL_1);
        let detail_2_slot = slot(bindings.detail_2, MaterialFlags::DETAIL_2);
        let color_change_slot = slot(bindings.color_change, MaterialFlags::COLOR_CHANGE);

        Self {
            diffuse_color,
            alpha_channel: Vec4::new(0.0, 0.0, 0.0, 1.0),
            normal_map_scale: Vec4::ONE,
            emissive_arguments: Vec4::ZERO,
            detail_1_scale: Vec4::ONE,
            detail_2_scale: Vec4::ONE,
            color_change_color: Vec4::ZERO,
            flags: flags.bits(),
            diffuse_slot,
            alpha_slot,
            normal_slot,
            emissive_slot,
            detail_1_slot,
            detail_2_slot,
            color_change_slot,
        }
    }

    pub fn material_flags(&self) -> MaterialFlags {
        MaterialFlags::from_bits_truncate(self.flags)
    }
}

impl Default for GenericUniform {
    fn default() -> Self {
        Self::new(Vec4::ONE, &MaterialBindings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(size_of::<VertexFormat>(), 56);
        assert_eq!(VertexFormat::POSITION_OFFSET, 0);
        assert_eq!(VertexFormat::TEX_COORDS_OFFSET, 12);
        assert_eq!(VertexFormat::NORMAL_OFFSET, 20);
        assert_eq!(VertexFormat::TANGENT_OFFSET, 32);
        assert_eq!(VertexFormat::BITANGENT_OFFSET, 44);
    }

    #[test]
    fn uniforms_are_std140_sized() {
        for size in [
            size_of::<GlobalUniform>(),
            size_of::<TransformUniform>(),
            size_of::<ShadowUniform>(),
            size_of::<GenericUniform>(),
        ] {
            assert_eq!(size % 16, 0, "size {size} not a multiple of 16");
        }
    }

    #[test]
    fn generic_uniform_sets_flags_for_bound_slots() {
        let u = GenericUniform::new(
            Vec4::ONE,
            &MaterialBindings {
                diffuse: Some(7),
                normal: Some(9),
                ..Default::default()
            },
        );
        assert_eq!(
            u.material_flags(),
            MaterialFlags::DIFFUSE | MaterialFlags::NORMAL_MAP
        );
        assert_eq!(u.diffuse_slot, 7);
        assert_eq!(u.normal_slot, 9);
        assert_eq!(u.alpha_slot, 0);
    }

    #[test]
    fn normal_matrix_of_identity_is_identity() {
        let t = TransformUniform::default();
        assert_eq!(t.normal_matrix, Mat4::IDENTITY);
    }

    #[test]
    fn uniforms_cast_to_bytes() {
        let g = GlobalUniform::default();
        assert_eq!(bytemuck::bytes_of(&g).len(), size_of::<GlobalUniform>());
    }
}
