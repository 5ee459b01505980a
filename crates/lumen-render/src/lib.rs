// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use lumen_core::RenderConfig;
use lumen_math::{GenericUniform, GlobalUniform, TransformUniform, VertexFormat};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Shader programs known to the engine. Not every one has a GPU pipeline
/// configuration on every backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderId {
    Skybox,
    Generic,
    Wireframe,
    ShadowMapping,
    TextureViewer,
    Pointviz,
    Voxelize,
    Depth,
}

impl ShaderId {
    /// Directory and file stem used for the compiled stages.
    pub fn name(self) -> &'static str {
        match self {
            ShaderId::Skybox => "Skybox",
            ShaderId::Generic => "Generic",
            ShaderId::Wireframe => "Wireframe",
            ShaderId::ShadowMapping => "ShadowMapping",
            ShaderId::TextureViewer => "TextureViewer",
            ShaderId::Pointviz => "Pointviz",
            ShaderId::Voxelize => "Voxelize",
            ShaderId::Depth => "Depth",
        }
    }
}

impl fmt::Display for ShaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Primitive layout of a mesh's index data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topology {
    TriangleList,
    TriangleStrip,
    TriangleStripDecal,
    PolygonList,
    Point,
}

/// Index into the bindless texture table. Slot 0 is the fallback texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureSlot(pub u32);

impl TextureSlot {
    pub const FALLBACK: TextureSlot = TextureSlot(0);

    pub fn index(self) -> u32 {
        self.0
    }
}

/// Result of acquiring or presenting a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Ok,
    /// Swapchain is out of date or suboptimal; run the resize path and retry.
    NeedsResize,
}

/// Pixel formats of decoded texture data handed to the renderer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    A8,
    L8,
    A8L8,
    U8V8,
    R5G6B5,
    A4R4G4B4,
    R8G8B8,
    A8R8G8B8,
    Dxt1,
    Dxt23,
    Dxt45,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureAddress {
    Repeat,
    ClampToEdge,
}

#[derive(Clone, Debug)]
pub struct TextureUpload<'a> {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub data: &'a [u8],
    pub generate_mips: bool,
    pub address: TextureAddress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MeshHandle(pub u32);

#[derive(Clone, Copy, Debug)]
pub struct DrawCommand {
    pub shader: ShaderId,
    pub topology: Topology,
    pub mesh: MeshHandle,
    pub transform: TransformUniform,
    pub material: GenericUniform,
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        config: &RenderConfig,
    ) -> Result<Self>
    where
        Self: Sized;

    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn begin_frame(&mut self, globals: &GlobalUniform) -> Result<FrameStatus>;
    fn draw(&mut self, cmd: &DrawCommand) -> Result<()>;
    fn end_frame(&mut self) -> Result<FrameStatus>;
    fn upload_mesh(&mut self, vertices: &[VertexFormat], indices: &[u32]) -> Result<MeshHandle>;
    fn register_texture(&mut self, upload: &TextureUpload<'_>) -> Result<TextureSlot>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_render_target_is_empty() {
        assert!(RenderSize { width: 0, height: 10 }.is_empty());
        assert!(!RenderSize { width: 1, height: 1 }.is_empty());
    }

    #[test]
    fn shader_names_match_display() {
        assert_eq!(ShaderId::ShadowMapping.to_string(), "ShadowMapping");
        assert_eq!(ShaderId::Generic.name(), "Generic");
    }
}
