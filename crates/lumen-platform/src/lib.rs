// SPDX-License-Identifier: CEPL-1.0
pub use winit;

use winit::{dpi::LogicalSize, window::WindowAttributes};

/// Attributes for the main window; callers create it from an active event loop.
pub fn main_window_attributes(title: &str, width: u32, height: u32) -> WindowAttributes {
    tracing::debug!("window attributes: {title} {width}x{height}");
    WindowAttributes::default()
        .with_title(title)
        .with_inner_size(LogicalSize::new(width.max(1), height.max(1)))
}
