use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::source::Eye;

/// Per-draw uniform block of the warp program (std140 compatible).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct WarpUniforms {
    /// Texture matrix for the first scanned row of the eye.
    pub warp_start: [[f32; 4]; 4],
    /// Texture matrix for the last scanned row of the eye.
    pub warp_end: [[f32; 4]; 4],
    /// `x`: chromatic correction on (1) or off (0); `y`: eye index.
    pub options: [f32; 4],
}

impl WarpUniforms {
    pub fn new(eye: Eye, warp_start: Mat4, warp_end: Mat4, chromatic: bool) -> Self {
        Self {
            warp_start: warp_start.to_cols_array_2d(),
            warp_end: warp_end.to_cols_array_2d(),
            options: [
                if chromatic { 1.0 } else { 0.0 },
                eye.index() as f32,
                0.0,
                0.0,
            ],
        }
    }

    pub fn chromatic(&self) -> bool {
        self.options[0] != 0.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}
