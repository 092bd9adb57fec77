use bytemuck::{Pod, Zeroable};
use warpconfig::DistortionTable;

use crate::source::Eye;

/// Lens correction applied by the warp. Coordinates are eye-viewport UVs in
/// `[0, 1]`.
pub trait Distortion: Send + Sync {
    fn distort(&self, eye: Eye, u: f32, v: f32) -> (f32, f32);

    /// Red, green and blue sample positions. Defaults to no colour separation.
    fn distort_chromatic(&self, eye: Eye, u: f32, v: f32) -> [(f32, f32); 3] {
        let sample = self.distort(eye, u, v);
        [sample; 3]
    }
}

/// Radial polynomial `scale(r²) = k0 + k1·r² + k2·r⁴ + …` around the lens
/// centre, with fixed per-channel scale for chromatic aberration.
#[derive(Debug, Clone, PartialEq)]
pub struct PolynomialDistortion {
    coefficients: Vec<f32>,
    chromatic: [f32; 2],
    lens_separation: f32,
}

impl PolynomialDistortion {
    pub fn new(coefficients: Vec<f32>, chromatic: [f32; 2], lens_separation: f32) -> Self {
        Self {
            coefficients,
            chromatic,
            lens_separation,
        }
    }

    pub fn from_table(table: &DistortionTable) -> Self {
        Self::new(
            table.coefficients.clone(),
            table.chromatic,
            table.lens_separation,
        )
    }

    /// Lens centre in the eye's viewport. Lenses `lens_separation` screen
    /// widths apart sit symmetrically about the screen centre.
    fn lens_center(&self, eye: Eye) -> (f32, f32) {
        let inset = 1.0 - self.lens_separation;
        match eye {
            Eye::Left => (inset, 0.5),
            Eye::Right => (1.0 - inset, 0.5),
        }
    }

    fn scale(&self, radius_squared: f32) -> f32 {
        self.coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, k| acc * radius_squared + k)
    }

    fn scaled(&self, eye: Eye, u: f32, v: f32, channel: f32) -> (f32, f32) {
        let (cx, cy) = self.lens_center(eye);
        let (dx, dy) = (u - cx, v - cy);
        let scale = self.scale(dx * dx + dy * dy) * channel;
        (cx + dx * scale, cy + dy * scale)
    }
}

impl Distortion for PolynomialDistortion {
    fn distort(&self, eye: Eye, u: f32, v: f32) -> (f32, f32) {
        self.scaled(eye, u, v, 1.0)
    }

    fn distort_chromatic(&self, eye: Eye, u: f32, v: f32) -> [(f32, f32); 3] {
        [
            self.scaled(eye, u, v, self.chromatic[0]),
            self.scaled(eye, u, v, 1.0),
            self.scaled(eye, u, v, self.chromatic[1]),
        ]
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct WarpVertex {
    /// Normalized device coordinates within the eye's viewport.
    pub position: [f32; 2],
    pub uv_red: [f32; 2],
    pub uv_green: [f32; 2],
    pub uv_blue: [f32; 2],
}

/// Tessellated distortion for one eye, drawn as an indexed triangle list.
#[derive(Debug, Clone, PartialEq)]
pub struct EyeMesh {
    pub vertices: Vec<WarpVertex>,
    pub indices: Vec<u32>,
}

/// Distortion sampled once at start-up; every warp draw references it.
#[derive(Debug, Clone, PartialEq)]
pub struct WarpMesh {
    eyes: [EyeMesh; 2],
    tessellation: [u32; 2],
}

impl WarpMesh {
    pub fn build(distortion: &dyn Distortion, tessellation: [u32; 2]) -> Self {
        let [columns, rows] = [tessellation[0].max(1), tessellation[1].max(1)];
        let build_eye = |eye: Eye| {
            let mut vertices = Vec::with_capacity(((columns + 1) * (rows + 1)) as usize);
            for y in 0..=rows {
                for x in 0..=columns {
                    let u = x as f32 / columns as f32;
                    let v = y as f32 / rows as f32;
                    let [red, green, blue] = distortion.distort_chromatic(eye, u, v);
                    vertices.push(WarpVertex {
                        position: [u * 2.0 - 1.0, v * 2.0 - 1.0],
                        uv_red: [red.0, red.1],
                        uv_green: [green.0, green.1],
                        uv_blue: [blue.0, blue.1],
                    });
                }
            }

            let stride = columns + 1;
            let mut indices = Vec::with_capacity((columns * rows * 6) as usize);
            for y in 0..rows {
                for x in 0..columns {
                    let corner = y * stride + x;
                    indices.extend_from_slice(&[
                        corner,
                        corner + 1,
                        corner + stride,
                        corner + 1,
                        corner + stride + 1,
                        corner + stride,
                    ]);
                }
            }
            EyeMesh { vertices, indices }
        };

        Self {
            eyes: [build_eye(Eye::Left), build_eye(Eye::Right)],
            tessellation: [columns, rows],
        }
    }

    pub fn eye(&self, eye: Eye) -> &EyeMesh {
        &self.eyes[eye.index()]
    }

    pub fn tessellation(&self) -> [u32; 2] {
        self.tessellation
    }
}
